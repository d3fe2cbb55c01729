//! Tresor Engine - Module kernel and meta tree
//!
//! This crate provides:
//! - The module interface and the composition that schedules modules
//! - The meta tree module performing copy-on-write updates
//! - The partial-I/O job and the block stores it drives
//! - A block cache serving the meta tree's node accesses
//! - A formatter for fresh meta trees

pub mod block_store;
pub mod cache;
pub mod composition;
pub mod error;
pub mod initializer;
pub mod io_job;
pub mod meta_tree;
pub mod module;

pub use block_store::{
    BlockStore, FileBlockStore, MemoryBlockStore, MemoryImage, ReadStatus, SyncStatus,
    WriteStatus,
};
pub use cache::{BlockCache, CacheStats, LocalCacheRequest, NodeCache};
pub use composition::ModuleComposition;
pub use error::{EngineError, EngineResult};
pub use initializer::{FormattedTree, format_meta_tree, nr_of_node_blocks};
pub use io_job::{IoJob, IoJobState, IoOperation, PartialResult};
pub use meta_tree::{ChannelState, MetaTree, MetaTreeRequest};
pub use module::{Module, ModuleId, ModuleRequest, ModuleRequestId, RequestHeader};
