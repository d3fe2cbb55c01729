//! Node cache
//!
//! The meta tree fetches and stores its node blocks through a
//! [`LocalCacheRequest`]. That request never passes through the module
//! composition; it is handed directly to a [`NodeCache`], one at a time.
//!
//! [`BlockCache`] is the cache used in practice: an LRU map of blocks in
//! front of a [`BlockStore`], with write-through writes and every store
//! access performed by an [`IoJob`].

use crate::block_store::{BlockStore, block_offset};
use crate::io_job::IoJob;
use std::collections::HashMap;
use tracing::{debug, trace, warn};
use tresor_common::{BLOCK_SIZE, Block, Pba, TreeLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOperation {
    Read,
    Write,
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalCacheRequestState {
    #[default]
    Invalid,
    Pending,
    InProgress,
}

/// A single node-block access against the cache
#[derive(Debug, Clone)]
pub struct LocalCacheRequest {
    pub state: LocalCacheRequestState,
    pub op: CacheOperation,
    pub success: bool,
    pub pba: Pba,
    /// Tree level of the node, for diagnostics
    pub level: TreeLevel,
    pub block: Block,
}

impl LocalCacheRequest {
    fn new(op: CacheOperation, pba: Pba, level: TreeLevel, block: Block) -> Self {
        Self {
            state: LocalCacheRequestState::Pending,
            op,
            success: false,
            pba,
            level,
            block,
        }
    }

    #[must_use]
    pub fn read(pba: Pba, level: TreeLevel) -> Self {
        Self::new(CacheOperation::Read, pba, level, Block::new())
    }

    #[must_use]
    pub fn write(pba: Pba, level: TreeLevel, block: Block) -> Self {
        Self::new(CacheOperation::Write, pba, level, block)
    }

    #[must_use]
    pub fn sync() -> Self {
        Self::new(CacheOperation::Sync, 0, 0, Block::new())
    }
}

impl Default for LocalCacheRequest {
    fn default() -> Self {
        Self {
            state: LocalCacheRequestState::Invalid,
            op: CacheOperation::Read,
            success: false,
            pba: 0,
            level: 0,
            block: Block::new(),
        }
    }
}

/// Block cache as seen by the meta tree
pub trait NodeCache {
    /// Accept a request, false if another one is still in flight
    fn submit(&mut self, req: &LocalCacheRequest) -> bool;

    /// Advance the request in flight, returns whether anything changed
    fn execute(&mut self) -> bool;

    /// Hand back the result of the finished request
    ///
    /// Fills `success` (and `block` for reads) and returns true once the
    /// request in flight has finished; returns false while it is running.
    fn complete(&mut self, req: &mut LocalCacheRequest) -> bool;
}

/// Cache statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writes: u64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

struct CacheEntry {
    block: Block,
    last_access: u64,
}

struct ActiveRequest {
    op: CacheOperation,
    pba: Pba,
    job: Option<IoJob>,
    block: Option<Block>,
    done: bool,
    success: bool,
}

impl ActiveRequest {
    fn finished(op: CacheOperation, pba: Pba, block: Option<Block>, success: bool) -> Self {
        Self {
            op,
            pba,
            job: None,
            block,
            done: true,
            success,
        }
    }

    fn with_job(op: CacheOperation, pba: Pba, job: IoJob) -> Self {
        Self {
            op,
            pba,
            job: Some(job),
            block: None,
            done: false,
            success: false,
        }
    }
}

/// LRU block cache over a block store
pub struct BlockCache<S: BlockStore> {
    store: S,
    entries: HashMap<Pba, CacheEntry>,
    capacity: usize,
    /// Logical clock for LRU ordering
    clock: u64,
    stats: CacheStats,
    active: Option<ActiveRequest>,
}

impl<S: BlockStore> BlockCache<S> {
    /// Create a cache holding at most `capacity` blocks
    pub fn new(store: S, capacity: usize) -> Self {
        Self {
            store,
            entries: HashMap::new(),
            capacity: capacity.max(1),
            clock: 0,
            stats: CacheStats::default(),
            active: None,
        }
    }

    #[must_use]
    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, pba: Pba) -> bool {
        self.entries.contains_key(&pba)
    }

    /// Drop a block from the cache
    pub fn invalidate(&mut self, pba: Pba) -> Option<Block> {
        self.entries.remove(&pba).map(|entry| entry.block)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn lookup(&mut self, pba: Pba) -> Option<Block> {
        let clock = self.tick();
        let entry = self.entries.get_mut(&pba)?;
        entry.last_access = clock;
        Some(entry.block.clone())
    }

    fn insert(&mut self, pba: Pba, block: Block) {
        let clock = self.tick();
        if !self.entries.contains_key(&pba) {
            while self.entries.len() >= self.capacity {
                let Some(victim) = self.find_lru_entry() else {
                    break;
                };
                self.entries.remove(&victim);
                self.stats.evictions += 1;
            }
        }
        self.entries.insert(
            pba,
            CacheEntry {
                block,
                last_access: clock,
            },
        );
    }

    fn find_lru_entry(&self) -> Option<Pba> {
        self.entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(pba, _)| *pba)
    }

    fn start(&self, req: &LocalCacheRequest) -> ActiveRequest {
        let offset = match req.op {
            CacheOperation::Sync => 0,
            CacheOperation::Read | CacheOperation::Write => match block_offset(req.pba) {
                Ok(offset) => offset,
                Err(e) => {
                    warn!("level {} node: {e}", req.level);
                    return ActiveRequest::finished(req.op, req.pba, None, false);
                }
            },
        };
        let job = match req.op {
            CacheOperation::Read => IoJob::read(offset, BLOCK_SIZE),
            CacheOperation::Write => IoJob::write(offset, req.block.as_slice()),
            CacheOperation::Sync => IoJob::sync(),
        };
        ActiveRequest::with_job(req.op, req.pba, job)
    }
}

impl<S: BlockStore> NodeCache for BlockCache<S> {
    fn submit(&mut self, req: &LocalCacheRequest) -> bool {
        if self.active.is_some() {
            return false;
        }

        let active = match req.op {
            CacheOperation::Read => {
                if let Some(block) = self.lookup(req.pba) {
                    self.stats.hits += 1;
                    trace!("cache hit pba {}", req.pba);
                    ActiveRequest::finished(req.op, req.pba, Some(block), true)
                } else {
                    self.stats.misses += 1;
                    trace!("cache miss pba {}", req.pba);
                    self.start(req)
                }
            }
            CacheOperation::Write => {
                self.stats.writes += 1;
                let active = self.start(req);
                // a write rejected up front must not leave a cached copy
                if active.job.is_some() {
                    self.insert(req.pba, req.block.clone());
                }
                active
            }
            CacheOperation::Sync => self.start(req),
        };
        self.active = Some(active);
        true
    }

    fn execute(&mut self) -> bool {
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        if active.done {
            return false;
        }
        let Some(job) = active.job.as_mut() else {
            return false;
        };

        let progress = job.execute(&mut self.store);
        if !job.completed() {
            return progress;
        }

        let success = job.succeeded();
        let (op, pba) = (active.op, active.pba);
        let block = match (op, success) {
            (CacheOperation::Read, true) => Block::from_slice(job.buffer()).ok(),
            _ => None,
        };
        active.job = None;
        active.done = true;
        active.success = success && (op != CacheOperation::Read || block.is_some());

        match (op, success) {
            (CacheOperation::Read, true) => {
                if let Some(block) = block.clone() {
                    self.insert(pba, block);
                }
            }
            (CacheOperation::Write, false) => {
                debug!("dropping pba {pba} from cache after failed write");
                self.invalidate(pba);
            }
            _ => {}
        }
        if let Some(active) = self.active.as_mut() {
            active.block = block;
        }
        true
    }

    fn complete(&mut self, req: &mut LocalCacheRequest) -> bool {
        match self.active.take() {
            Some(active) if active.done => {
                req.success = active.success;
                if let Some(block) = active.block {
                    req.block = block;
                }
                true
            }
            other => {
                self.active = other;
                false
            }
        }
    }
}
