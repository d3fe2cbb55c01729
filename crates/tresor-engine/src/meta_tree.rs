//! Meta tree module
//!
//! The meta tree tracks the blocks that hold the free tree's own nodes.
//! Its leaves name these blocks together with the generation they were
//! allocated in; unreserved leaves are spare blocks.
//!
//! An update replaces the block `old_pba` for the write epoch
//! `current_gen`. A block allocated in `current_gen` has not been secured
//! yet and is reused in place. Any other block is still referenced by the
//! last secured snapshot, so it is exchanged for a spare of the same leaf
//! block. The same rule applies to the tree's own node blocks on the path
//! from that leaf to the root: a node whose descriptor carries
//! `current_gen` is rewritten in place, any other node moves to a spare.
//!
//! The update runs in three phases:
//! 1. descend from the root, verifying every block against the hash its
//!    parent recorded, until the leaf naming `old_pba` is found
//! 2. exchange the required spares inside the leaf block
//! 3. write the path back leaf first, each level only after the level below
//!    it has been written, and report the new root descriptor
//!
//! Persisting the new root is up to the caller.

use crate::cache::{LocalCacheRequest, LocalCacheRequestState, NodeCache};
use crate::module::{Module, ModuleId, ModuleRequest, ModuleRequestId, RequestHeader};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, warn};
use tresor_common::{
    Block, Error, Generation, INVALID_PBA, LEAF_LEVEL, Pba, Result, TREE_MAX_LEVEL,
    TREE_MIN_INNER_LEVEL, TreeGeometry, TreeLevel, Type1Node, Type1NodeBlock, Type2Node,
    Type2NodeBlock, check_hash, hash_block,
};

/// Level stored in `MetaTreeChannel::inner[0]`
const INNER_LEVEL_OFFSET: TreeLevel = TREE_MIN_INNER_LEVEL;

/// Number of inner levels a channel can hold
const NR_OF_INNER_LEVELS: usize = (TREE_MAX_LEVEL - INNER_LEVEL_OFFSET + 1) as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaTreeOperation {
    Update,
}

/// State of a channel, the terminal states are reported on the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Invalid,
    Update,
    Complete,
    /// A node block did not match the hash recorded by its parent
    TreeHashMismatch,
    /// No reserved leaf names the block to update
    PbaNotTracked,
    /// The leaf block holds too few spares for the required exchanges
    SparesExhausted,
    /// The cache failed to read or write a node block
    IoError,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Invalid => "invalid",
            Self::Update => "update",
            Self::Complete => "complete",
            Self::TreeHashMismatch => "tree hash mismatch",
            Self::PbaNotTracked => "pba not tracked",
            Self::SparesExhausted => "spares exhausted",
            Self::IoError => "I/O error",
        };
        f.write_str(name)
    }
}

/// One copy-on-write update of the meta tree
#[derive(Debug)]
pub struct MetaTreeRequest {
    header: RequestHeader,
    op: MetaTreeOperation,
    geometry: TreeGeometry,
    root: Type1Node,
    current_gen: Generation,
    old_pba: Pba,
    new_pba: Option<Pba>,
    success: bool,
    root_dirty: bool,
    outcome: ChannelState,
}

impl MetaTreeRequest {
    /// Create an update request addressed to the meta tree
    pub fn update(
        src_module_id: ModuleId,
        src_request_id: ModuleRequestId,
        geometry: TreeGeometry,
        root: Type1Node,
        current_gen: Generation,
        old_pba: Pba,
    ) -> Result<Self> {
        geometry.validate()?;
        if !root.valid() {
            return Err(Error::invalid_argument("meta tree root has no pba"));
        }
        if old_pba == INVALID_PBA {
            return Err(Error::invalid_argument("cannot update pba 0"));
        }
        Ok(Self {
            header: RequestHeader::new(src_module_id, src_request_id, ModuleId::MetaTree),
            op: MetaTreeOperation::Update,
            geometry,
            root,
            current_gen,
            old_pba,
            new_pba: None,
            success: false,
            root_dirty: false,
            outcome: ChannelState::Invalid,
        })
    }

    #[must_use]
    pub const fn op(&self) -> MetaTreeOperation {
        self.op
    }

    #[must_use]
    pub const fn geometry(&self) -> &TreeGeometry {
        &self.geometry
    }

    /// Root descriptor, replaced by the new root once the update succeeded
    #[must_use]
    pub const fn root(&self) -> &Type1Node {
        &self.root
    }

    #[must_use]
    pub const fn current_gen(&self) -> Generation {
        self.current_gen
    }

    #[must_use]
    pub const fn old_pba(&self) -> Pba {
        self.old_pba
    }

    /// Block that replaces `old_pba`, set on success
    #[must_use]
    pub const fn new_pba(&self) -> Option<Pba> {
        self.new_pba
    }

    #[must_use]
    pub const fn success(&self) -> bool {
        self.success
    }

    /// Whether the root descriptor changed and must be persisted
    #[must_use]
    pub const fn root_dirty(&self) -> bool {
        self.root_dirty
    }

    /// Terminal channel state the request finished in
    #[must_use]
    pub const fn outcome(&self) -> ChannelState {
        self.outcome
    }
}

impl ModuleRequest for MetaTreeRequest {
    fn header(&self) -> &RequestHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut RequestHeader {
        &mut self.header
    }
}

impl fmt::Display for MetaTreeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} old_pba {} curr_gen {} root ({})",
            self.op, self.old_pba, self.current_gen, self.root
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum LevelState {
    #[default]
    Invalid,
    Read,
    ReadComplete,
    Write,
    WriteComplete,
    Complete,
}

/// Working state of an inner level
#[derive(Debug, Clone, Default)]
struct Type1Info {
    state: LevelState,
    /// Descriptor of the node block, updated when the block is written
    node: Type1Node,
    entries: Type1NodeBlock,
    /// Child currently followed
    index: usize,
    /// Leaf slot covered by the first entry of the block
    first_leaf: u64,
    dirty: bool,
    volatile: bool,
}

/// Working state of the leaf level
#[derive(Debug, Clone, Default)]
struct Type2Info {
    state: LevelState,
    node: Type1Node,
    entries: Type2NodeBlock,
    /// Slot naming `old_pba`
    index: usize,
    first_leaf: u64,
    dirty: bool,
    volatile: bool,
}

/// Execution context of the one update in flight
#[derive(Debug)]
struct MetaTreeChannel {
    state: ChannelState,
    request: Option<Box<MetaTreeRequest>>,
    geometry: TreeGeometry,
    current_gen: Generation,
    old_pba: Pba,
    new_pba: Option<Pba>,
    root: Type1Node,
    /// Level the walk is currently at
    level: TreeLevel,
    leaf: Type2Info,
    inner: [Type1Info; NR_OF_INNER_LEVELS],
    cache_request: LocalCacheRequest,
    root_dirty: bool,
    finished: bool,
}

impl Default for MetaTreeChannel {
    fn default() -> Self {
        Self {
            state: ChannelState::Invalid,
            request: None,
            geometry: TreeGeometry {
                max_level: TREE_MIN_INNER_LEVEL,
                edges: 1,
                leaves: 1,
            },
            current_gen: 0,
            old_pba: INVALID_PBA,
            new_pba: None,
            root: Type1Node::default(),
            level: LEAF_LEVEL,
            leaf: Type2Info::default(),
            inner: std::array::from_fn(|_| Type1Info::default()),
            cache_request: LocalCacheRequest::default(),
            root_dirty: false,
            finished: false,
        }
    }
}

impl MetaTreeChannel {
    fn inner(&self, level: TreeLevel) -> &Type1Info {
        &self.inner[(level - INNER_LEVEL_OFFSET) as usize]
    }

    fn inner_mut(&mut self, level: TreeLevel) -> &mut Type1Info {
        &mut self.inner[(level - INNER_LEVEL_OFFSET) as usize]
    }

    fn node(&self, level: TreeLevel) -> &Type1Node {
        if level == LEAF_LEVEL {
            &self.leaf.node
        } else {
            &self.inner(level).node
        }
    }

    fn node_mut(&mut self, level: TreeLevel) -> &mut Type1Node {
        if level == LEAF_LEVEL {
            &mut self.leaf.node
        } else {
            &mut self.inner_mut(level).node
        }
    }

    fn level_state(&self, level: TreeLevel) -> LevelState {
        if level == LEAF_LEVEL {
            self.leaf.state
        } else {
            self.inner(level).state
        }
    }

    fn set_level_state(&mut self, level: TreeLevel, state: LevelState) {
        if level == LEAF_LEVEL {
            self.leaf.state = state;
        } else {
            self.inner_mut(level).state = state;
        }
    }

    fn busy(&self) -> bool {
        self.state != ChannelState::Invalid
    }

    fn start(&mut self, req: Box<MetaTreeRequest>) {
        *self = Self {
            state: ChannelState::Update,
            geometry: req.geometry,
            current_gen: req.current_gen,
            old_pba: req.old_pba,
            root: req.root,
            request: Some(req),
            ..Self::default()
        };
        let root = self.root;
        self.read_level(self.geometry.max_level, root, 0);
    }

    /// Advance the walk by one transition
    ///
    /// Does nothing while a cache request is outstanding.
    fn execute(&mut self) -> bool {
        if self.state != ChannelState::Update
            || self.cache_request.state != LocalCacheRequestState::Invalid
        {
            return false;
        }

        let level = self.level;
        match self.level_state(level) {
            LevelState::Read => self.read_complete(level),
            LevelState::ReadComplete if level == LEAF_LEVEL => self.seek_leaf(),
            LevelState::ReadComplete => self.seek_inner(level),
            LevelState::Write => self.write_complete(level),
            LevelState::WriteComplete => self.update_parent(level),
            LevelState::Invalid | LevelState::Complete => return false,
        }
        true
    }

    fn read_level(&mut self, level: TreeLevel, node: Type1Node, first_leaf: u64) {
        self.level = level;
        if level == LEAF_LEVEL {
            self.leaf = Type2Info {
                state: LevelState::Read,
                node,
                first_leaf,
                ..Type2Info::default()
            };
        } else {
            *self.inner_mut(level) = Type1Info {
                state: LevelState::Read,
                node,
                first_leaf,
                ..Type1Info::default()
            };
        }
        self.cache_request = LocalCacheRequest::read(node.pba, level);
    }

    fn read_complete(&mut self, level: TreeLevel) {
        let pba = self.cache_request.pba;
        if !self.cache_request.success {
            warn!("reading level {level} node at pba {pba} failed");
            self.fail(ChannelState::IoError);
            return;
        }

        let blk = std::mem::take(&mut self.cache_request.block);
        if !check_hash(&blk, &self.node(level).hash) {
            warn!(
                "level {level} node at pba {pba} does not match hash {}",
                self.node(level).hash
            );
            self.fail(ChannelState::TreeHashMismatch);
            return;
        }

        if level == LEAF_LEVEL {
            self.leaf.entries = Type2NodeBlock::decode_from_block(&blk);
        } else {
            self.inner_mut(level).entries = Type1NodeBlock::decode_from_block(&blk);
        }
        self.set_level_state(level, LevelState::ReadComplete);
    }

    /// Follow the next child of an inner node that may lead to `old_pba`
    fn seek_inner(&mut self, level: TreeLevel) {
        let leaves = self.geometry.leaves;
        let leaves_per_slot = self.geometry.leaves_per_slot(level);
        let edges = self.geometry.edges as usize;
        let info = self.inner(level);

        let next = (info.index..edges).find(|idx| {
            info.entries.nodes[*idx].valid()
                && info.first_leaf + *idx as u64 * leaves_per_slot < leaves
        });
        match next {
            Some(idx) => {
                let child = info.entries.nodes[idx];
                let first_leaf = info.first_leaf + idx as u64 * leaves_per_slot;
                self.inner_mut(level).index = idx;
                self.read_level(level - 1, child, first_leaf);
            }
            None => self.backtrack(level),
        }
    }

    fn seek_leaf(&mut self) {
        let leaves = self.geometry.leaves;
        let edges = self.geometry.edges as usize;
        let info = &self.leaf;

        let found = (0..edges).find(|idx| {
            let entry = &info.entries.nodes[*idx];
            info.first_leaf + (*idx as u64) < leaves
                && entry.valid()
                && entry.reserved
                && entry.pba == self.old_pba
        });
        match found {
            Some(idx) => {
                self.leaf.index = idx;
                self.allocate();
            }
            None => self.backtrack(LEAF_LEVEL),
        }
    }

    /// The subtree at `level` does not contain `old_pba`, resume at its parent
    fn backtrack(&mut self, level: TreeLevel) {
        self.set_level_state(level, LevelState::Invalid);
        if level == self.geometry.max_level {
            debug!("pba {} not found in meta tree", self.old_pba);
            self.fail(ChannelState::PbaNotTracked);
            return;
        }
        let parent = self.inner_mut(level + 1);
        parent.index += 1;
        self.level = level + 1;
    }

    fn leaf_slot_in_use(&self, idx: usize) -> bool {
        self.leaf.first_leaf + (idx as u64) < self.geometry.leaves
    }

    /// Decide reuse or exchange for the leaf and every node on its path
    fn allocate(&mut self) {
        let curr_gen = self.current_gen;
        let max_level = self.geometry.max_level;
        let leaf_idx = self.leaf.index;
        let entry = self.leaf.entries.nodes[leaf_idx];

        if entry.alloc_gen == curr_gen {
            debug!("pba {} allocated in gen {curr_gen}, reusing", entry.pba);
            self.new_pba = Some(entry.pba);
            self.complete();
            return;
        }

        let mut nr_of_exchanges = 1;
        for level in LEAF_LEVEL..=max_level {
            let volatile = self.node(level).is_volatile(curr_gen);
            if level == LEAF_LEVEL {
                self.leaf.volatile = volatile;
            } else {
                self.inner_mut(level).volatile = volatile;
            }
            if !volatile {
                nr_of_exchanges += 1;
            }
        }

        let spares: Vec<usize> = (0..self.geometry.edges as usize)
            .filter(|idx| {
                *idx != leaf_idx
                    && self.leaf_slot_in_use(*idx)
                    && self.leaf.entries.nodes[*idx].is_spare_for(curr_gen)
            })
            .collect();
        if spares.len() < nr_of_exchanges {
            warn!(
                "leaf block at pba {} has {} spares, {nr_of_exchanges} needed",
                self.leaf.node.pba,
                spares.len()
            );
            self.fail(ChannelState::SparesExhausted);
            return;
        }

        let mut spares = spares.into_iter();
        let mut next_spare = || spares.next().unwrap_or_default();

        let new_pba = self.exchange(next_spare(), entry.pba);
        self.leaf.entries.nodes[leaf_idx] = Type2Node::reserved(new_pba, curr_gen);
        debug!("pba {} exchanged for {new_pba}", entry.pba);
        self.new_pba = Some(new_pba);

        for level in LEAF_LEVEL..=max_level {
            let volatile = if level == LEAF_LEVEL {
                self.leaf.dirty = true;
                self.leaf.volatile
            } else {
                let info = self.inner_mut(level);
                info.dirty = true;
                info.volatile
            };
            if volatile {
                continue;
            }
            let old_node_pba = self.node(level).pba;
            let new_node_pba = self.exchange(next_spare(), old_node_pba);
            self.node_mut(level).pba = new_node_pba;
            debug!("level {level} node moves from pba {old_node_pba} to {new_node_pba}");
        }

        self.write_level(LEAF_LEVEL);
    }

    /// Hand out the spare in `slot`, releasing `released` in its place
    fn exchange(&mut self, slot: usize, released: Pba) -> Pba {
        let spare = &mut self.leaf.entries.nodes[slot];
        let pba = spare.pba;
        *spare = Type2Node::spare(released, self.current_gen);
        pba
    }

    fn write_level(&mut self, level: TreeLevel) {
        self.level = level;
        let mut blk = Block::new();
        let dirty = if level == LEAF_LEVEL {
            self.leaf.entries.encode_to_block(&mut blk);
            self.leaf.dirty
        } else {
            let info = self.inner(level);
            info.entries.encode_to_block(&mut blk);
            info.dirty
        };
        debug_assert!(dirty, "level {level} written without changes");

        let curr_gen = self.current_gen;
        let node = self.node_mut(level);
        node.generation = curr_gen;
        node.hash = hash_block(&blk);
        let pba = node.pba;

        self.set_level_state(level, LevelState::Write);
        self.cache_request = LocalCacheRequest::write(pba, level, blk);
    }

    fn write_complete(&mut self, level: TreeLevel) {
        if !self.cache_request.success {
            warn!(
                "writing level {level} node at pba {} failed",
                self.cache_request.pba
            );
            self.fail(ChannelState::IoError);
            return;
        }
        self.set_level_state(level, LevelState::WriteComplete);
    }

    /// Record the written node in its parent and continue one level up
    fn update_parent(&mut self, level: TreeLevel) {
        self.set_level_state(level, LevelState::Complete);
        let node = *self.node(level);

        if level == self.geometry.max_level {
            self.root = node;
            self.root_dirty = true;
            self.complete();
            return;
        }

        let parent = self.inner_mut(level + 1);
        let idx = parent.index;
        parent.entries.nodes[idx] = node;
        self.write_level(level + 1);
    }

    fn complete(&mut self) {
        self.state = ChannelState::Complete;
        self.finished = true;
    }

    fn fail(&mut self, state: ChannelState) {
        self.state = state;
        self.finished = true;
    }

    /// Move the results into the request and reset the channel
    fn take_finished(&mut self) -> Option<Box<MetaTreeRequest>> {
        if !self.finished {
            return None;
        }
        let channel = std::mem::take(self);
        let mut req = channel.request?;
        req.outcome = channel.state;
        req.success = channel.state == ChannelState::Complete;
        if req.success {
            req.new_pba = channel.new_pba;
            req.root = channel.root;
            req.root_dirty = channel.root_dirty;
        }
        Some(req)
    }
}

/// Meta tree module, one channel over a node cache
pub struct MetaTree<C: NodeCache> {
    channel: MetaTreeChannel,
    cache: C,
    completed: VecDeque<Box<MetaTreeRequest>>,
    next_request_id: ModuleRequestId,
}

impl<C: NodeCache> MetaTree<C> {
    pub fn new(cache: C) -> Self {
        Self {
            channel: MetaTreeChannel::default(),
            cache,
            completed: VecDeque::new(),
            next_request_id: 0,
        }
    }

    pub const fn cache(&self) -> &C {
        &self.cache
    }

    /// Move the channel's cache request through the cache
    fn execute_cache_request(&mut self) -> bool {
        let req = &mut self.channel.cache_request;
        match req.state {
            LocalCacheRequestState::Invalid => false,
            LocalCacheRequestState::Pending => {
                if !self.cache.submit(req) {
                    return false;
                }
                req.state = LocalCacheRequestState::InProgress;
                true
            }
            LocalCacheRequestState::InProgress => {
                let mut progress = self.cache.execute();
                if self.cache.complete(req) {
                    req.state = LocalCacheRequestState::Invalid;
                    progress = true;
                }
                progress
            }
        }
    }
}

impl<C: NodeCache> Module for MetaTree<C> {
    fn ready_to_submit_request(&self) -> bool {
        !self.channel.busy()
    }

    fn submit_request(&mut self, mut req: Box<dyn ModuleRequest>) {
        assert!(
            !self.channel.busy(),
            "meta tree is busy, refused {}",
            req.header()
        );
        req.header_mut().set_dst_request_id(self.next_request_id);
        self.next_request_id += 1;

        match req.downcast::<MetaTreeRequest>() {
            Ok(req) => {
                debug!("start {req}");
                self.channel.start(req);
            }
            Err(req) => panic!("meta tree cannot handle {}", req.header()),
        }
    }

    fn execute(&mut self, progress: &mut bool) {
        loop {
            let mut step = self.execute_cache_request();
            step |= self.channel.execute();
            if let Some(req) = self.channel.take_finished() {
                if req.success() {
                    debug!("finished {req}: new pba {:?}", req.new_pba());
                } else {
                    warn!("update of pba {} failed: {}", req.old_pba(), req.outcome());
                }
                self.completed.push_back(req);
                step = true;
            }
            if !step {
                break;
            }
            *progress = true;
        }
    }

    fn peek_completed_request(&self) -> Option<&dyn ModuleRequest> {
        self.completed
            .front()
            .map(|req| req.as_ref() as &dyn ModuleRequest)
    }

    fn drop_completed_request(&mut self) -> Box<dyn ModuleRequest> {
        match self.completed.pop_front() {
            Some(req) => req,
            None => panic!("meta tree has no completed requests"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_store::{MemoryBlockStore, MemoryImage};
    use crate::cache::BlockCache;
    use crate::composition::ModuleComposition;
    use crate::initializer::format_meta_tree;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Results = Rc<RefCell<Vec<Box<MetaTreeRequest>>>>;

    /// Free-tree stand-in that issues updates and collects their results
    struct Caller {
        pending: VecDeque<Box<MetaTreeRequest>>,
        results: Results,
    }

    impl Module for Caller {
        fn peek_generated_request(&self) -> Option<&dyn ModuleRequest> {
            self.pending
                .front()
                .map(|req| req.as_ref() as &dyn ModuleRequest)
        }

        fn drop_generated_request(&mut self) -> Box<dyn ModuleRequest> {
            self.pending.pop_front().unwrap()
        }

        fn generated_request_complete(&mut self, req: Box<dyn ModuleRequest>) {
            self.results
                .borrow_mut()
                .push(req.downcast::<MetaTreeRequest>().unwrap());
        }
    }

    struct Fixture {
        image: MemoryImage,
        geometry: TreeGeometry,
        root: Type1Node,
        composition: ModuleComposition,
        results: Results,
    }

    impl Fixture {
        fn new(geometry: TreeGeometry, entries: &[Type2Node], generation: Generation) -> Self {
            let image = MemoryImage::new(128);
            let tree = format_meta_tree(&geometry, 1, entries, generation).unwrap();
            for (pba, blk) in &tree.blocks {
                image.write_block(*pba, blk).unwrap();
            }

            let cache = BlockCache::new(MemoryBlockStore::new(image.clone()).with_latency(1), 8);
            let mut composition = ModuleComposition::new();
            composition
                .add_module(ModuleId::MetaTree, Box::new(MetaTree::new(cache)))
                .unwrap();

            Self {
                image,
                geometry,
                root: tree.root,
                composition,
                results: Rc::new(RefCell::new(Vec::new())),
            }
        }

        fn request(&self, id: u64, curr_gen: Generation, old_pba: Pba) -> Box<MetaTreeRequest> {
            Box::new(
                MetaTreeRequest::update(
                    ModuleId::FreeTree,
                    id,
                    self.geometry,
                    self.root,
                    curr_gen,
                    old_pba,
                )
                .unwrap(),
            )
        }

        /// Run one update and adopt the reported root
        fn update(&mut self, curr_gen: Generation, old_pba: Pba) -> Box<MetaTreeRequest> {
            let caller = Caller {
                pending: VecDeque::from([self.request(0, curr_gen, old_pba)]),
                results: Rc::clone(&self.results),
            };
            self.composition
                .add_module(ModuleId::FreeTree, Box::new(caller))
                .unwrap();
            assert!(self.composition.execute_until_idle(1000).unwrap());
            self.composition.remove_module(ModuleId::FreeTree).unwrap();

            let req = self.results.borrow_mut().pop().unwrap();
            if req.success() {
                self.root = *req.root();
            }
            req
        }
    }

    fn two_level_entries(alloc_gen: Generation, nr_of_spares: usize) -> Vec<Type2Node> {
        let mut entries = vec![Type2Node::reserved(100, alloc_gen)];
        for idx in 0..nr_of_spares {
            entries.push(Type2Node::spare(101 + idx as u64, 0));
        }
        entries
    }

    /// 8 leaf blocks of 8 slots, slot 0 of leaf block `b` reserves
    /// `16 + 8 * b` and slots 1..8 hold spares
    fn three_level_entries() -> Vec<Type2Node> {
        (0..64u64)
            .map(|slot| {
                if slot % 8 == 0 {
                    Type2Node::reserved(16 + slot, 3)
                } else {
                    Type2Node::spare(16 + slot, 0)
                }
            })
            .collect()
    }

    fn leaf_block(image: &MemoryImage, pba: Pba) -> Type2NodeBlock {
        Type2NodeBlock::decode_from_block(&image.read_block(pba).unwrap())
    }

    fn inner_block(image: &MemoryImage, pba: Pba) -> Type1NodeBlock {
        Type1NodeBlock::decode_from_block(&image.read_block(pba).unwrap())
    }

    #[test]
    fn test_volatile_leaf_reused_in_place() {
        let geometry = TreeGeometry::new(2, 4, 16).unwrap();
        let mut fixture = Fixture::new(geometry, &two_level_entries(5, 3), 5);
        let old_root = fixture.root;

        let req = fixture.update(5, 100);
        assert!(req.success());
        assert_eq!(req.outcome(), ChannelState::Complete);
        assert_eq!(req.new_pba(), Some(100));
        assert!(!req.root_dirty());
        assert_eq!(*req.root(), old_root);
        assert!(fixture.image.write_log().is_empty());
    }

    #[test]
    fn test_secured_leaf_duplicated() {
        let geometry = TreeGeometry::new(2, 4, 16).unwrap();
        let mut fixture = Fixture::new(geometry, &two_level_entries(3, 3), 3);

        let req = fixture.update(5, 100);
        assert!(req.success());
        assert_eq!(req.new_pba(), Some(101));
        assert!(req.root_dirty());

        // leaf block 1 moved to 102, the root block 5 moved to 103
        assert_eq!(fixture.image.written_blocks(), vec![102, 103]);
        let root = req.root();
        assert_eq!(root.pba, 103);
        assert_eq!(root.generation, 5);
        assert!(check_hash(
            &fixture.image.read_block(103).unwrap(),
            &root.hash
        ));

        let root_blk = inner_block(&fixture.image, 103);
        assert_eq!(root_blk.nodes[0].pba, 102);
        assert_eq!(root_blk.nodes[0].generation, 5);
        assert_eq!(
            root_blk.nodes[0].hash,
            hash_block(&fixture.image.read_block(102).unwrap())
        );
        // untouched siblings keep their old descriptors
        assert_eq!(root_blk.nodes[1].pba, 2);
        assert_eq!(root_blk.nodes[1].generation, 3);

        let leaf = leaf_block(&fixture.image, 102);
        assert_eq!(leaf.nodes[0], Type2Node::reserved(101, 5));
        assert_eq!(leaf.nodes[1], Type2Node::spare(100, 5));
        assert_eq!(leaf.nodes[2], Type2Node::spare(1, 5));
        assert_eq!(leaf.nodes[3], Type2Node::spare(5, 5));

        // the secured blocks were not overwritten
        assert_eq!(leaf_block(&fixture.image, 1).nodes[0], Type2Node::reserved(100, 3));
    }

    #[test]
    fn test_upward_propagation_stops_at_volatile_nodes() {
        let geometry = TreeGeometry::new(3, 8, 64).unwrap();
        let mut fixture = Fixture::new(geometry, &three_level_entries(), 3);
        // leaf blocks at 1..=8, the level 2 block at 9, the root at 10
        assert_eq!(fixture.root.pba, 10);

        // every node on the path is secured and moves
        let first = fixture.update(5, 32);
        assert!(first.success());
        assert_eq!(first.new_pba(), Some(33));
        assert_eq!(fixture.image.written_blocks(), vec![34, 35, 36]);
        assert_eq!(fixture.root.pba, 36);
        assert_eq!(inner_block(&fixture.image, 36).nodes[0].pba, 35);
        assert_eq!(inner_block(&fixture.image, 35).nodes[2].pba, 34);
        assert_eq!(inner_block(&fixture.image, 35).nodes[2].generation, 5);

        // only the secured leaf block moves, its volatile ancestors are
        // rewritten in place
        fixture.image.clear_write_log();
        let second = fixture.update(5, 56);
        assert!(second.success());
        assert_eq!(second.new_pba(), Some(57));
        assert_eq!(fixture.image.written_blocks(), vec![58, 35, 36]);
        assert_eq!(second.root().pba, 36);
        assert_ne!(second.root().hash, first.root().hash);
        assert!(second.root_dirty());

        let level2 = inner_block(&fixture.image, 35);
        assert_eq!(level2.nodes[2].pba, 34);
        assert_eq!(level2.nodes[5].pba, 58);
        assert_eq!(level2.nodes[5].generation, 5);
        assert_eq!(level2.nodes[4].pba, 5);
        assert_eq!(level2.nodes[4].generation, 3);

        // a block allocated in this generation is reused
        fixture.image.clear_write_log();
        let third = fixture.update(5, 33);
        assert_eq!(third.new_pba(), Some(33));
        assert!(fixture.image.write_log().is_empty());
    }

    #[test]
    fn test_volatile_leaf_block_rewritten_in_place() {
        let geometry = TreeGeometry::new(2, 8, 64).unwrap();
        let mut entries = vec![Type2Node::reserved(100, 3), Type2Node::reserved(101, 3)];
        entries.extend((102..108).map(|pba| Type2Node::spare(pba, 0)));
        let mut fixture = Fixture::new(geometry, &entries, 3);
        // leaf blocks at 1..=8, the root at 9
        assert_eq!(fixture.root.pba, 9);

        let first = fixture.update(5, 100);
        assert!(first.success());
        assert_eq!(first.new_pba(), Some(102));
        assert_eq!(fixture.image.written_blocks(), vec![103, 104]);
        assert_eq!(first.root().pba, 104);

        let spares = |image: &MemoryImage| {
            leaf_block(image, 103)
                .nodes
                .iter()
                .filter(|node| node.is_spare_for(5))
                .count()
        };
        assert_eq!(spares(&fixture.image), 3);

        // the leaf block and the root are volatile now, only the secured
        // data block moves
        fixture.image.clear_write_log();
        let second = fixture.update(5, 101);
        assert!(second.success());
        assert_eq!(second.outcome(), ChannelState::Complete);
        assert_eq!(second.new_pba(), Some(105));
        assert_eq!(fixture.image.written_blocks(), vec![103, 104]);
        assert_eq!(second.root().pba, 104);
        assert!(second.root_dirty());
        assert_eq!(spares(&fixture.image), 2);

        let leaf = leaf_block(&fixture.image, 103);
        assert_eq!(leaf.nodes[0], Type2Node::reserved(102, 5));
        assert_eq!(leaf.nodes[1], Type2Node::reserved(105, 5));
        assert_eq!(leaf.nodes[5], Type2Node::spare(101, 5));
        assert_eq!(inner_block(&fixture.image, 104).nodes[0].pba, 103);
        assert_eq!(
            inner_block(&fixture.image, 104).nodes[0].hash,
            hash_block(&fixture.image.read_block(103).unwrap())
        );
    }

    #[test]
    fn test_write_back_child_before_parent() {
        let geometry = TreeGeometry::new(3, 8, 64).unwrap();
        let mut fixture = Fixture::new(geometry, &three_level_entries(), 3);

        let req = fixture.update(7, 16);
        assert!(req.success());
        let written = fixture.image.written_blocks();
        assert_eq!(written.len(), 3);

        // each written block is referenced by the block written after it
        for pair in written.windows(2) {
            let parent = inner_block(&fixture.image, pair[1]);
            assert!(parent.nodes.iter().any(|node| node.pba == pair[0]));
        }
        assert_eq!(req.root().pba, written[2]);
    }

    #[test]
    fn test_hash_mismatch() {
        let geometry = TreeGeometry::new(2, 4, 16).unwrap();
        let fixture_entries = two_level_entries(3, 3);
        let mut fixture = Fixture::new(geometry, &fixture_entries, 3);

        let mut blk = fixture.image.read_block(1).unwrap();
        blk.as_mut_slice()[4000] ^= 0xff;
        fixture.image.write_block(1, &blk).unwrap();
        let old_root = fixture.root;

        let req = fixture.update(5, 100);
        assert!(!req.success());
        assert_eq!(req.outcome(), ChannelState::TreeHashMismatch);
        assert_eq!(req.new_pba(), None);
        assert_eq!(*req.root(), old_root);
        assert!(fixture.image.write_log().is_empty());
    }

    #[test]
    fn test_untracked_pba() {
        let geometry = TreeGeometry::new(2, 4, 16).unwrap();
        let mut fixture = Fixture::new(geometry, &two_level_entries(3, 3), 3);

        let req = fixture.update(5, 999);
        assert!(!req.success());
        assert_eq!(req.outcome(), ChannelState::PbaNotTracked);

        // a spare is not a tracked block either
        let req = fixture.update(5, 101);
        assert_eq!(req.outcome(), ChannelState::PbaNotTracked);
    }

    #[test]
    fn test_spares_exhausted() {
        let geometry = TreeGeometry::new(2, 4, 16).unwrap();
        let mut fixture = Fixture::new(geometry, &two_level_entries(3, 2), 3);

        let req = fixture.update(5, 100);
        assert!(!req.success());
        assert_eq!(req.outcome(), ChannelState::SparesExhausted);
        assert!(fixture.image.write_log().is_empty());
    }

    #[test]
    fn test_spares_released_this_generation_unusable() {
        let geometry = TreeGeometry::new(2, 4, 16).unwrap();
        let mut entries = two_level_entries(3, 3);
        entries[3] = Type2Node::spare(103, 5);
        let mut fixture = Fixture::new(geometry, &entries, 3);

        let req = fixture.update(5, 100);
        assert_eq!(req.outcome(), ChannelState::SparesExhausted);
    }

    #[test]
    fn test_write_failure() {
        let geometry = TreeGeometry::new(2, 4, 16).unwrap();
        let mut fixture = Fixture::new(geometry, &two_level_entries(3, 3), 3);
        fixture.image.set_fail_writes(true);

        let req = fixture.update(5, 100);
        assert!(!req.success());
        assert_eq!(req.outcome(), ChannelState::IoError);
    }

    #[test]
    fn test_single_flight() {
        let geometry = TreeGeometry::new(2, 4, 16).unwrap();
        let fixture = Fixture::new(geometry, &two_level_entries(3, 3), 3);
        let cache = BlockCache::new(MemoryBlockStore::new(fixture.image.clone()).with_latency(2), 8);
        let mut meta_tree = MetaTree::new(cache);

        assert!(meta_tree.ready_to_submit_request());
        meta_tree.submit_request(fixture.request(1, 5, 100));
        assert!(!meta_tree.ready_to_submit_request());

        let mut passes = 0;
        while meta_tree.peek_completed_request().is_none() {
            assert!(!meta_tree.ready_to_submit_request());
            let mut progress = false;
            meta_tree.execute(&mut progress);
            passes += 1;
            assert!(passes < 100);
        }
        assert!(meta_tree.ready_to_submit_request());

        let req = meta_tree.drop_completed_request();
        assert_eq!(req.header().dst_request_id(), Some(0));
        let req = req.downcast::<MetaTreeRequest>().unwrap();
        assert!(req.success());
    }

    #[test]
    fn test_request_factory_validation() {
        let root = Type1Node::new(5, 0, tresor_common::BlockHash::default());
        let bad_geometry = TreeGeometry {
            max_level: 1,
            edges: 4,
            leaves: 4,
        };
        assert!(MetaTreeRequest::update(ModuleId::FreeTree, 0, bad_geometry, root, 1, 9).is_err());

        let geometry = TreeGeometry::new(2, 4, 16).unwrap();
        assert!(
            MetaTreeRequest::update(ModuleId::FreeTree, 0, geometry, Type1Node::default(), 1, 9)
                .is_err()
        );
        assert!(MetaTreeRequest::update(ModuleId::FreeTree, 0, geometry, root, 1, 0).is_err());

        let req = MetaTreeRequest::update(ModuleId::FreeTree, 4, geometry, root, 1, 9).unwrap();
        assert_eq!(req.header().dst_module_id(), ModuleId::MetaTree);
        assert_eq!(req.op(), MetaTreeOperation::Update);
        assert_eq!(req.outcome(), ChannelState::Invalid);
    }

    #[test]
    fn test_inner_level_offset() {
        let mut channel = MetaTreeChannel::default();
        channel.inner_mut(TREE_MIN_INNER_LEVEL).index = 3;
        channel.inner_mut(TREE_MAX_LEVEL).index = 7;
        assert_eq!(channel.inner[0].index, 3);
        assert_eq!(channel.inner[NR_OF_INNER_LEVELS - 1].index, 7);
    }
}
