//! Update driver
//!
//! Stands in for the free tree: it owns the meta tree's root descriptor and
//! the list of tracked blocks and keeps exactly one update in flight.
//! Every tracked block is updated twice per generation, so the first update
//! exchanges it for a spare and the second finds it volatile and reuses it.

use anyhow::{Result, anyhow, bail, ensure};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, error, info};
use tresor_common::{
    Block, Generation, INITIAL_GENERATION, LEAF_LEVEL, Pba, TreeGeometry, TreeLevel, Type1Node,
    Type1NodeBlock, Type2Node, Type2NodeBlock, check_hash,
};
use tresor_engine::{
    BlockCache, BlockStore, MetaTree, MetaTreeRequest, Module, ModuleComposition, ModuleId,
    ModuleRequest, ModuleRequestId,
};

/// Updates issued per generation
const UPDATES_PER_GENERATION: u64 = 2;

/// Consecutive passes without progress before the run counts as stalled
const MAX_IDLE_PASSES: u64 = 1024;

/// Progress shared between the driver module and its owner
#[derive(Debug, Clone)]
pub struct DriverState {
    pub root: Type1Node,
    pub tracked: Vec<Pba>,
    pub generation: Generation,
    pub remaining: u64,
    pub completed: u64,
    pub reused: u64,
    pub moved: u64,
    pub root_updates: u64,
    pub failure: Option<String>,
    in_flight: bool,
}

impl DriverState {
    #[must_use]
    pub const fn new(root: Type1Node, tracked: Vec<Pba>, updates: u64) -> Self {
        Self {
            root,
            tracked,
            generation: INITIAL_GENERATION,
            remaining: updates,
            completed: 0,
            reused: 0,
            moved: 0,
            root_updates: 0,
            failure: None,
            in_flight: false,
        }
    }

    #[must_use]
    pub const fn finished(&self) -> bool {
        self.failure.is_some() || (self.remaining == 0 && !self.in_flight)
    }
}

/// Module issuing meta tree updates from the free tree's slot
pub struct UpdateDriver {
    geometry: TreeGeometry,
    state: Rc<RefCell<DriverState>>,
    pending: Option<Box<MetaTreeRequest>>,
    next_request_id: ModuleRequestId,
    tracked_idx: usize,
}

impl UpdateDriver {
    pub const fn new(geometry: TreeGeometry, state: Rc<RefCell<DriverState>>) -> Self {
        Self {
            geometry,
            state,
            pending: None,
            next_request_id: 0,
            tracked_idx: 0,
        }
    }

    fn issue(&mut self) -> bool {
        let mut state = self.state.borrow_mut();
        if self.pending.is_some() || state.in_flight || state.finished() {
            return false;
        }
        if state.tracked.is_empty() {
            state.failure = Some("no tracked blocks".into());
            return true;
        }

        let round = state.completed / UPDATES_PER_GENERATION;
        let Ok(tracked_idx) = usize::try_from(round % state.tracked.len() as u64) else {
            state.failure = Some("tracked index overflow".into());
            return true;
        };
        state.generation = INITIAL_GENERATION + 1 + round;

        match MetaTreeRequest::update(
            ModuleId::FreeTree,
            self.next_request_id,
            self.geometry,
            state.root,
            state.generation,
            state.tracked[tracked_idx],
        ) {
            Ok(req) => {
                debug!("issue {req}");
                self.tracked_idx = tracked_idx;
                self.next_request_id += 1;
                self.pending = Some(Box::new(req));
                state.in_flight = true;
            }
            Err(e) => {
                error!("cannot build update request: {e}");
                state.failure = Some(e.to_string());
            }
        }
        true
    }
}

impl Module for UpdateDriver {
    fn execute(&mut self, progress: &mut bool) {
        if self.issue() {
            *progress = true;
        }
    }

    fn peek_generated_request(&self) -> Option<&dyn ModuleRequest> {
        self.pending
            .as_deref()
            .map(|req| req as &dyn ModuleRequest)
    }

    fn drop_generated_request(&mut self) -> Box<dyn ModuleRequest> {
        match self.pending.take() {
            Some(req) => req,
            None => panic!("update driver has no generated request"),
        }
    }

    fn generated_request_complete(&mut self, req: Box<dyn ModuleRequest>) {
        let req = match req.downcast::<MetaTreeRequest>() {
            Ok(req) => req,
            Err(req) => panic!("update driver got foreign completion {}", req.header()),
        };

        let mut state = self.state.borrow_mut();
        state.in_flight = false;
        if !req.success() {
            error!("update of pba {} failed: {}", req.old_pba(), req.outcome());
            state.failure = Some(format!("update of pba {}: {}", req.old_pba(), req.outcome()));
            return;
        }

        let Some(new_pba) = req.new_pba() else {
            state.failure = Some(format!("update of pba {} reported no pba", req.old_pba()));
            return;
        };
        if new_pba == req.old_pba() {
            state.reused += 1;
        } else {
            state.moved += 1;
        }
        if req.root_dirty() {
            state.root = *req.root();
            state.root_updates += 1;
        }
        state.tracked[self.tracked_idx] = new_pba;
        state.completed += 1;
        state.remaining = state.remaining.saturating_sub(1);
    }
}

/// Leaf entries for the data blocks starting at `data_start`
///
/// Slot `i` names `data_start + i`. The first slot of every leaf block is
/// reserved, the others are spares. A leaf block too small to hold the
/// spares of a full path exchange gets no reserved slot.
#[must_use]
pub fn leaf_layout(geometry: &TreeGeometry, data_start: Pba) -> Vec<Type2Node> {
    let edges = u64::from(geometry.edges);
    let needed = u64::from(geometry.max_level) + 1;
    (0..geometry.leaves)
        .map(|slot| {
            let pba = data_start + slot;
            let block_start = slot - slot % edges;
            let block_slots = (geometry.leaves - block_start).min(edges);
            if slot == block_start && block_slots > needed {
                Type2Node::reserved(pba, INITIAL_GENERATION)
            } else {
                Type2Node::spare(pba, INITIAL_GENERATION)
            }
        })
        .collect()
}

/// Run `updates` updates against the tree on `store`
pub fn drive<S: BlockStore + 'static>(
    store: S,
    cache_capacity: usize,
    geometry: TreeGeometry,
    root: Type1Node,
    tracked: Vec<Pba>,
    updates: u64,
    max_passes: u64,
) -> Result<DriverState> {
    let state = Rc::new(RefCell::new(DriverState::new(root, tracked, updates)));

    let mut composition = ModuleComposition::new();
    composition.add_module(
        ModuleId::MetaTree,
        Box::new(MetaTree::new(BlockCache::new(store, cache_capacity))),
    )?;
    composition.add_module(
        ModuleId::FreeTree,
        Box::new(UpdateDriver::new(geometry, Rc::clone(&state))),
    )?;

    // a pass may idle while the store has I/O queued
    let mut passes = 0;
    let mut idle_passes = 0;
    while !state.borrow().finished() {
        if passes >= max_passes {
            bail!("updates unfinished after {max_passes} passes");
        }
        if composition.execute_modules()? {
            idle_passes = 0;
        } else {
            idle_passes += 1;
            if idle_passes >= MAX_IDLE_PASSES {
                bail!("modules stalled after {passes} passes");
            }
        }
        passes += 1;
    }
    info!("ran {passes} scheduler passes");

    drop(composition);
    Rc::try_unwrap(state)
        .map(RefCell::into_inner)
        .map_err(|_| anyhow!("driver state still shared"))
}

/// Walk the tree from `root`, verify every hash and compare the reserved
/// leaves against `tracked`
pub fn check_tree<F>(geometry: &TreeGeometry, root: &Type1Node, tracked: &[Pba], read: F) -> Result<()>
where
    F: Fn(Pba) -> tresor_common::Result<Block>,
{
    let mut found = Vec::new();
    collect_reserved(geometry, geometry.max_level, root, 0, &read, &mut found)?;

    let mut expected = tracked.to_vec();
    expected.sort_unstable();
    found.sort_unstable();
    ensure!(
        found == expected,
        "tree tracks {found:?}, expected {expected:?}"
    );
    Ok(())
}

fn collect_reserved<F>(
    geometry: &TreeGeometry,
    level: TreeLevel,
    node: &Type1Node,
    first_leaf: u64,
    read: &F,
    found: &mut Vec<Pba>,
) -> Result<()>
where
    F: Fn(Pba) -> tresor_common::Result<Block>,
{
    let blk = read(node.pba)?;
    ensure!(
        check_hash(&blk, &node.hash),
        "level {level} node at pba {} does not match its hash",
        node.pba
    );

    let edges = geometry.edges as usize;
    if level == LEAF_LEVEL {
        let node_blk = Type2NodeBlock::decode_from_block(&blk);
        for (idx, entry) in node_blk.nodes.iter().take(edges).enumerate() {
            if first_leaf + (idx as u64) < geometry.leaves && entry.valid() && entry.reserved {
                found.push(entry.pba);
            }
        }
        return Ok(());
    }

    let leaves_per_slot = geometry.leaves_per_slot(level);
    let node_blk = Type1NodeBlock::decode_from_block(&blk);
    for (idx, child) in node_blk.nodes.iter().take(edges).enumerate() {
        let child_first_leaf = first_leaf + idx as u64 * leaves_per_slot;
        if child_first_leaf >= geometry.leaves || !child.valid() {
            continue;
        }
        collect_reserved(geometry, level - 1, child, child_first_leaf, read, found)?;
    }
    Ok(())
}
