//! Meta tree formatter
//!
//! Lays out a fresh tree bottom-up: all leaf blocks first, then each inner
//! level, with the root block last. Node blocks occupy consecutive pbas
//! starting at `first_node_pba`.

use std::collections::HashSet;
use tracing::debug;
use tresor_common::{
    Block, Error, Generation, INVALID_PBA, LEAF_LEVEL, Pba, Result, TreeGeometry, Type1Node,
    Type1NodeBlock, Type2Node, Type2NodeBlock, hash_block,
};

/// Encoded blocks of a freshly formatted tree
#[derive(Debug, Clone)]
pub struct FormattedTree {
    /// Descriptor of the root block
    pub root: Type1Node,
    /// Node blocks in write order, children before parents
    pub blocks: Vec<(Pba, Block)>,
}

impl FormattedTree {
    /// First pba after the node blocks
    #[must_use]
    pub fn end_pba(&self) -> Pba {
        self.root.pba + 1
    }
}

/// Number of node blocks per level, leaf level first
fn blocks_per_level(geometry: &TreeGeometry) -> Vec<u64> {
    let mut counts = Vec::with_capacity(geometry.max_level as usize);
    let mut count = geometry.leaves.div_ceil(u64::from(geometry.edges));
    for _ in LEAF_LEVEL..=geometry.max_level {
        counts.push(count);
        count = count.div_ceil(u64::from(geometry.edges));
    }
    counts
}

/// Number of node blocks a tree of this geometry occupies
#[must_use]
pub fn nr_of_node_blocks(geometry: &TreeGeometry) -> u64 {
    blocks_per_level(geometry).iter().sum()
}

/// Build the node blocks of a tree tracking `leaf_entries`
///
/// Entry `i` lands in leaf slot `i`; slots beyond the given entries stay
/// unused. Every node descriptor is stamped with `generation`.
pub fn format_meta_tree(
    geometry: &TreeGeometry,
    first_node_pba: Pba,
    leaf_entries: &[Type2Node],
    generation: Generation,
) -> Result<FormattedTree> {
    geometry.validate()?;
    if first_node_pba == INVALID_PBA {
        return Err(Error::invalid_argument("node blocks cannot start at pba 0"));
    }
    if leaf_entries.len() as u64 > geometry.leaves {
        return Err(Error::invalid_argument(format!(
            "{} leaf entries exceed the {} leaves of the tree",
            leaf_entries.len(),
            geometry.leaves
        )));
    }

    let edges = geometry.edges as usize;
    let counts = blocks_per_level(geometry);
    let nr_of_blocks: u64 = counts.iter().sum();
    let node_pbas = first_node_pba..first_node_pba + nr_of_blocks;

    let mut seen = HashSet::new();
    for entry in leaf_entries.iter().filter(|entry| entry.valid()) {
        if node_pbas.contains(&entry.pba) {
            return Err(Error::invalid_argument(format!(
                "leaf pba {} collides with node blocks {node_pbas:?}",
                entry.pba
            )));
        }
        if !seen.insert(entry.pba) {
            return Err(Error::invalid_argument(format!(
                "leaf pba {} is tracked twice",
                entry.pba
            )));
        }
    }

    let mut blocks = Vec::with_capacity(nr_of_blocks as usize);
    let mut next_pba = first_node_pba;

    let mut children = Vec::with_capacity(counts[0] as usize);
    for chunk_idx in 0..counts[0] as usize {
        let mut node_blk = Type2NodeBlock::default();
        let start = chunk_idx * edges;
        for (slot, entry) in leaf_entries.iter().skip(start).take(edges).enumerate() {
            node_blk.nodes[slot] = *entry;
        }
        let mut blk = Block::new();
        node_blk.encode_to_block(&mut blk);
        children.push(Type1Node::new(next_pba, generation, hash_block(&blk)));
        blocks.push((next_pba, blk));
        next_pba += 1;
    }

    for count in counts.iter().skip(1) {
        let mut parents = Vec::with_capacity(*count as usize);
        for chunk in children.chunks(edges) {
            let mut node_blk = Type1NodeBlock::default();
            node_blk.nodes[..chunk.len()].copy_from_slice(chunk);
            let mut blk = Block::new();
            node_blk.encode_to_block(&mut blk);
            parents.push(Type1Node::new(next_pba, generation, hash_block(&blk)));
            blocks.push((next_pba, blk));
            next_pba += 1;
        }
        children = parents;
    }

    let [root] = children[..] else {
        return Err(Error::invalid_geometry(format!(
            "{geometry} does not converge to a single root"
        )));
    };
    debug!(
        "formatted meta tree {geometry}: {} node blocks, root {root}",
        blocks.len()
    );
    Ok(FormattedTree { root, blocks })
}
