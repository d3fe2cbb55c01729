//! Core types for Tresor
//!
//! Block addresses, generations, hashes and the node blocks that make up the
//! engine's trees. Every node occupies a fixed 64-byte slot and every node
//! block fills exactly one [`BLOCK_SIZE`] block; integers are little endian.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical block address
pub type Pba = u64;

/// Write-epoch counter stamped onto nodes when they are written
pub type Generation = u64;

/// Tree level, 1 is the leaf level
pub type TreeLevel = u32;

/// Size of every on-disk block in bytes
pub const BLOCK_SIZE: usize = 4096;

/// Size of a block hash in bytes
pub const HASH_SIZE: usize = 32;

/// Generation of a freshly formatted tree
pub const INITIAL_GENERATION: Generation = 0;

/// Pba that marks an unused node slot
pub const INVALID_PBA: Pba = 0;

/// Storage size of one node slot
pub const NODE_STORAGE_SIZE: usize = 64;

/// Padding after the fields of a type 1 node
const TYPE1_NODE_PADDING: usize = NODE_STORAGE_SIZE - 16 - HASH_SIZE;

/// Padding after the fields of a type 2 node
const TYPE2_NODE_PADDING: usize = NODE_STORAGE_SIZE - 25;

/// Number of node slots in one block
pub const NODES_PER_BLOCK: usize = BLOCK_SIZE / NODE_STORAGE_SIZE;

/// Highest tree level supported
pub const TREE_MAX_LEVEL: TreeLevel = 6;

/// Lowest level that holds type-1 (inner) nodes
pub const TREE_MIN_INNER_LEVEL: TreeLevel = 2;

/// Level of the type-2 (leaf) node block
pub const LEAF_LEVEL: TreeLevel = 1;

/// Highest number of children per node
pub const TREE_MAX_DEGREE: u32 = NODES_PER_BLOCK as u32;

/// SHA-256 digest of a block
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; HASH_SIZE]);

impl BlockHash {
    /// Get the digest bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}…", hex::encode(&self.0[..4]))
    }
}

/// One on-disk block
#[derive(Clone, PartialEq, Eq)]
pub struct Block(Box<[u8; BLOCK_SIZE]>);

impl Block {
    /// Create a zero-filled block
    #[must_use]
    pub fn new() -> Self {
        Self(Box::new([0u8; BLOCK_SIZE]))
    }

    /// Create a block from exactly [`BLOCK_SIZE`] bytes
    pub fn from_slice(src: &[u8]) -> Result<Self> {
        if src.len() != BLOCK_SIZE {
            return Err(Error::invalid_argument(format!(
                "block must be {BLOCK_SIZE} bytes, got {}",
                src.len()
            )));
        }
        let mut blk = Self::new();
        blk.0.copy_from_slice(src);
        Ok(blk)
    }

    /// Get the block as a slice
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    /// Get the block as a mutable slice
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0[..]
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}

impl AsRef<[u8]> for Block {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({}…)", hex::encode(&self.0[..16]))
    }
}

/// Inner node: reference to a child block
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Type1Node {
    pub pba: Pba,
    pub generation: Generation,
    pub hash: BlockHash,
}

impl Type1Node {
    #[must_use]
    pub const fn new(pba: Pba, generation: Generation, hash: BlockHash) -> Self {
        Self {
            pba,
            generation,
            hash,
        }
    }

    /// Whether the slot references a block
    #[must_use]
    pub const fn valid(&self) -> bool {
        self.pba != INVALID_PBA
    }

    /// Whether the referenced block was written in the current, not yet
    /// secured generation and may thus be overwritten in place
    #[must_use]
    pub const fn is_volatile(&self, curr_gen: Generation) -> bool {
        self.generation == curr_gen
    }

    fn decode(buf: &mut &[u8]) -> Self {
        let pba = buf.get_u64_le();
        let generation = buf.get_u64_le();
        let mut hash = BlockHash::default();
        buf.copy_to_slice(&mut hash.0);
        buf.advance(TYPE1_NODE_PADDING);
        Self {
            pba,
            generation,
            hash,
        }
    }

    fn encode(&self, buf: &mut &mut [u8]) {
        buf.put_u64_le(self.pba);
        buf.put_u64_le(self.generation);
        buf.put_slice(&self.hash.0);
        buf.put_bytes(0, TYPE1_NODE_PADDING);
    }
}

impl fmt::Display for Type1Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pba {} gen {} hash {}",
            self.pba, self.generation, self.hash
        )
    }
}

/// Leaf node: one block tracked by the tree
///
/// A reserved node names a block in use that was allocated in `alloc_gen`.
/// An unreserved node names a spare block that was released in `free_gen`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Type2Node {
    pub pba: Pba,
    pub alloc_gen: Generation,
    pub free_gen: Generation,
    pub reserved: bool,
}

impl Type2Node {
    /// A node naming a block in use
    #[must_use]
    pub const fn reserved(pba: Pba, alloc_gen: Generation) -> Self {
        Self {
            pba,
            alloc_gen,
            free_gen: INITIAL_GENERATION,
            reserved: true,
        }
    }

    /// A node naming a spare block
    #[must_use]
    pub const fn spare(pba: Pba, free_gen: Generation) -> Self {
        Self {
            pba,
            alloc_gen: INITIAL_GENERATION,
            free_gen,
            reserved: false,
        }
    }

    #[must_use]
    pub const fn valid(&self) -> bool {
        self.pba != INVALID_PBA
    }

    /// Whether the block may be handed out in generation `curr_gen`
    ///
    /// Blocks released in the current generation are still referenced by
    /// the last secured snapshot.
    #[must_use]
    pub const fn is_spare_for(&self, curr_gen: Generation) -> bool {
        self.valid() && !self.reserved && self.free_gen != curr_gen
    }

    fn decode(buf: &mut &[u8]) -> Self {
        let pba = buf.get_u64_le();
        let alloc_gen = buf.get_u64_le();
        let free_gen = buf.get_u64_le();
        let reserved = buf.get_u8() != 0;
        buf.advance(TYPE2_NODE_PADDING);
        Self {
            pba,
            alloc_gen,
            free_gen,
            reserved,
        }
    }

    fn encode(&self, buf: &mut &mut [u8]) {
        buf.put_u64_le(self.pba);
        buf.put_u64_le(self.alloc_gen);
        buf.put_u64_le(self.free_gen);
        buf.put_u8(u8::from(self.reserved));
        buf.put_bytes(0, TYPE2_NODE_PADDING);
    }
}

impl fmt::Display for Type2Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pba {} alloc_gen {} free_gen {} reserved {}",
            self.pba, self.alloc_gen, self.free_gen, self.reserved
        )
    }
}

/// Block of inner nodes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Type1NodeBlock {
    pub nodes: [Type1Node; NODES_PER_BLOCK],
}

impl Default for Type1NodeBlock {
    fn default() -> Self {
        Self {
            nodes: [Type1Node::default(); NODES_PER_BLOCK],
        }
    }
}

impl Type1NodeBlock {
    #[must_use]
    pub fn decode_from_block(blk: &Block) -> Self {
        let mut buf = blk.as_slice();
        let mut node_blk = Self::default();
        for node in &mut node_blk.nodes {
            *node = Type1Node::decode(&mut buf);
        }
        node_blk
    }

    pub fn encode_to_block(&self, blk: &mut Block) {
        let mut buf = blk.as_mut_slice();
        for node in &self.nodes {
            node.encode(&mut buf);
        }
    }
}

/// Block of leaf nodes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Type2NodeBlock {
    pub nodes: [Type2Node; NODES_PER_BLOCK],
}

impl Default for Type2NodeBlock {
    fn default() -> Self {
        Self {
            nodes: [Type2Node::default(); NODES_PER_BLOCK],
        }
    }
}

impl Type2NodeBlock {
    #[must_use]
    pub fn decode_from_block(blk: &Block) -> Self {
        let mut buf = blk.as_slice();
        let mut node_blk = Self::default();
        for node in &mut node_blk.nodes {
            *node = Type2Node::decode(&mut buf);
        }
        node_blk
    }

    pub fn encode_to_block(&self, blk: &mut Block) {
        let mut buf = blk.as_mut_slice();
        for node in &self.nodes {
            node.encode(&mut buf);
        }
    }
}

/// Shape of a tree
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeGeometry {
    /// Level of the root block (leaf blocks are level 1)
    pub max_level: TreeLevel,
    /// Number of used slots per node block
    pub edges: u32,
    /// Number of leaf slots in use across the tree
    pub leaves: u64,
}

impl TreeGeometry {
    /// Create a validated geometry
    pub fn new(max_level: TreeLevel, edges: u32, leaves: u64) -> Result<Self> {
        let geometry = Self {
            max_level,
            edges,
            leaves,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Number of leaf slots a tree of this height and degree can hold
    #[must_use]
    pub fn max_leaves(&self) -> u64 {
        u64::from(self.edges).saturating_pow(self.max_level)
    }

    /// Number of leaf slots covered by one slot of a node block at `level`
    #[must_use]
    pub fn leaves_per_slot(&self, level: TreeLevel) -> u64 {
        u64::from(self.edges).saturating_pow(level - LEAF_LEVEL)
    }

    pub fn validate(&self) -> Result<()> {
        if !(TREE_MIN_INNER_LEVEL..=TREE_MAX_LEVEL).contains(&self.max_level) {
            return Err(Error::invalid_geometry(format!(
                "max level {} outside {}..={}",
                self.max_level, TREE_MIN_INNER_LEVEL, TREE_MAX_LEVEL
            )));
        }
        if self.edges == 0 || self.edges > TREE_MAX_DEGREE {
            return Err(Error::invalid_geometry(format!(
                "edges {} outside 1..={}",
                self.edges, TREE_MAX_DEGREE
            )));
        }
        if self.leaves == 0 || self.leaves > self.max_leaves() {
            return Err(Error::invalid_geometry(format!(
                "leaves {} outside 1..={}",
                self.leaves,
                self.max_leaves()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for TreeGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "max_lvl {} edges {} leaves {}",
            self.max_level, self.edges, self.leaves
        )
    }
}
