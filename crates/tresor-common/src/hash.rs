//! Block hashing
//!
//! Every tree node records the SHA-256 digest of the block it references.
//! Readers verify the digest before trusting a block's content.

use crate::types::{Block, BlockHash};
use sha2::{Digest, Sha256};

/// Compute the digest of a block
#[must_use]
pub fn hash_block(blk: &Block) -> BlockHash {
    BlockHash(Sha256::digest(blk.as_slice()).into())
}

/// Verify a block against the digest recorded by its parent
#[must_use]
pub fn check_hash(blk: &Block, expected: &BlockHash) -> bool {
    hash_block(blk) == *expected
}
