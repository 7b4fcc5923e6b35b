//! Blocks as seen by the consensus layer.
//!
//! Consensus treats the payload as opaque bytes: a block is an immutable
//! record addressed by its hash, linked to its parent, positioned at a
//! height. Execution and transaction semantics live outside the core.

use crate::{BlockNumber, Hash};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Consensus-visible block metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Height in the chain.
    pub number: BlockNumber,
    /// Hash of the parent block.
    pub parent_hash: Hash,
    /// Proposal time in milliseconds since the unix epoch.
    pub timestamp: u64,
    /// Hash of the opaque payload.
    pub payload_hash: Hash,
}

/// A block: header plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Consensus metadata.
    pub header: BlockHeader,
    /// Opaque payload bytes, interpreted only by the execution engine.
    pub payload: Vec<u8>,
}

impl Block {
    /// Build a block, computing the payload hash.
    pub fn new(number: BlockNumber, parent_hash: Hash, timestamp: u64, payload: Vec<u8>) -> Self {
        let payload_hash = Hash::from_bytes(&payload);
        Block {
            header: BlockHeader {
                number,
                parent_hash,
                timestamp,
                payload_hash,
            },
            payload,
        }
    }

    /// The genesis block: height 0, zero parent, empty payload.
    pub fn genesis() -> Self {
        Block::new(BlockNumber(0), Hash::ZERO, 0, Vec::new())
    }

    /// The block hash: a digest over the header fields.
    pub fn hash(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.header.number.0.to_le_bytes());
        hasher.update(self.header.parent_hash.as_bytes());
        hasher.update(&self.header.timestamp.to_le_bytes());
        hasher.update(self.header.payload_hash.as_bytes());
        Hash(*hasher.finalize().as_bytes())
    }

    /// Height of this block.
    pub fn number(&self) -> BlockNumber {
        self.header.number
    }

    /// Hash of the parent block.
    pub fn parent_hash(&self) -> Hash {
        self.header.parent_hash
    }

    /// Whether this is the height-0 block.
    pub fn is_genesis(&self) -> bool {
        self.header.number.0 == 0
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}({:?})", self.header.number, self.hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_covers_header_fields() {
        let parent = Block::genesis();
        let a = Block::new(BlockNumber(1), parent.hash(), 10, vec![1]);
        let b = Block::new(BlockNumber(1), parent.hash(), 10, vec![2]);
        let c = Block::new(BlockNumber(1), parent.hash(), 11, vec![1]);
        assert_ne!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
        assert_eq!(a.hash(), a.clone().hash());
    }

    #[test]
    fn genesis_is_height_zero() {
        let g = Block::genesis();
        assert!(g.is_genesis());
        assert_eq!(g.parent_hash(), Hash::ZERO);
    }
}
