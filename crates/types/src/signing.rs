//! Canonical signable payloads for consensus messages.
//!
//! Every signature in the protocol covers an explicit byte string built
//! here: a domain-separation tag followed by the consensus fields in fixed
//! little-endian layout. Keeping the payloads independent of any codec
//! makes the signed form deterministic by construction.

use crate::{BlockNumber, Hash};

/// Domain tag for block proposals.
pub const DOMAIN_PREPARE_BLOCK: &[u8] = b"prepare_block:";
/// Domain tag for prepare votes (and the certificates aggregating them).
pub const DOMAIN_PREPARE_VOTE: &[u8] = b"prepare_vote:";
/// Domain tag for view changes (and the certificates aggregating them).
pub const DOMAIN_VIEW_CHANGE: &[u8] = b"view_change:";

/// Signable payload of a block proposal.
pub fn prepare_block_message(
    epoch: u64,
    view_number: u64,
    block_hash: &Hash,
    block_number: BlockNumber,
    block_index: u32,
) -> Vec<u8> {
    let mut message = Vec::with_capacity(DOMAIN_PREPARE_BLOCK.len() + 60);
    message.extend_from_slice(DOMAIN_PREPARE_BLOCK);
    message.extend_from_slice(&epoch.to_le_bytes());
    message.extend_from_slice(&view_number.to_le_bytes());
    message.extend_from_slice(block_hash.as_bytes());
    message.extend_from_slice(&block_number.0.to_le_bytes());
    message.extend_from_slice(&block_index.to_le_bytes());
    message
}

/// Signable payload of a prepare vote.
///
/// The parent certificate a vote carries is attached at send time and is
/// not part of the signed form.
pub fn prepare_vote_message(
    epoch: u64,
    view_number: u64,
    block_hash: &Hash,
    block_number: BlockNumber,
    block_index: u32,
) -> Vec<u8> {
    let mut message = Vec::with_capacity(DOMAIN_PREPARE_VOTE.len() + 60);
    message.extend_from_slice(DOMAIN_PREPARE_VOTE);
    message.extend_from_slice(&epoch.to_le_bytes());
    message.extend_from_slice(&view_number.to_le_bytes());
    message.extend_from_slice(block_hash.as_bytes());
    message.extend_from_slice(&block_number.0.to_le_bytes());
    message.extend_from_slice(&block_index.to_le_bytes());
    message
}

/// Signable payload of a view change.
///
/// Covers the view being abandoned and the signer's highest certified
/// block; the attached prepare certificate is not part of the signed form.
pub fn view_change_message(
    epoch: u64,
    view_number: u64,
    block_hash: &Hash,
    block_number: BlockNumber,
) -> Vec<u8> {
    let mut message = Vec::with_capacity(DOMAIN_VIEW_CHANGE.len() + 56);
    message.extend_from_slice(DOMAIN_VIEW_CHANGE);
    message.extend_from_slice(&epoch.to_le_bytes());
    message.extend_from_slice(&view_number.to_le_bytes());
    message.extend_from_slice(block_hash.as_bytes());
    message.extend_from_slice(&block_number.0.to_le_bytes());
    message
}
