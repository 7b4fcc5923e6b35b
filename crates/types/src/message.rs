//! The three consensus message kinds, plus the certificate announcement.

use crate::{
    prepare_block_message, prepare_vote_message, view_change_message, Block, BlockNumber, Hash,
    QuorumCert, Signature, ValidatorIndex, ViewChangeQC,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A block proposal from the view leader for one `(epoch, view, index)`
/// slot. The first proposal of a view may carry the view-change
/// certificate that justifies entering the view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareBlock {
    /// Epoch of the proposing view.
    pub epoch: u64,
    /// The proposing view.
    pub view_number: u64,
    /// The proposed block.
    pub block: Block,
    /// Slot of the block within the view.
    pub block_index: u32,
    /// Validator index of the proposer.
    pub proposal_index: ValidatorIndex,
    /// Justification for a view jump, on the first block of a view only.
    pub view_change_qc: Option<ViewChangeQC>,
    /// Proposer's signature.
    pub signature: Signature,
}

impl PrepareBlock {
    /// The payload covered by the proposer's signature.
    pub fn signed_payload(&self) -> Vec<u8> {
        prepare_block_message(
            self.epoch,
            self.view_number,
            &self.block.hash(),
            self.block.number(),
            self.block_index,
        )
    }
}

impl fmt::Display for PrepareBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prepareBlock(epoch={} view={} index={} block={})",
            self.epoch, self.view_number, self.block_index, self.block
        )
    }
}

/// A validator's endorsement of one proposed block.
///
/// The parent certificate is attached when the vote is released, never at
/// signing time, and is excluded from the signed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareVote {
    /// Epoch of the voted view.
    pub epoch: u64,
    /// The voted view.
    pub view_number: u64,
    /// Hash of the endorsed block.
    pub block_hash: Hash,
    /// Height of the endorsed block.
    pub block_number: BlockNumber,
    /// Slot of the block within the view.
    pub block_index: u32,
    /// Index of the voting validator.
    pub validator_index: ValidatorIndex,
    /// Certificate of the parent block, populated at send time.
    pub parent_qc: Option<QuorumCert>,
    /// The validator's signature share.
    pub signature: Signature,
}

impl PrepareVote {
    /// The payload covered by the signature share.
    pub fn signed_payload(&self) -> Vec<u8> {
        prepare_vote_message(
            self.epoch,
            self.view_number,
            &self.block_hash,
            self.block_number,
            self.block_index,
        )
    }
}

impl fmt::Display for PrepareVote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prepareVote(epoch={} view={} index={} #{}({:?}) validator={})",
            self.epoch,
            self.view_number,
            self.block_index,
            self.block_number,
            self.block_hash,
            self.validator_index
        )
    }
}

/// A validator's request to abandon the current view, referencing its
/// highest certified block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChange {
    /// Epoch of the view being abandoned.
    pub epoch: u64,
    /// The view being abandoned.
    pub view_number: u64,
    /// Hash of the signer's highest certified block.
    pub block_hash: Hash,
    /// Height of that block.
    pub block_number: BlockNumber,
    /// Index of the signing validator.
    pub validator_index: ValidatorIndex,
    /// Certificate of the referenced block; absent only for genesis.
    pub prepare_qc: Option<QuorumCert>,
    /// The validator's signature share.
    pub signature: Signature,
}

impl ViewChange {
    /// The payload covered by the signature share.
    pub fn signed_payload(&self) -> Vec<u8> {
        view_change_message(self.epoch, self.view_number, &self.block_hash, self.block_number)
    }
}

impl fmt::Display for ViewChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "viewChange(epoch={} view={} #{}({:?}) validator={})",
            self.epoch, self.view_number, self.block_number, self.block_hash, self.validator_index
        )
    }
}

/// Announcement of a freshly formed quorum certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockQuorumCert {
    /// The certificate being announced.
    pub block_qc: QuorumCert,
}

impl fmt::Display for BlockQuorumCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blockQuorumCert({})", self.block_qc)
    }
}
