//! Validator sets and the validator pool trait.
//!
//! The pool answers membership questions for a given chain height so the
//! consensus core stays agnostic of how epochs are sourced. A fixed-set
//! implementation is provided; epoch-switching pools live with the node.

use crate::{BlockNumber, NodeId, PublicKey, ValidatorIndex};
use std::fmt;

/// Minimum number of matching signatures for a quorum: `2n/3 + 1`.
pub fn quorum_threshold(n: usize) -> usize {
    n * 2 / 3 + 1
}

/// Errors from validator pool operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidatorError {
    /// No validator with the given index at the given height.
    #[error("no validator at index {0}")]
    UnknownIndex(ValidatorIndex),
    /// No validator with the given node identity at the given height.
    #[error("node {0} is not a validator")]
    UnknownNode(NodeId),
    /// The pool failed to switch to the next validator set.
    #[error("validator set update failed: {0}")]
    UpdateFailed(String),
}

/// One seat in a validator set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorInfo {
    /// Seat index, used in vote messages and signer bitmaps.
    pub index: ValidatorIndex,
    /// Stable node identity.
    pub node_id: NodeId,
    /// BLS public key for this seat.
    pub public_key: PublicKey,
}

/// An ordered validator set, fixed for the duration of an epoch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidatorSet {
    validators: Vec<ValidatorInfo>,
}

impl ValidatorSet {
    /// Build a set from seats ordered by index.
    pub fn new(validators: Vec<ValidatorInfo>) -> Self {
        ValidatorSet { validators }
    }

    /// Number of seats.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// True for an empty set.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Seat lookup by index.
    pub fn by_index(&self, index: ValidatorIndex) -> Option<&ValidatorInfo> {
        self.validators.iter().find(|v| v.index == index)
    }

    /// Seat lookup by node identity.
    pub fn by_node_id(&self, node_id: &NodeId) -> Option<&ValidatorInfo> {
        self.validators.iter().find(|v| v.node_id == *node_id)
    }

    /// Iterate over the seats in index order.
    pub fn iter(&self) -> impl Iterator<Item = &ValidatorInfo> {
        self.validators.iter()
    }

    /// The quorum threshold for this set.
    pub fn threshold(&self) -> usize {
        quorum_threshold(self.len())
    }
}

impl fmt::Display for ValidatorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validators(n={})", self.len())
    }
}

/// Height-aware validator membership, injected into the consensus core.
pub trait ValidatorPool: Send + Sync {
    /// Size of the validator set in effect at `block_number`.
    fn len(&self, block_number: BlockNumber) -> usize;

    /// Seat lookup by index at `block_number`.
    fn validator_by_index(
        &self,
        block_number: BlockNumber,
        index: ValidatorIndex,
    ) -> Option<ValidatorInfo>;

    /// Seat lookup by node identity at `block_number`.
    fn validator_by_node_id(
        &self,
        block_number: BlockNumber,
        node_id: &NodeId,
    ) -> Option<ValidatorInfo>;

    /// Whether `node_id` holds a seat at `block_number`.
    fn is_validator(&self, block_number: BlockNumber, node_id: &NodeId) -> bool {
        self.validator_by_node_id(block_number, node_id).is_some()
    }

    /// Whether `node_id` is a known candidate: a node that follows
    /// consensus and executes blocks without holding a seat.
    fn is_candidate(&self, node_id: &NodeId) -> bool;

    /// Whether committing a block at `block_number` ends the current
    /// membership era.
    fn should_switch(&self, block_number: BlockNumber) -> bool;

    /// Switch to the validator set that takes effect after
    /// `block_number`.
    fn update(&self, block_number: BlockNumber) -> Result<(), ValidatorError>;

    /// The leader seat for a view: round-robin over the set in effect at
    /// `block_number`.
    fn proposer(
        &self,
        block_number: BlockNumber,
        epoch: u64,
        view_number: u64,
    ) -> Option<ValidatorIndex> {
        let n = self.len(block_number) as u64;
        if n == 0 {
            return None;
        }
        Some(ValidatorIndex(((epoch + view_number) % n) as u32))
    }
}

/// A pool backed by one fixed validator set, for single-epoch deployments
/// and tests.
#[derive(Debug, Clone)]
pub struct StaticValidatorPool {
    set: ValidatorSet,
}

impl StaticValidatorPool {
    /// Wrap a fixed set.
    pub fn new(set: ValidatorSet) -> Self {
        StaticValidatorPool { set }
    }
}

impl ValidatorPool for StaticValidatorPool {
    fn len(&self, _block_number: BlockNumber) -> usize {
        self.set.len()
    }

    fn validator_by_index(
        &self,
        _block_number: BlockNumber,
        index: ValidatorIndex,
    ) -> Option<ValidatorInfo> {
        self.set.by_index(index).cloned()
    }

    fn validator_by_node_id(
        &self,
        _block_number: BlockNumber,
        node_id: &NodeId,
    ) -> Option<ValidatorInfo> {
        self.set.by_node_id(node_id).cloned()
    }

    fn is_candidate(&self, _node_id: &NodeId) -> bool {
        false
    }

    fn should_switch(&self, _block_number: BlockNumber) -> bool {
        false
    }

    fn update(&self, _block_number: BlockNumber) -> Result<(), ValidatorError> {
        Ok(())
    }
}
