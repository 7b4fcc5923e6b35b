//! Errors surfaced by the consensus core.

use trellis_types::{AggregateError, BlockNumber, Hash, ValidatorIndex};

/// Errors a message handler can return to the dispatch loop.
///
/// `NeedFetch` doubles as a request: the dispatcher issues the peer fetch
/// and logs the error. Everything else is logged and dropped; no handler
/// error leaves consensus state partially mutated.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConsensusError {
    /// An ancestor of the message is missing; the caller should pull
    /// `(hash, number)` from the sending peer.
    #[error("missing ancestor, fetch #{number}({hash:?})")]
    NeedFetch {
        /// Hash of the block to fetch.
        hash: Hash,
        /// Height of the block to fetch.
        number: BlockNumber,
    },

    /// The message is fatally unacceptable in the current state.
    #[error("message discarded: {0}")]
    Discard(String),

    /// The message's signature does not verify for the claimed signer.
    #[error("invalid signature from validator {0}")]
    InvalidSignature(ValidatorIndex),

    /// The claimed signer is not in the validator set at that height.
    #[error("unknown validator {0}")]
    UnknownValidator(ValidatorIndex),

    /// An aggregated certificate failed verification.
    #[error("invalid quorum certificate: {0}")]
    InvalidQuorumCert(String),

    /// The local node holds no seat at the given height.
    #[error("local node is not a validator at block {0}")]
    NotValidator(BlockNumber),

    /// A malformed call, such as a mismatched catch-up batch.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Signature aggregation failed.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}
