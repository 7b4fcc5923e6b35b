//! Core types for the Trellis consensus engine.
//!
//! This crate provides the foundational types used throughout the
//! consensus implementation:
//!
//! - **Primitives**: [`Hash`], BLS keys and signatures
//! - **Identifiers**: [`BlockNumber`], [`ValidatorIndex`], [`NodeId`], [`PeerId`]
//! - **Consensus types**: [`Block`], [`QuorumCert`], [`ViewChangeQC`],
//!   the three message kinds, [`SignerBitfield`]
//! - **Membership**: [`ValidatorSet`] and the [`ValidatorPool`] trait
//! - **Signing**: domain-separated signable payload builders
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not
//! depend on any other workspace crates, making it the foundation layer.

mod crypto;
mod hash;
mod identifiers;
mod signing;

// Consensus types
mod block;
mod message;
mod quorum_cert;
mod signer_bitfield;
mod validator;

pub use block::{Block, BlockHeader};
pub use crypto::{AggregateError, KeyPair, PublicKey, Signature};
pub use hash::{Hash, HexError};
pub use identifiers::{BlockNumber, NodeId, PeerId, ValidatorIndex};
pub use message::{BlockQuorumCert, PrepareBlock, PrepareVote, ViewChange};
pub use quorum_cert::{QuorumCert, ViewChangeQC, ViewChangeQuorumCert};
pub use signer_bitfield::SignerBitfield;
pub use signing::{
    prepare_block_message, prepare_vote_message, view_change_message, DOMAIN_PREPARE_BLOCK,
    DOMAIN_PREPARE_VOTE, DOMAIN_VIEW_CHANGE,
};
pub use validator::{
    quorum_threshold, StaticValidatorPool, ValidatorError, ValidatorInfo, ValidatorPool,
    ValidatorSet,
};
