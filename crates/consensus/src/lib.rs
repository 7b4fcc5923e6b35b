//! Pipelined, leader-based BFT consensus core.
//!
//! This crate implements the decision logic of a chain-of-blocks BFT
//! engine as a synchronous state machine: events in, actions out.
//!
//! # Protocol
//!
//! Time is divided into **views** within **epochs**. The leader of a view
//! proposes up to `amount` blocks in pipelined slots. Validators execute
//! each proposal, sign a prepare vote, and release votes in slot order
//! once the parent block is certified. A slot whose votes reach the
//! `2n/3 + 1` threshold yields a **quorum certificate**; the chain of
//! certificates drives the 3-chain commit rule (a block commits once it
//! has two certified descendants in a row). A view ends when every slot
//! is certified or a quorum of validators signs a view change.
//!
//! # Architecture
//!
//! The state machine processes events synchronously:
//!
//! - `Event::PrepareBlockReceived` → validate, store, execute
//! - `Event::PrepareVoteReceived` → collect votes, form QC at quorum
//! - `Event::ViewChangeReceived` → collect, rotate at quorum
//! - `Event::ViewTimeout` → sign and broadcast a view change
//! - `Event::QcBlocksReceived` → verified catch-up
//! - `Event::BlockExecuted` → sign the executed block, keep the
//!   pipeline moving
//!
//! All I/O is performed by the runner via returned `Action`s.

mod aggregator;
mod block_tree;
mod config;
mod error;
mod safety;
mod state;
mod view_state;

pub use aggregator::{generate_prepare_qc, generate_view_change_qc};
pub use block_tree::BlockTree;
pub use config::ConsensusConfig;
pub use error::ConsensusError;
pub use safety::{SafetyRules, Verdict, VoteRules};
pub use state::ConsensusState;
pub use view_state::{ExecutingCursor, PendingVotes, SentVotes, ViewState};
