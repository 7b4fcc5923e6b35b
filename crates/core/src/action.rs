//! Action types for the deterministic state machine.

use crate::{message::OutboundMessage, TimerId};
use std::time::Duration;
use trellis_types::{
    Block, BlockHeader, BlockNumber, Hash, PeerId, PrepareVote, QuorumCert, ViewChange,
    ViewChangeQC,
};

/// Actions the consensus core wants performed.
///
/// Actions are **commands** describing something to do. The runner
/// executes them off the consensus thread and converts results back into
/// events where a result exists. The core never blocks on an action.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Broadcast a consensus message to all peers.
    Broadcast {
        /// The message to send.
        message: OutboundMessage,
    },

    /// Ask a peer for the chain of blocks leading up to `(hash, number)`.
    ///
    /// Responses arrive as `QcBlocksReceived` or `PrepareBlockReceived`
    /// events.
    FetchBlock {
        /// The peer to ask.
        from: PeerId,
        /// Hash of the wanted block.
        hash: Hash,
        /// Height of the wanted block.
        number: BlockNumber,
    },

    /// Ask a peer for a proposal the local node is missing in the current
    /// view, identified by its slot.
    FetchProposal {
        /// The peer to ask.
        from: PeerId,
        /// Epoch of the view.
        epoch: u64,
        /// The view.
        view_number: u64,
        /// The missing slot.
        block_index: u32,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Arm a timer. A previously armed timer with the same id is replaced.
    SetTimer {
        /// Which timer to arm.
        id: TimerId,
        /// How long until it fires.
        duration: Duration,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Delegated Work (async, returns callback event)
    // ═══════════════════════════════════════════════════════════════════════
    /// Evaluate a block on the execution engine.
    ///
    /// Fire and forget; completion arrives as `Event::BlockExecuted`.
    ExecuteBlock {
        /// The block to evaluate.
        block: Block,
        /// Its parent, already evaluated.
        parent: Block,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Bridge (write-ahead log + chain state)
    // ═══════════════════════════════════════════════════════════════════════
    /// Journal a view change this node is about to broadcast.
    SendViewChange {
        /// The locally signed view change.
        view_change: ViewChange,
    },

    /// Journal a prepare vote this node is about to broadcast.
    SendPrepareVote {
        /// The voted block.
        block: Block,
        /// The locally signed vote.
        vote: PrepareVote,
    },

    /// Journal a confirmed switch into a new view.
    ConfirmViewChange {
        /// Epoch of the new view.
        epoch: u64,
        /// The new view.
        view_number: u64,
        /// The block the rotation pivoted on.
        block: Block,
        /// That block's certificate, when one exists.
        qc: Option<QuorumCert>,
        /// The aggregated justification, when the rotation had one.
        view_change_qc: Option<ViewChangeQC>,
    },

    /// Report chain-state milestones to the outer system.
    ///
    /// Empty `lock`/`commit` signals that the node needs catch-up before
    /// it can commit again.
    UpdateChainState {
        /// The highest certified block.
        highest_qc: Block,
        /// The new lock block, when it advanced.
        lock: Option<Block>,
        /// The new commit block, when it advanced.
        commit: Option<Block>,
    },

    /// Hand an irrevocably committed block downstream.
    CommitBlock {
        /// The committed block.
        block: Block,
        /// The certificate that sealed it.
        qc: QuorumCert,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Transaction Pool + Block Cache
    // ═══════════════════════════════════════════════════════════════════════
    /// Point the transaction pool at a newly certified block.
    ResetTxPool {
        /// The new pool head.
        block: Block,
    },

    /// Roll the transaction pool back after abandoning proposals.
    ForkedResetTxPool {
        /// The header the pool should treat as its head.
        new_head: BlockHeader,
        /// Blocks whose transactions return to the pool.
        rollback: Vec<Block>,
    },

    /// Drop an abandoned block from the block cache writer.
    ClearBlockCache {
        /// The abandoned block.
        block: Block,
    },
}

impl Action {
    /// Check if this action leaves the node (network traffic).
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Action::Broadcast { .. } | Action::FetchBlock { .. } | Action::FetchProposal { .. }
        )
    }

    /// Check if this action is journaled by the bridge.
    pub fn is_bridge(&self) -> bool {
        matches!(
            self,
            Action::SendViewChange { .. }
                | Action::SendPrepareVote { .. }
                | Action::ConfirmViewChange { .. }
                | Action::UpdateChainState { .. }
                | Action::CommitBlock { .. }
        )
    }

    /// Get the action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::FetchBlock { .. } => "FetchBlock",
            Action::FetchProposal { .. } => "FetchProposal",
            Action::SetTimer { .. } => "SetTimer",
            Action::ExecuteBlock { .. } => "ExecuteBlock",
            Action::SendViewChange { .. } => "SendViewChange",
            Action::SendPrepareVote { .. } => "SendPrepareVote",
            Action::ConfirmViewChange { .. } => "ConfirmViewChange",
            Action::UpdateChainState { .. } => "UpdateChainState",
            Action::CommitBlock { .. } => "CommitBlock",
            Action::ResetTxPool { .. } => "ResetTxPool",
            Action::ForkedResetTxPool { .. } => "ForkedResetTxPool",
            Action::ClearBlockCache { .. } => "ClearBlockCache",
        }
    }
}
