//! Event types for the deterministic state machine.

use trellis_types::{
    Block, BlockNumber, Hash, PeerId, PrepareBlock, PrepareVote, QuorumCert, ViewChange,
};

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same instant are processed in priority order. Lower
/// values are processed first, so consequences of prior processing are
/// handled before new external inputs and causality is preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: consequences of prior event processing.
    Internal = 0,

    /// Timer events: scheduled by the node itself.
    Timer = 1,

    /// Network events: external inputs from other nodes.
    Network = 2,
}

/// All possible events the consensus core can receive.
///
/// Events are **passive data** describing something that happened. The
/// state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// The view timer expired without the view completing.
    ViewTimeout,

    // ═══════════════════════════════════════════════════════════════════════
    // Network Messages (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// A block proposal arrived from a peer.
    PrepareBlockReceived {
        /// The peer that delivered the message.
        from: PeerId,
        /// The proposal.
        message: PrepareBlock,
    },

    /// A prepare vote arrived from a peer.
    PrepareVoteReceived {
        /// The peer that delivered the message.
        from: PeerId,
        /// The vote.
        message: PrepareVote,
    },

    /// A view change arrived from a peer.
    ViewChangeReceived {
        /// The peer that delivered the message.
        from: PeerId,
        /// The view change.
        message: ViewChange,
    },

    /// A catch-up batch of certified blocks arrived, in chain order.
    ///
    /// `blocks[i]` is certified by `qcs[i]`.
    QcBlocksReceived {
        /// The blocks, oldest first.
        blocks: Vec<Block>,
        /// The matching certificates.
        qcs: Vec<QuorumCert>,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Async Callbacks (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════════
    /// The executor finished evaluating a block.
    ///
    /// Callback from [`Action::ExecuteBlock`](crate::Action::ExecuteBlock).
    BlockExecuted {
        /// Hash of the executed block.
        hash: Hash,
        /// Height of the executed block.
        number: BlockNumber,
        /// The failure message, if execution failed.
        error: Option<String>,
    },
}

impl Event {
    /// Get the priority for this event type.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::BlockExecuted { .. } => EventPriority::Internal,
            Event::ViewTimeout => EventPriority::Timer,
            Event::PrepareBlockReceived { .. }
            | Event::PrepareVoteReceived { .. }
            | Event::ViewChangeReceived { .. }
            | Event::QcBlocksReceived { .. } => EventPriority::Network,
        }
    }

    /// Check if this is an internal event (consequence of prior processing).
    pub fn is_internal(&self) -> bool {
        self.priority() == EventPriority::Internal
    }

    /// Check if this is a network event (from another node).
    pub fn is_network(&self) -> bool {
        self.priority() == EventPriority::Network
    }

    /// Get the event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::ViewTimeout => "ViewTimeout",
            Event::PrepareBlockReceived { .. } => "PrepareBlockReceived",
            Event::PrepareVoteReceived { .. } => "PrepareVoteReceived",
            Event::ViewChangeReceived { .. } => "ViewChangeReceived",
            Event::QcBlocksReceived { .. } => "QcBlocksReceived",
            Event::BlockExecuted { .. } => "BlockExecuted",
        }
    }
}
