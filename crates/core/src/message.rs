//! Outbound message types for network communication.

use trellis_types::{BlockQuorumCert, PrepareBlock, PrepareVote, ViewChange};

/// Outbound network messages.
///
/// These are the messages a node can send to other nodes. The runner
/// handles the actual network I/O.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// A block proposal from the view leader.
    PrepareBlock(PrepareBlock),

    /// A vote endorsing a proposed block.
    PrepareVote(PrepareVote),

    /// A request to abandon the current view.
    ViewChange(ViewChange),

    /// Announcement of a freshly formed quorum certificate.
    BlockQuorumCert(BlockQuorumCert),
}

impl OutboundMessage {
    /// Get a human-readable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::PrepareBlock(_) => "PrepareBlock",
            OutboundMessage::PrepareVote(_) => "PrepareVote",
            OutboundMessage::ViewChange(_) => "ViewChange",
            OutboundMessage::BlockQuorumCert(_) => "BlockQuorumCert",
        }
    }

    /// Check if this message carries an aggregated certificate.
    pub fn is_certificate(&self) -> bool {
        matches!(self, OutboundMessage::BlockQuorumCert(_))
    }
}
