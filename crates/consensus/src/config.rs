//! Consensus configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use trellis_types::NodeId;

/// Protocol and identity parameters of the consensus core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Pipeline depth: how many blocks one leader produces per view.
    pub amount: u32,

    /// This node's identity, used for validator-set lookups.
    pub node_id: NodeId,

    /// The view number assigned when a new epoch starts.
    pub default_view_number: u64,

    /// Base length of one view timer interval. The timer armed on view
    /// entry is `period * intervals`, where `intervals` shrinks when a
    /// partially filled view is inherited.
    pub period: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            amount: 10,
            node_id: NodeId([0u8; 32]),
            default_view_number: 0,
            period: Duration::from_secs(10),
        }
    }
}
