use std::collections::BTreeMap;
use std::time::Duration;

use crate::balancer::Algorithm;
use crate::cluster::NodeId;
use crate::detector::Thresholds;
use crate::error::{InventoryError, Result};

/// Every timer a node uses. Production defaults favour stability; [`Timing::fast`]
/// keeps integration tests quick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub suspect_after: u32,
    pub dead_after: u32,
    /// Per-backup wait for a replication acknowledgment.
    pub replication_timeout: Duration,
    /// Budget for catch-up, snapshot and announce exchanges.
    pub sync_timeout: Duration,
    pub metrics_interval: Duration,
    /// How often the primary reconsiders its balancing algorithm.
    pub balancer_review_interval: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            suspect_after: 3,
            dead_after: 2,
            replication_timeout: Duration::from_secs(1),
            sync_timeout: Duration::from_secs(3),
            metrics_interval: Duration::from_secs(5),
            balancer_review_interval: Duration::from_secs(10),
        }
    }
}

impl Timing {
    pub fn fast() -> Self {
        Self {
            probe_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(100),
            suspect_after: 2,
            dead_after: 1,
            replication_timeout: Duration::from_millis(300),
            sync_timeout: Duration::from_secs(1),
            metrics_interval: Duration::from_millis(200),
            balancer_review_interval: Duration::from_millis(200),
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            suspect_after: self.suspect_after,
            dead_after: self.dead_after,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    /// Address peers and clients use to reach this node.
    pub address: String,
    /// Other cluster members by id. An entry for `node_id` itself is ignored.
    pub peers: BTreeMap<NodeId, String>,
    pub initial_primary: Option<NodeId>,
    pub timing: Timing,
    pub seed_catalog: bool,
    pub forward_writes: bool,
    pub algorithm: Algorithm,
    /// Let the primary move from round robin to weighted balancing once the
    /// backups' response histories diverge.
    pub auto_balance: bool,
}

impl NodeConfig {
    pub fn new(node_id: NodeId, address: impl Into<String>) -> Self {
        Self {
            node_id,
            address: address.into(),
            peers: BTreeMap::new(),
            initial_primary: None,
            timing: Timing::default(),
            seed_catalog: true,
            forward_writes: false,
            algorithm: Algorithm::default(),
            auto_balance: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(InventoryError::Validation(
                "node address must not be empty".into(),
            ));
        }
        if let Some(primary) = self.initial_primary {
            if primary != self.node_id && !self.peers.contains_key(&primary) {
                return Err(InventoryError::Validation(format!(
                    "initial primary {primary} is not a known peer"
                )));
            }
        }
        if self.timing.suspect_after == 0 || self.timing.dead_after == 0 {
            return Err(InventoryError::Validation(
                "failure thresholds must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Parses a peer given as `id=host:port`.
pub fn parse_peer(raw: &str) -> Result<(NodeId, String)> {
    let (id, address) = raw
        .split_once('=')
        .ok_or_else(|| InventoryError::Validation(format!("peer '{raw}' must be id=address")))?;
    let id = id
        .trim()
        .parse::<NodeId>()
        .map_err(|err| InventoryError::Validation(format!("peer id '{id}': {err}")))?;
    let address = address.trim();
    if address.is_empty() {
        return Err(InventoryError::Validation(format!(
            "peer {id} has an empty address"
        )));
    }
    Ok((id, address.to_string()))
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Seed list of node addresses; the client discovers the primary among them.
    pub nodes: Vec<String>,
    pub request_timeout: Duration,
    /// Upper bound on tries while no primary is available.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl ClientConfig {
    pub fn new(nodes: Vec<String>) -> Self {
        Self {
            nodes,
            request_timeout: Duration::from_secs(5),
            max_attempts: 8,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
        }
    }
}
