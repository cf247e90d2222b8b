//! Immutable snapshot of cluster membership.
//!
//! A [`ClusterView`] is never mutated in place. The failure detector builds a new
//! one on every role or health change and publishes it behind an `Arc`, so the
//! router, load balancer and request handlers always see one consistent picture
//! with at most one primary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type NodeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Primary,
    Backup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Suspected,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: NodeId,
    pub address: String,
    pub role: Role,
    pub health: Health,
    /// Last applied version this node reported (or holds, for the local node).
    pub version: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterView {
    pub epoch: u64,
    pub primary: Option<NodeId>,
    pub nodes: BTreeMap<NodeId, NodeDescriptor>,
}

impl ClusterView {
    pub fn node(&self, id: NodeId) -> Option<&NodeDescriptor> {
        self.nodes.get(&id)
    }

    pub fn address_of(&self, id: NodeId) -> Option<&str> {
        self.nodes.get(&id).map(|node| node.address.as_str())
    }

    pub fn primary_address(&self) -> Option<&str> {
        self.primary.and_then(|id| self.address_of(id))
    }

    /// Backups eligible to serve reads, in ascending id order.
    pub fn healthy_backups(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes
            .values()
            .filter(move |node| Some(node.node_id) != self.primary)
            .filter(|node| node.role == Role::Backup && node.health == Health::Healthy)
    }

    /// Backups a primary still sends writes to: everything not yet declared dead.
    pub fn replication_targets(&self, local: NodeId) -> Vec<NodeDescriptor> {
        self.nodes
            .values()
            .filter(|node| node.node_id != local && node.role == Role::Backup)
            .filter(|node| node.health != Health::Dead)
            .cloned()
            .collect()
    }

    pub fn healthy_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|node| node.health == Health::Healthy)
            .count()
    }

    pub fn primary_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|node| node.role == Role::Primary)
            .count()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn descriptor(id: NodeId, role: Role, health: Health) -> NodeDescriptor {
        NodeDescriptor {
            node_id: id,
            address: format!("127.0.0.1:{}", 9000 + id),
            role,
            health,
            version: 0,
        }
    }

    pub(crate) fn view(primary: Option<NodeId>, nodes: Vec<NodeDescriptor>) -> ClusterView {
        ClusterView {
            epoch: 0,
            primary,
            nodes: nodes.into_iter().map(|node| (node.node_id, node)).collect(),
        }
    }

    #[test]
    fn healthy_backups_skip_primary_and_unhealthy_nodes() {
        let view = view(
            Some(1),
            vec![
                descriptor(1, Role::Primary, Health::Healthy),
                descriptor(2, Role::Backup, Health::Healthy),
                descriptor(3, Role::Backup, Health::Suspected),
                descriptor(4, Role::Backup, Health::Dead),
                descriptor(5, Role::Backup, Health::Healthy),
            ],
        );
        let ids: Vec<_> = view.healthy_backups().map(|node| node.node_id).collect();
        assert_eq!(ids, vec![2, 5]);
        assert_eq!(view.primary_address(), Some("127.0.0.1:9001"));
        assert_eq!(view.healthy_count(), 3);
    }

    #[test]
    fn replication_targets_keep_suspected_backups() {
        let view = view(
            Some(1),
            vec![
                descriptor(1, Role::Primary, Health::Healthy),
                descriptor(2, Role::Backup, Health::Suspected),
                descriptor(3, Role::Backup, Health::Dead),
            ],
        );
        let ids: Vec<_> = view
            .replication_targets(1)
            .into_iter()
            .map(|node| node.node_id)
            .collect();
        assert_eq!(ids, vec![2]);
    }
}
