//! Primary succession.
//!
//! Once the primary is declared dead every surviving node evaluates the same rule
//! on its own view: the lowest node id among itself and the healthy backups it
//! knows takes over. The chosen node catches up from the most advanced peer,
//! claims the next epoch and announces itself. No voting round is needed because
//! the epoch fences out any older primary that comes back.

use futures::future::join_all;
use tracing::{info, warn};

use crate::cluster::{ClusterView, Health, NodeId, Role};
use crate::detector::{self, Adoption};
use crate::error::{InventoryError, Result};
use crate::message::{Request, Response};
use crate::node::Node;
use crate::transport;

/// The node that should hold the primary role next, if the role is vacant.
pub fn select_successor(view: &ClusterView, local: NodeId) -> Option<NodeId> {
    if view.primary.is_some() {
        return None;
    }
    view.nodes
        .values()
        .filter(|node| node.role == Role::Backup && node.health == Health::Healthy)
        .map(|node| node.node_id)
        .chain(std::iter::once(local))
        .min()
}

pub(crate) async fn maybe_failover(node: &Node) {
    let membership = node.membership();
    let local = membership.local_id();
    if select_successor(&membership.view(), local) == Some(local) {
        promote(node).await;
    }
}

async fn promote(node: &Node) {
    let membership = node.membership();
    let local = membership.local_id();
    let store = node.store();
    let write_path = node.replication().lock_write_path().await;
    if membership.view().primary.is_some() {
        return;
    }

    let most_advanced = detector::survey_peers(node).await;
    if let Some(primary) = membership.view().primary {
        info!(node = local, primary, "primary found while preparing promotion");
        return;
    }

    if let Some(peer) = most_advanced {
        info!(node = local, peer = peer.id, version = peer.version, "catching up before promotion");
        if let Err(err) = node.replication().sync_from(&peer.address, store.version()).await {
            warn!(node = local, peer = peer.id, error = %err, "catch-up before promotion failed");
            return;
        }
    }

    let epoch = membership.promote_self();
    let version = store.version();
    info!(node = local, epoch, version, "promoted to primary");
    drop(write_path);

    announce(node, epoch, version).await;
}

async fn announce(node: &Node, epoch: u64, version: u64) {
    let membership = node.membership();
    let local = membership.local_id();
    let timeout = node.config().timing.sync_timeout;
    let request = Request::AnnouncePrimary {
        node_id: local,
        epoch,
        version,
    };
    let sends = membership.peers().into_iter().map(|(id, address)| {
        let request = &request;
        async move {
            let result = transport::call(&address, request, timeout)
                .await
                .and_then(Response::into_result);
            (id, result)
        }
    });
    for (peer, result) in join_all(sends).await {
        match result {
            Ok(_) => {}
            Err(InventoryError::StaleEpoch { current }) => {
                if membership.step_down(current) {
                    warn!(node = local, peer, epoch = current, "announcement rejected, stepping down");
                }
            }
            Err(err) => warn!(node = local, peer, error = %err, "announcement not delivered"),
        }
    }
}

/// Handles `announce_primary` from a newly promoted node.
pub(crate) async fn handle_announce(node: &Node, primary: NodeId, epoch: u64) -> Result<()> {
    let membership = node.membership();
    let _write_path = node.replication().lock_write_path().await;
    let was_primary = membership.is_primary();
    if membership.adopt_primary(primary, epoch)? == Adoption::Adopted {
        if was_primary {
            warn!(node = membership.local_id(), primary, epoch, "demoted by announced primary");
        } else {
            info!(node = membership.local_id(), primary, epoch, "new primary announced");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::{descriptor, view};

    #[test]
    fn lowest_healthy_backup_succeeds() {
        let view = view(
            None,
            vec![
                descriptor(1, Role::Backup, Health::Dead),
                descriptor(2, Role::Backup, Health::Healthy),
                descriptor(3, Role::Backup, Health::Healthy),
            ],
        );
        assert_eq!(select_successor(&view, 3), Some(2));
        assert_eq!(select_successor(&view, 2), Some(2));
    }

    #[test]
    fn unhealthy_backups_are_passed_over() {
        let view = view(
            None,
            vec![
                descriptor(1, Role::Backup, Health::Dead),
                descriptor(2, Role::Backup, Health::Suspected),
                descriptor(3, Role::Backup, Health::Healthy),
            ],
        );
        assert_eq!(select_successor(&view, 3), Some(3));
    }

    #[test]
    fn no_succession_while_a_primary_exists() {
        let view = view(
            Some(1),
            vec![
                descriptor(1, Role::Primary, Health::Healthy),
                descriptor(2, Role::Backup, Health::Healthy),
            ],
        );
        assert_eq!(select_successor(&view, 2), None);
    }
}
