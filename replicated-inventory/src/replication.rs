//! Primary-to-backup replication.
//!
//! The primary applies a mutation locally, which assigns the next version, then
//! pushes the resulting log entry to every backup that is not dead and waits for
//! each acknowledgment up to the replication timeout. Backups apply entries strictly
//! in version order, replaying any missing range from the primary first.
//!
//! All writes, replicated applies and snapshot installs on one node go through a
//! single write-path lock, which also excludes promotion.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::cluster::NodeId;
use crate::config::Timing;
use crate::detector::{Adoption, Membership};
use crate::error::{InventoryError, Result};
use crate::message::{Request, Response};
use crate::store::{InventoryKey, InventoryStore, Operation, ReplicaApply, TransactionLogEntry};
use crate::transport;

/// What the primary reports back for an accepted write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub quantity: u64,
    pub version: u64,
    pub transaction_id: String,
    /// Backups that acknowledged before their deadline.
    pub acked: usize,
    pub targets: usize,
}

pub struct ReplicationManager {
    local: NodeId,
    store: Arc<InventoryStore>,
    membership: Arc<Membership>,
    timing: Timing,
    write_path: Mutex<()>,
}

impl ReplicationManager {
    pub fn new(store: Arc<InventoryStore>, membership: Arc<Membership>, timing: Timing) -> Self {
        Self {
            local: membership.local_id(),
            store,
            membership,
            timing,
            write_path: Mutex::new(()),
        }
    }

    pub(crate) async fn lock_write_path(&self) -> MutexGuard<'_, ()> {
        self.write_path.lock().await
    }

    /// Applies a client mutation on the primary and replicates it.
    ///
    /// The write succeeds once applied locally; backups that miss the deadline
    /// are marked suspected instead of failing the request.
    pub async fn propose(
        &self,
        operation: Operation,
        key: &InventoryKey,
        delta: u64,
    ) -> Result<WriteOutcome> {
        let _write_path = self.write_path.lock().await;
        if !self.membership.is_primary() {
            return Err(self.not_primary());
        }

        let epoch = self.membership.epoch();
        let applied = self.store.apply(operation, key, delta)?;
        let version = applied.version;
        let transaction_id = applied.entry.transaction_id.clone();

        let targets = self.membership.view().replication_targets(self.local);
        let request = Request::Replicate {
            primary: self.local,
            epoch,
            entry: applied.entry,
        };
        let deadline = self.timing.replication_timeout;
        let sends = targets.iter().map(|target| {
            let request = &request;
            async move {
                let result = transport::call(&target.address, request, deadline)
                    .await
                    .and_then(Response::into_result);
                (target.node_id, target.address.as_str(), result)
            }
        });

        let mut acked = 0;
        let mut ahead: Option<(NodeId, &str, u64)> = None;
        for (node, address, result) in join_all(sends).await {
            match result {
                Ok(_) => acked += 1,
                Err(InventoryError::VersionRegression { replica_version }) => {
                    warn!(node = self.local, peer = node, version, replica_version, "backup holds a longer log");
                    if ahead.map_or(true, |(_, _, best)| replica_version > best) {
                        ahead = Some((node, address, replica_version));
                    }
                }
                Err(InventoryError::StaleEpoch { current }) => {
                    if self.membership.step_down(current) {
                        warn!(node = self.local, peer = node, epoch = current, "newer primary exists, stepping down");
                    }
                }
                Err(err) => {
                    let timeout = InventoryError::ReplicationTimeout { node, version };
                    warn!(node = self.local, peer = node, error = %err, "{timeout}");
                    if let Some(transition) = self.membership.mark_suspected(node) {
                        info!(node = self.local, peer = node, from = ?transition.from, to = ?transition.to, "peer health changed");
                    }
                }
            }
        }

        // A backup ahead of us means this node lost history. The write is not
        // acknowledged and the local store is rebuilt from that backup.
        if let Some((peer, address, replica_version)) = ahead {
            if let Err(err) = self.resync_from(address).await {
                warn!(node = self.local, peer, error = %err, "resync from advanced backup failed");
            }
            return Err(InventoryError::VersionRegression { replica_version });
        }

        debug!(node = self.local, version, acked, targets = targets.len(), "write replicated");
        Ok(WriteOutcome {
            quantity: applied.quantity,
            version,
            transaction_id,
            acked,
            targets: targets.len(),
        })
    }

    /// Applies an entry pushed by `primary`. Returns the local version afterwards.
    pub async fn receive(
        &self,
        primary: NodeId,
        epoch: u64,
        entry: TransactionLogEntry,
    ) -> Result<u64> {
        let _write_path = self.write_path.lock().await;
        self.accept_sender(primary, epoch)?;

        match self.store.apply_entry(&entry) {
            Ok(ReplicaApply::Applied { version }) | Ok(ReplicaApply::Duplicate { version }) => {
                Ok(version)
            }
            Ok(ReplicaApply::Gap { local, received }) => {
                debug!(node = self.local, local, received, "gap in replicated log, catching up");
                let address = self.address_of(primary)?;
                self.sync_from(&address, local).await?;
                match self.store.apply_entry(&entry)? {
                    ReplicaApply::Gap { local, .. } => Err(InventoryError::Diverged { version: local }),
                    _ => Ok(self.store.version()),
                }
            }
            Err(InventoryError::Diverged { version }) => {
                let local = self.store.version();
                if entry.version < local {
                    warn!(node = self.local, primary, received = entry.version, local, "primary is behind this replica, refusing resync");
                    return Err(InventoryError::VersionRegression {
                        replica_version: local,
                    });
                }
                warn!(node = self.local, version, "replica diverged, resynchronizing");
                let address = self.address_of(primary)?;
                self.resync_from(&address).await
            }
            Err(err) => Err(err),
        }
    }

    /// Installs a snapshot pushed by the primary. A snapshot never moves the local
    /// version backwards.
    pub async fn handle_sync_state(
        &self,
        primary: NodeId,
        epoch: u64,
        snapshot: crate::store::Snapshot,
    ) -> Result<u64> {
        let _write_path = self.write_path.lock().await;
        self.accept_sender(primary, epoch)?;
        let target = snapshot.version;
        if self.store.install_snapshot(snapshot, false)? {
            info!(node = self.local, primary, version = target, "installed snapshot from primary");
        }
        Ok(self.store.version())
    }

    /// Primary side of state transfer: pushes the full store to one peer.
    pub async fn push_snapshot(&self, peer: NodeId, address: &str) -> Result<()> {
        let _write_path = self.write_path.lock().await;
        if !self.membership.is_primary() {
            return Err(self.not_primary());
        }
        let request = Request::SyncState {
            primary: self.local,
            epoch: self.membership.epoch(),
            snapshot: self.store.snapshot(),
        };
        let result = transport::call(address, &request, self.timing.sync_timeout)
            .await
            .and_then(Response::into_result);
        match result {
            Ok(response) => {
                debug!(node = self.local, peer, version = ?response.version, "peer synchronized");
                Ok(())
            }
            Err(InventoryError::StaleEpoch { current }) => {
                if self.membership.step_down(current) {
                    warn!(node = self.local, peer, epoch = current, "newer primary exists, stepping down");
                }
                Err(InventoryError::StaleEpoch { current })
            }
            Err(err) => Err(err),
        }
    }

    /// Brings the local store up to `address` by replaying its log, falling back to
    /// a full snapshot when replay cannot be applied. Caller holds the write path.
    pub(crate) async fn sync_from(&self, address: &str, local: u64) -> Result<u64> {
        match self.replay_from(address, local).await {
            Ok(version) => Ok(version),
            Err(err @ InventoryError::ConnectionFailure { .. }) => Err(err),
            Err(err) => {
                warn!(node = self.local, error = %err, "log replay failed, pulling snapshot");
                self.resync_from(address).await
            }
        }
    }

    async fn replay_from(&self, address: &str, after_version: u64) -> Result<u64> {
        let response = transport::call(
            address,
            &Request::CatchUp { after_version },
            self.timing.sync_timeout,
        )
        .await?
        .into_result()?;

        let entries = response.entries.unwrap_or_default();
        let replayed = entries.len();
        for entry in entries {
            if let ReplicaApply::Gap { .. } = self.store.apply_entry(&entry)? {
                return Err(InventoryError::Diverged {
                    version: entry.version,
                });
            }
        }
        let version = self.store.version();
        if replayed > 0 {
            info!(node = self.local, from = after_version, to = version, "caught up from log");
        }
        Ok(version)
    }

    /// Replaces local state with the peer's snapshot unconditionally.
    async fn resync_from(&self, address: &str) -> Result<u64> {
        let response = transport::call(address, &Request::FetchSnapshot, self.timing.sync_timeout)
            .await?
            .into_result()?;
        let snapshot = response
            .snapshot
            .ok_or_else(|| InventoryError::Internal("snapshot response carried no state".into()))?;
        self.store.install_snapshot(snapshot, true)?;
        let version = self.store.version();
        info!(node = self.local, version, "resynchronized from snapshot");
        Ok(version)
    }

    fn accept_sender(&self, primary: NodeId, epoch: u64) -> Result<()> {
        let was_primary = self.membership.is_primary();
        if self.membership.adopt_primary(primary, epoch)? == Adoption::Adopted {
            if was_primary {
                warn!(node = self.local, primary, epoch, "demoted by newer primary");
            } else {
                info!(node = self.local, primary, epoch, "following primary");
            }
        }
        Ok(())
    }

    fn address_of(&self, node: NodeId) -> Result<String> {
        self.membership
            .view()
            .address_of(node)
            .map(str::to_string)
            .ok_or_else(|| InventoryError::Internal(format!("no address known for node {node}")))
    }

    fn not_primary(&self) -> InventoryError {
        InventoryError::NotPrimary {
            primary_hint: self.membership.view().primary_address().map(str::to_string),
        }
    }
}
