//! Failure detection and ownership of the cluster view.
//!
//! Every node runs a periodic probe loop against all configured peers. Each peer
//! has a [`PeerTracker`] state machine:
//!
//! ```text
//! Healthy --K timeouts--> Suspected --M more timeouts--> Dead
//!    ^                        |                            |
//!    +------ one success -----+                            |
//!    +-------------------- rejoin handshake ---------------+
//! ```
//!
//! [`Membership`] owns the trackers together with the primary id and epoch, and
//! republishes an immutable [`ClusterView`] after every change.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cluster::{ClusterView, Health, NodeDescriptor, NodeId, Role};
use crate::error::InventoryError;
use crate::failover;
use crate::message::{Request, Response};
use crate::node::Node;
use crate::transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Consecutive failed probes before a healthy peer is suspected.
    pub suspect_after: u32,
    /// Further failed probes before a suspected peer is declared dead.
    pub dead_after: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            suspect_after: 3,
            dead_after: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Health,
    pub to: Health,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTracker {
    health: Health,
    failures: u32,
}

impl Default for PeerTracker {
    fn default() -> Self {
        Self {
            health: Health::Healthy,
            failures: 0,
        }
    }
}

impl PeerTracker {
    pub fn health(&self) -> Health {
        self.health
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// A successful probe. Dead peers stay dead until [`PeerTracker::rejoin`].
    pub fn record_success(&mut self) -> Option<Transition> {
        match self.health {
            Health::Healthy => {
                self.failures = 0;
                None
            }
            Health::Suspected => {
                self.failures = 0;
                self.move_to(Health::Healthy)
            }
            Health::Dead => None,
        }
    }

    pub fn record_failure(&mut self, thresholds: Thresholds) -> Option<Transition> {
        self.failures = self.failures.saturating_add(1);
        match self.health {
            Health::Healthy if self.failures >= thresholds.suspect_after => {
                self.move_to(Health::Suspected)
            }
            Health::Suspected
                if self.failures >= thresholds.suspect_after + thresholds.dead_after =>
            {
                self.move_to(Health::Dead)
            }
            _ => None,
        }
    }

    /// Immediate suspicion, e.g. after a replication timeout.
    pub fn suspect(&mut self, thresholds: Thresholds) -> Option<Transition> {
        if self.health != Health::Healthy {
            return None;
        }
        self.failures = self.failures.max(thresholds.suspect_after);
        self.move_to(Health::Suspected)
    }

    pub fn rejoin(&mut self) -> Option<Transition> {
        self.failures = 0;
        if self.health == Health::Dead {
            self.move_to(Health::Healthy)
        } else {
            None
        }
    }

    fn move_to(&mut self, to: Health) -> Option<Transition> {
        let from = self.health;
        self.health = to;
        Some(Transition { from, to })
    }
}

/// What a peer reported about itself in a status probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStatus {
    pub is_primary: bool,
    pub epoch: u64,
    pub version: u64,
}

impl PeerStatus {
    pub fn from_response(response: &Response) -> Option<Self> {
        Some(Self {
            is_primary: response.is_primary?,
            epoch: response.epoch?,
            version: response.version?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub transition: Option<Transition>,
    /// The peer answered but is still marked dead; it needs a rejoin handshake.
    pub rejoin_pending: bool,
    pub primary_changed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adoption {
    Adopted,
    Unchanged,
}

struct Peer {
    address: String,
    tracker: PeerTracker,
    version: u64,
    /// Set once the peer has answered at least one probe.
    known: bool,
}

struct MembershipState {
    epoch: u64,
    primary: Option<NodeId>,
    local_version: u64,
    peers: BTreeMap<NodeId, Peer>,
}

impl MembershipState {
    /// Decides whether `candidate` claiming the primary role at `epoch` replaces
    /// our current belief. Higher epochs always win; within one epoch the lower
    /// node id wins.
    fn adopt(&mut self, candidate: NodeId, epoch: u64) -> Result<Adoption, InventoryError> {
        let replaces = match epoch.cmp(&self.epoch) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => {
                return Err(InventoryError::StaleEpoch {
                    current: self.epoch,
                })
            }
            std::cmp::Ordering::Equal => match self.primary {
                None => true,
                Some(current) if current == candidate => false,
                Some(current) if candidate < current => true,
                Some(_) => {
                    return Err(InventoryError::StaleEpoch {
                        current: self.epoch,
                    })
                }
            },
        };
        if !replaces {
            return Ok(Adoption::Unchanged);
        }
        self.epoch = epoch;
        self.primary = Some(candidate);
        Ok(Adoption::Adopted)
    }
}

pub struct Membership {
    local: NodeId,
    local_address: String,
    thresholds: Thresholds,
    state: Mutex<MembershipState>,
    publisher: watch::Sender<Arc<ClusterView>>,
}

impl Membership {
    pub fn new(
        local: NodeId,
        local_address: String,
        peers: BTreeMap<NodeId, String>,
        initial_primary: Option<NodeId>,
        thresholds: Thresholds,
    ) -> Self {
        let peers = peers
            .into_iter()
            .filter(|(id, _)| *id != local)
            .map(|(id, address)| {
                (
                    id,
                    Peer {
                        address,
                        tracker: PeerTracker::default(),
                        version: 0,
                        known: false,
                    },
                )
            })
            .collect();
        let state = MembershipState {
            epoch: 0,
            primary: initial_primary,
            local_version: 0,
            peers,
        };
        let (publisher, _) = watch::channel(Arc::new(ClusterView::default()));
        let membership = Self {
            local,
            local_address,
            thresholds,
            state: Mutex::new(state),
            publisher,
        };
        membership.publish(&membership.state.lock());
        membership
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn view(&self) -> Arc<ClusterView> {
        Arc::clone(&self.publisher.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterView>> {
        self.publisher.subscribe()
    }

    pub fn is_primary(&self) -> bool {
        self.state.lock().primary == Some(self.local)
    }

    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Every configured peer, whatever its health.
    pub fn peers(&self) -> Vec<(NodeId, String)> {
        self.state
            .lock()
            .peers
            .iter()
            .map(|(id, peer)| (*id, peer.address.clone()))
            .collect()
    }

    pub fn health_of(&self, id: NodeId) -> Option<Health> {
        self.state
            .lock()
            .peers
            .get(&id)
            .map(|peer| peer.tracker.health())
    }

    pub fn record_probe_success(&self, id: NodeId, status: PeerStatus) -> ProbeOutcome {
        let mut state = self.state.lock();
        let Some(peer) = state.peers.get_mut(&id) else {
            return ProbeOutcome::default();
        };
        let transition = peer.tracker.record_success();
        let rejoin_pending = peer.tracker.health() == Health::Dead;
        let newly_known = !peer.known;
        let version_changed = peer.version != status.version;
        peer.known = true;
        peer.version = status.version;

        let mut primary_changed = false;
        if status.is_primary && !rejoin_pending {
            primary_changed = matches!(state.adopt(id, status.epoch), Ok(Adoption::Adopted));
        }
        if transition.is_some() || newly_known || version_changed || primary_changed {
            self.publish(&state);
        }
        ProbeOutcome {
            transition,
            rejoin_pending,
            primary_changed,
        }
    }

    /// Records a failed probe. Declaring the primary dead clears the primary slot.
    pub fn record_probe_failure(&self, id: NodeId) -> Option<Transition> {
        let mut state = self.state.lock();
        let thresholds = self.thresholds;
        let transition = state
            .peers
            .get_mut(&id)
            .and_then(|peer| peer.tracker.record_failure(thresholds));
        if let Some(Transition {
            to: Health::Dead, ..
        }) = transition
        {
            if state.primary == Some(id) {
                state.primary = None;
            }
        }
        if transition.is_some() {
            self.publish(&state);
        }
        transition
    }

    pub fn mark_suspected(&self, id: NodeId) -> Option<Transition> {
        let mut state = self.state.lock();
        let thresholds = self.thresholds;
        let transition = state
            .peers
            .get_mut(&id)
            .and_then(|peer| peer.tracker.suspect(thresholds));
        if transition.is_some() {
            self.publish(&state);
        }
        transition
    }

    pub fn rejoin(&self, id: NodeId) -> Option<Transition> {
        let mut state = self.state.lock();
        let transition = state.peers.get_mut(&id).and_then(|peer| {
            peer.known = true;
            peer.tracker.rejoin()
        });
        if transition.is_some() {
            self.publish(&state);
        }
        transition
    }

    /// Accepts `candidate` as primary if its claim supersedes the current one.
    pub fn adopt_primary(&self, candidate: NodeId, epoch: u64) -> Result<Adoption, InventoryError> {
        let mut state = self.state.lock();
        let adoption = state.adopt(candidate, epoch)?;
        if let Some(peer) = state.peers.get_mut(&candidate) {
            peer.known = true;
            peer.tracker.rejoin();
        }
        self.publish(&state);
        Ok(adoption)
    }

    /// Takes the primary role under a fresh epoch and returns it.
    pub fn promote_self(&self) -> u64 {
        let mut state = self.state.lock();
        state.epoch += 1;
        state.primary = Some(self.local);
        self.publish(&state);
        state.epoch
    }

    /// Gives up the primary role after learning of a newer epoch.
    pub fn step_down(&self, newer_epoch: u64) -> bool {
        let mut state = self.state.lock();
        if state.primary != Some(self.local) || newer_epoch <= state.epoch {
            return false;
        }
        state.primary = None;
        state.epoch = newer_epoch;
        self.publish(&state);
        true
    }

    pub fn refresh_local_version(&self, version: u64) {
        let mut state = self.state.lock();
        if state.local_version != version {
            state.local_version = version;
            self.publish(&state);
        }
    }

    fn publish(&self, state: &MembershipState) {
        let role_of = |id: NodeId| {
            if state.primary == Some(id) {
                Role::Primary
            } else {
                Role::Backup
            }
        };
        let mut nodes = BTreeMap::new();
        nodes.insert(
            self.local,
            NodeDescriptor {
                node_id: self.local,
                address: self.local_address.clone(),
                role: role_of(self.local),
                health: Health::Healthy,
                version: state.local_version,
            },
        );
        for (id, peer) in &state.peers {
            let visible =
                peer.known || peer.tracker.health() == Health::Dead || state.primary == Some(*id);
            if !visible {
                continue;
            }
            nodes.insert(
                *id,
                NodeDescriptor {
                    node_id: *id,
                    address: peer.address.clone(),
                    role: role_of(*id),
                    health: peer.tracker.health(),
                    version: peer.version,
                },
            );
        }
        self.publisher.send_replace(Arc::new(ClusterView {
            epoch: state.epoch,
            primary: state.primary,
            nodes,
        }));
    }
}

/// A reachable peer whose log is longer than the local one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AdvancedPeer {
    pub id: NodeId,
    pub address: String,
    pub version: u64,
}

/// Probes every peer once and records the answers. Returns the peer with the
/// longest log when it is ahead of the local store.
pub(crate) async fn survey_peers(node: &Node) -> Option<AdvancedPeer> {
    let membership = node.membership();
    let timeout = node.config().timing.probe_timeout;
    let probes = membership.peers().into_iter().map(|(id, address)| async move {
        let status = transport::call(&address, &Request::peer_status(), timeout)
            .await
            .ok()
            .and_then(|response| PeerStatus::from_response(&response));
        (id, address, status)
    });

    let mut most_advanced: Option<AdvancedPeer> = None;
    for (id, address, status) in join_all(probes).await {
        let Some(status) = status else { continue };
        let outcome = membership.record_probe_success(id, status);
        if outcome.primary_changed {
            info!(
                node = membership.local_id(),
                primary = id,
                epoch = status.epoch,
                "joined existing primary"
            );
        }
        let best = most_advanced
            .as_ref()
            .map_or(node.store().version(), |peer| peer.version);
        if status.version > best {
            most_advanced = Some(AdvancedPeer {
                id,
                address,
                version: status.version,
            });
        }
    }
    most_advanced
}

/// Learns the current primary before serving traffic.
///
/// A node restarted after a failover still carries the configured primary id at
/// epoch 0; one probe round lets it adopt the promoted primary instead of claiming
/// the role again. A restarted primary that is still recognized by its backups
/// first replays the writes it lost from the most advanced of them.
pub(crate) async fn bootstrap(node: &Node) {
    let membership = node.membership();
    let _write_path = node.replication().lock_write_path().await;
    let advanced = survey_peers(node).await;
    if !membership.is_primary() {
        return;
    }
    let Some(peer) = advanced else { return };

    let local = membership.local_id();
    info!(node = local, peer = peer.id, version = peer.version, "catching up before accepting writes");
    if let Err(err) = node
        .replication()
        .sync_from(&peer.address, node.store().version())
        .await
    {
        warn!(node = local, peer = peer.id, error = %err, "startup catch-up failed");
    }
}

/// Periodic probe loop. Runs until `shutdown` flips to `true`.
pub(crate) async fn run(node: Arc<Node>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(node.config().timing.probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                probe_round(&node).await;
                failover::maybe_failover(&node).await;
            }
        }
    }
    debug!(node = node.membership().local_id(), "failure detector stopped");
}

async fn probe_round(node: &Node) {
    let membership = node.membership();
    let local = membership.local_id();
    let timeout = node.config().timing.probe_timeout;
    membership.refresh_local_version(node.store().version());

    let probes = membership.peers().into_iter().map(|(id, address)| async move {
        let result = transport::call(&address, &Request::peer_status(), timeout).await;
        (id, address, result)
    });

    for (id, address, result) in join_all(probes).await {
        let status = result
            .ok()
            .and_then(|response| PeerStatus::from_response(&response));
        let Some(status) = status else {
            if let Some(transition) = membership.record_probe_failure(id) {
                warn!(node = local, peer = id, from = ?transition.from, to = ?transition.to, "peer health changed");
            }
            continue;
        };

        let outcome = membership.record_probe_success(id, status);
        if let Some(transition) = outcome.transition {
            info!(node = local, peer = id, from = ?transition.from, to = ?transition.to, "peer health changed");
        }
        if outcome.primary_changed {
            info!(node = local, primary = id, epoch = status.epoch, "following new primary");
        }

        let is_primary = membership.is_primary();
        if outcome.rejoin_pending {
            rejoin_peer(node, id, &address, is_primary).await;
        } else if is_primary && !status.is_primary && status.version < node.store().version() {
            if let Err(err) = node.replication().push_snapshot(id, &address).await {
                debug!(node = local, peer = id, error = %err, "lagging backup sync failed");
            }
        }
    }
}

/// Rejoin handshake for a peer we had declared dead. The primary first brings the
/// peer's store up to date; backups only need the successful status exchange.
async fn rejoin_peer(node: &Node, id: NodeId, address: &str, is_primary: bool) {
    let membership = node.membership();
    if is_primary {
        if let Err(err) = node.replication().push_snapshot(id, address).await {
            warn!(node = membership.local_id(), peer = id, error = %err, "rejoin sync failed");
            return;
        }
    }
    if membership.rejoin(id).is_some() {
        info!(node = membership.local_id(), peer = id, "peer rejoined");
    }
}
