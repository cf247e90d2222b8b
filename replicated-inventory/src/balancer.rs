//! Read routing across healthy backups.
//!
//! The balancer never routes a write anywhere but the primary. Reads go to the
//! healthy backups in the current [`ClusterView`] using the configured
//! [`Algorithm`]; with no healthy backup the primary serves the read itself.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterView, NodeId};
use crate::error::{InventoryError, Result};

/// Samples kept per node for the response-time average.
const RESPONSE_WINDOW: usize = 10;
/// Response time that earns a weight of 1.0.
const REFERENCE_RESPONSE_SECS: f64 = 0.010;
const MIN_WEIGHT: f64 = 0.1;
const MAX_WEIGHT: f64 = 10.0;
const FAILURE_PENALTY: f64 = 0.9;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    Weighted,
    LeastConnections,
    HashBased,
}

impl Algorithm {
    pub const ALL: [Algorithm; 4] = [
        Algorithm::RoundRobin,
        Algorithm::Weighted,
        Algorithm::LeastConnections,
        Algorithm::HashBased,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "round_robin",
            Algorithm::Weighted => "weighted",
            Algorithm::LeastConnections => "least_connections",
            Algorithm::HashBased => "hash_based",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = InventoryError;

    fn from_str(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        Algorithm::ALL
            .into_iter()
            .find(|algorithm| algorithm.as_str() == normalized)
            .ok_or_else(|| InventoryError::Validation(format!("unknown algorithm '{raw}'")))
    }
}

/// A node eligible for a read, with the load figures the strategies look at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub node_id: NodeId,
    pub weight: f64,
    pub active_connections: u32,
}

/// Selection state for one algorithm. Replaced wholesale on reconfiguration.
#[derive(Debug, Clone)]
pub enum Strategy {
    RoundRobin { cursor: usize },
    /// Smooth weighted round robin: every pick adds each weight to its running
    /// score, takes the highest score and subtracts the total from the winner.
    Weighted { scores: HashMap<NodeId, f64> },
    LeastConnections { tie_cursor: usize },
    HashBased { fallback_cursor: usize },
}

impl Strategy {
    pub fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::RoundRobin => Strategy::RoundRobin { cursor: 0 },
            Algorithm::Weighted => Strategy::Weighted {
                scores: HashMap::new(),
            },
            Algorithm::LeastConnections => Strategy::LeastConnections { tie_cursor: 0 },
            Algorithm::HashBased => Strategy::HashBased { fallback_cursor: 0 },
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            Strategy::RoundRobin { .. } => Algorithm::RoundRobin,
            Strategy::Weighted { .. } => Algorithm::Weighted,
            Strategy::LeastConnections { .. } => Algorithm::LeastConnections,
            Strategy::HashBased { .. } => Algorithm::HashBased,
        }
    }

    /// Picks one of `candidates`. `key` is the request key used by hash routing.
    pub fn select(&mut self, candidates: &[Candidate], key: Option<&str>) -> Option<NodeId> {
        if candidates.is_empty() {
            return None;
        }
        match self {
            Strategy::RoundRobin { cursor } => Some(next_in_rotation(cursor, candidates)),
            Strategy::Weighted { scores } => {
                scores.retain(|id, _| candidates.iter().any(|c| c.node_id == *id));
                let total: f64 = candidates.iter().map(|c| c.weight).sum();
                let mut best: Option<(NodeId, f64)> = None;
                for candidate in candidates {
                    let score = scores.entry(candidate.node_id).or_insert(0.0);
                    *score += candidate.weight;
                    if best.map_or(true, |(_, top)| *score > top) {
                        best = Some((candidate.node_id, *score));
                    }
                }
                let (winner, _) = best?;
                if let Some(score) = scores.get_mut(&winner) {
                    *score -= total;
                }
                Some(winner)
            }
            Strategy::LeastConnections { tie_cursor } => {
                let fewest = candidates.iter().map(|c| c.active_connections).min()?;
                let tied: Vec<Candidate> = candidates
                    .iter()
                    .filter(|c| c.active_connections == fewest)
                    .copied()
                    .collect();
                Some(next_in_rotation(tie_cursor, &tied))
            }
            Strategy::HashBased { fallback_cursor } => match key {
                Some(key) => {
                    let mut hasher = DefaultHasher::new();
                    key.hash(&mut hasher);
                    let index = (hasher.finish() % candidates.len() as u64) as usize;
                    Some(candidates[index].node_id)
                }
                None => Some(next_in_rotation(fallback_cursor, candidates)),
            },
        }
    }
}

fn next_in_rotation(cursor: &mut usize, candidates: &[Candidate]) -> NodeId {
    let picked = candidates[*cursor % candidates.len()].node_id;
    *cursor = cursor.wrapping_add(1);
    picked
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeLoad {
    pub weight: f64,
    pub active_connections: u32,
    pub response_times: VecDeque<f64>,
}

impl Default for NodeLoad {
    fn default() -> Self {
        Self {
            weight: 1.0,
            active_connections: 0,
            response_times: VecDeque::with_capacity(RESPONSE_WINDOW),
        }
    }
}

impl NodeLoad {
    fn record(&mut self, elapsed: Duration, success: bool) {
        if self.response_times.len() == RESPONSE_WINDOW {
            self.response_times.pop_front();
        }
        self.response_times.push_back(elapsed.as_secs_f64());

        let average =
            self.response_times.iter().sum::<f64>() / self.response_times.len() as f64;
        let mut weight = if average > 0.0 {
            REFERENCE_RESPONSE_SECS / average
        } else {
            MAX_WEIGHT
        };
        if !success {
            weight *= FAILURE_PENALTY;
        }
        self.weight = weight.clamp(MIN_WEIGHT, MAX_WEIGHT);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerStats {
    pub algorithm: Algorithm,
    /// Nodes currently eligible to serve reads.
    pub active_nodes: usize,
    pub healthy_nodes: usize,
    pub total_nodes: usize,
    pub node_weights: BTreeMap<NodeId, f64>,
    pub node_connections: BTreeMap<NodeId, u32>,
    pub node_response_times: BTreeMap<NodeId, Vec<f64>>,
}

struct BalancerState {
    strategy: Strategy,
    loads: BTreeMap<NodeId, NodeLoad>,
}

pub struct LoadBalancer {
    state: Mutex<BalancerState>,
}

impl LoadBalancer {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            state: Mutex::new(BalancerState {
                strategy: Strategy::new(algorithm),
                loads: BTreeMap::new(),
            }),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.state.lock().strategy.algorithm()
    }

    /// Switches algorithm and returns the previous one. Load history is kept.
    pub fn configure(&self, algorithm: Algorithm) -> Algorithm {
        let mut state = self.state.lock();
        let previous = state.strategy.algorithm();
        state.strategy = Strategy::new(algorithm);
        previous
    }

    pub fn select_target(
        &self,
        for_write: bool,
        view: &ClusterView,
        key: Option<&str>,
    ) -> Result<NodeId> {
        if for_write {
            return view.primary.ok_or(InventoryError::NoPrimaryAvailable);
        }

        let mut state = self.state.lock();
        let BalancerState { strategy, loads } = &mut *state;
        let candidates: Vec<Candidate> = view
            .healthy_backups()
            .map(|node| {
                let load = loads.entry(node.node_id).or_default();
                Candidate {
                    node_id: node.node_id,
                    weight: load.weight,
                    active_connections: load.active_connections,
                }
            })
            .collect();

        match strategy.select(&candidates, key) {
            Some(node_id) => Ok(node_id),
            None => view.primary.ok_or(InventoryError::NoPrimaryAvailable),
        }
    }

    /// Counts a request against `node` until the returned guard is dropped.
    pub fn dispatch(&self, node: NodeId) -> Dispatch<'_> {
        self.state
            .lock()
            .loads
            .entry(node)
            .or_default()
            .active_connections += 1;
        Dispatch {
            balancer: self,
            node,
            started: Instant::now(),
            outcome: None,
        }
    }

    pub fn record_response(&self, node: NodeId, elapsed: Duration, success: bool) {
        self.state
            .lock()
            .loads
            .entry(node)
            .or_default()
            .record(elapsed, success);
    }

    pub fn load_of(&self, node: NodeId) -> NodeLoad {
        self.state
            .lock()
            .loads
            .get(&node)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stats(&self, view: &ClusterView) -> LoadBalancerStats {
        let state = self.state.lock();
        let mut stats = LoadBalancerStats {
            algorithm: state.strategy.algorithm(),
            active_nodes: view.healthy_backups().count(),
            healthy_nodes: view.healthy_count(),
            total_nodes: view.nodes.len(),
            node_weights: BTreeMap::new(),
            node_connections: BTreeMap::new(),
            node_response_times: BTreeMap::new(),
        };
        for id in view.nodes.keys() {
            let load = state.loads.get(id).cloned().unwrap_or_default();
            stats.node_weights.insert(*id, load.weight);
            stats.node_connections.insert(*id, load.active_connections);
            stats
                .node_response_times
                .insert(*id, load.response_times.into_iter().collect());
        }
        stats
    }

    /// Moves a round robin balancer to weighted once more than one backup serves
    /// reads and their response histories have different lengths. Returns the
    /// algorithm switched to, if any.
    pub fn review(&self, view: &ClusterView) -> Option<Algorithm> {
        let mut state = self.state.lock();
        if state.strategy.algorithm() != Algorithm::RoundRobin {
            return None;
        }
        let active: Vec<NodeId> = view.healthy_backups().map(|node| node.node_id).collect();
        if active.len() < 2 {
            return None;
        }
        let history = |id: &NodeId| {
            state
                .loads
                .get(id)
                .map_or(0, |load| load.response_times.len())
        };
        let first = history(&active[0]);
        if active.iter().all(|id| history(id) == first) {
            return None;
        }
        state.strategy = Strategy::new(Algorithm::Weighted);
        Some(Algorithm::Weighted)
    }

    fn complete(&self, node: NodeId, elapsed: Duration, outcome: Option<bool>) {
        let mut state = self.state.lock();
        let load = state.loads.entry(node).or_default();
        load.active_connections = load.active_connections.saturating_sub(1);
        if let Some(success) = outcome {
            load.record(elapsed, success);
        }
    }
}

/// In-flight request against one node. Dropping it releases the connection slot;
/// [`Dispatch::finish`] also feeds the response time back into the node's weight.
pub struct Dispatch<'a> {
    balancer: &'a LoadBalancer,
    node: NodeId,
    started: Instant,
    outcome: Option<bool>,
}

impl Dispatch<'_> {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn finish(mut self, success: bool) {
        self.outcome = Some(success);
    }
}

impl Drop for Dispatch<'_> {
    fn drop(&mut self) {
        self.balancer
            .complete(self.node, self.started.elapsed(), self.outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::{descriptor, view};
    use crate::cluster::{Health, Role};

    fn cluster(backups: &[(NodeId, Health)]) -> ClusterView {
        let mut nodes = vec![descriptor(1, Role::Primary, Health::Healthy)];
        nodes.extend(
            backups
                .iter()
                .map(|(id, health)| descriptor(*id, Role::Backup, *health)),
        );
        view(Some(1), nodes)
    }

    #[test]
    fn algorithm_names_parse() {
        for algorithm in Algorithm::ALL {
            assert_eq!(algorithm.as_str().parse::<Algorithm>().unwrap(), algorithm);
        }
        assert_eq!(
            "Least-Connections".parse::<Algorithm>().unwrap(),
            Algorithm::LeastConnections
        );
        assert!(matches!(
            "random".parse::<Algorithm>(),
            Err(InventoryError::Validation(_))
        ));
    }

    #[test]
    fn round_robin_spreads_reads_evenly() {
        let balancer = LoadBalancer::new(Algorithm::RoundRobin);
        let view = cluster(&[(2, Health::Healthy), (3, Health::Healthy), (4, Health::Healthy)]);
        let reads = 10;
        let mut counts: BTreeMap<NodeId, usize> = BTreeMap::new();
        for _ in 0..reads {
            let target = balancer.select_target(false, &view, None).unwrap();
            *counts.entry(target).or_default() += 1;
        }
        assert_eq!(counts.keys().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        for count in counts.values() {
            assert!(*count == reads / 3 || *count == reads / 3 + 1);
        }
    }

    #[test]
    fn review_switches_to_weighted_when_histories_differ() {
        let balancer = LoadBalancer::new(Algorithm::RoundRobin);
        let view = cluster(&[(2, Health::Healthy), (3, Health::Healthy)]);
        assert_eq!(balancer.review(&view), None);

        balancer.record_response(2, Duration::from_millis(5), true);
        balancer.record_response(3, Duration::from_millis(5), true);
        assert_eq!(balancer.review(&view), None);

        balancer.record_response(2, Duration::from_millis(5), true);
        assert_eq!(balancer.review(&view), Some(Algorithm::Weighted));
        assert_eq!(balancer.algorithm(), Algorithm::Weighted);
        assert_eq!(balancer.review(&view), None);
    }

    #[test]
    fn review_leaves_other_algorithms_and_single_backups_alone() {
        let single = cluster(&[(2, Health::Healthy), (3, Health::Dead)]);
        let balancer = LoadBalancer::new(Algorithm::RoundRobin);
        balancer.record_response(2, Duration::from_millis(5), true);
        assert_eq!(balancer.review(&single), None);

        let view = cluster(&[(2, Health::Healthy), (3, Health::Healthy)]);
        let hashed = LoadBalancer::new(Algorithm::HashBased);
        hashed.record_response(2, Duration::from_millis(5), true);
        assert_eq!(hashed.review(&view), None);
        assert_eq!(hashed.algorithm(), Algorithm::HashBased);
    }

    #[test]
    fn unhealthy_backups_are_skipped_and_primary_is_fallback() {
        let balancer = LoadBalancer::new(Algorithm::RoundRobin);
        let view = cluster(&[(2, Health::Suspected), (3, Health::Dead)]);
        for _ in 0..3 {
            assert_eq!(balancer.select_target(false, &view, None).unwrap(), 1);
        }
    }

    #[test]
    fn writes_go_to_primary_or_fail() {
        let balancer = LoadBalancer::new(Algorithm::HashBased);
        let view = cluster(&[(2, Health::Healthy)]);
        assert_eq!(balancer.select_target(true, &view, Some("apple")).unwrap(), 1);

        let headless = ClusterView {
            primary: None,
            ..view
        };
        assert_eq!(
            balancer.select_target(true, &headless, None),
            Err(InventoryError::NoPrimaryAvailable)
        );
    }

    #[test]
    fn least_connections_prefers_idle_nodes() {
        let balancer = LoadBalancer::new(Algorithm::LeastConnections);
        let view = cluster(&[(2, Health::Healthy), (3, Health::Healthy)]);
        let busy = balancer.dispatch(2);
        assert_eq!(balancer.select_target(false, &view, None).unwrap(), 3);
        assert_eq!(balancer.load_of(2).active_connections, 1);
        drop(busy);
        assert_eq!(balancer.load_of(2).active_connections, 0);

        let picks: Vec<_> = (0..4)
            .map(|_| balancer.select_target(false, &view, None).unwrap())
            .collect();
        assert!(picks.contains(&2) && picks.contains(&3));
    }

    #[test]
    fn hash_routing_is_sticky_per_key() {
        let balancer = LoadBalancer::new(Algorithm::HashBased);
        let view = cluster(&[(2, Health::Healthy), (3, Health::Healthy), (4, Health::Healthy)]);
        let first = balancer.select_target(false, &view, Some("apple")).unwrap();
        for _ in 0..5 {
            assert_eq!(
                balancer.select_target(false, &view, Some("apple")).unwrap(),
                first
            );
        }
    }

    #[test]
    fn slow_nodes_lose_weight_and_share() {
        let balancer = LoadBalancer::new(Algorithm::Weighted);
        let view = cluster(&[(2, Health::Healthy), (3, Health::Healthy)]);
        for _ in 0..RESPONSE_WINDOW {
            balancer.record_response(2, Duration::from_millis(5), true);
            balancer.record_response(3, Duration::from_millis(100), true);
        }
        assert!((balancer.load_of(2).weight - 2.0).abs() < 1e-9);
        assert!((balancer.load_of(3).weight - MIN_WEIGHT).abs() < 1e-9);

        let mut fast_picks = 0;
        for _ in 0..21 {
            if balancer.select_target(false, &view, None).unwrap() == 2 {
                fast_picks += 1;
            }
        }
        assert!((18..21).contains(&fast_picks), "fast node picked {fast_picks} times");
    }

    #[test]
    fn failures_reduce_weight() {
        let balancer = LoadBalancer::new(Algorithm::Weighted);
        balancer.record_response(2, Duration::from_millis(10), true);
        let healthy = balancer.load_of(2).weight;
        balancer.record_response(2, Duration::from_millis(10), false);
        assert!(balancer.load_of(2).weight < healthy);
    }

    #[test]
    fn finished_dispatch_records_response_time() {
        let balancer = LoadBalancer::new(Algorithm::RoundRobin);
        balancer.dispatch(2).finish(true);
        let load = balancer.load_of(2);
        assert_eq!(load.active_connections, 0);
        assert_eq!(load.response_times.len(), 1);
    }

    #[test]
    fn stats_cover_every_member() {
        let balancer = LoadBalancer::new(Algorithm::Weighted);
        let view = cluster(&[(2, Health::Healthy), (3, Health::Dead)]);
        assert_eq!(balancer.configure(Algorithm::LeastConnections), Algorithm::Weighted);
        let stats = balancer.stats(&view);
        assert_eq!(stats.algorithm, Algorithm::LeastConnections);
        assert_eq!(stats.active_nodes, 1);
        assert_eq!(stats.healthy_nodes, 2);
        assert_eq!(stats.total_nodes, 3);
        assert_eq!(stats.node_weights.len(), 3);
    }
}
