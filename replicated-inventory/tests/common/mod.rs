//! Test harness that runs a whole cluster of real nodes on loopback sockets.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use replicated_inventory::cluster::{Health, NodeId};
use replicated_inventory::config::{ClientConfig, NodeConfig, Timing};
use replicated_inventory::node::{Node, NodeServer};
use replicated_inventory::router::InventoryClient;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

struct Member {
    node: Arc<Node>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

pub struct TestCluster {
    peers: BTreeMap<NodeId, String>,
    members: BTreeMap<NodeId, Member>,
    tweak: fn(&mut NodeConfig),
}

impl TestCluster {
    /// Spawns `n` nodes with ids `1..=n`; node 1 starts as primary.
    pub async fn spawn(n: usize) -> Result<Self> {
        Self::spawn_with(n, |_| {}).await
    }

    pub async fn spawn_with(n: usize, tweak: fn(&mut NodeConfig)) -> Result<Self> {
        let mut listeners = BTreeMap::new();
        for id in 1..=n as NodeId {
            listeners.insert(id, TcpListener::bind("127.0.0.1:0").await?);
        }
        let peers = listeners
            .iter()
            .map(|(id, listener)| Ok((*id, listener.local_addr()?.to_string())))
            .collect::<Result<BTreeMap<_, _>>>()?;

        let mut cluster = Self {
            peers,
            members: BTreeMap::new(),
            tweak,
        };
        for (id, listener) in listeners {
            cluster.start(id, listener)?;
        }

        let expected = n - 1;
        cluster
            .wait_for("primary to see every backup", |cluster| {
                cluster
                    .node(1)
                    .membership()
                    .view()
                    .healthy_backups()
                    .count()
                    == expected
            })
            .await?;
        Ok(cluster)
    }

    fn config(&self, id: NodeId) -> NodeConfig {
        let mut config = NodeConfig::new(id, self.peers[&id].clone());
        config.peers = self.peers.clone();
        config.initial_primary = Some(1);
        config.timing = Timing::fast();
        (self.tweak)(&mut config);
        config
    }

    fn start(&mut self, id: NodeId, listener: TcpListener) -> Result<()> {
        let server = NodeServer::new(listener, self.config(id))?;
        let node = server.node();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = server.run_until(shutdown).await;
        });
        self.members.insert(
            id,
            Member {
                node,
                shutdown: Some(shutdown_tx),
                task: Some(task),
            },
        );
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> &Arc<Node> {
        &self.members[&id].node
    }

    pub fn address(&self, id: NodeId) -> &str {
        &self.peers[&id]
    }

    pub fn addresses(&self) -> Vec<String> {
        self.peers.values().cloned().collect()
    }

    pub fn running(&self) -> impl Iterator<Item = (NodeId, &Arc<Node>)> {
        self.members
            .iter()
            .filter(|(_, member)| member.task.is_some())
            .map(|(id, member)| (*id, &member.node))
    }

    pub fn client(&self) -> InventoryClient {
        let mut config = ClientConfig::new(self.addresses());
        config.request_timeout = Duration::from_secs(2);
        config.backoff_base = Duration::from_millis(50);
        config.backoff_max = Duration::from_millis(200);
        config.max_attempts = 20;
        InventoryClient::new(config)
    }

    /// Stops a node and closes its listener.
    pub async fn stop(&mut self, id: NodeId) {
        if let Some(member) = self.members.get_mut(&id) {
            if let Some(shutdown) = member.shutdown.take() {
                let _ = shutdown.send(());
            }
            if let Some(task) = member.task.take() {
                let _ = task.await;
            }
        }
    }

    /// Starts a fresh process for `id` on its original address.
    pub async fn restart(&mut self, id: NodeId) -> Result<()> {
        self.stop(id).await;
        let listener = TcpListener::bind(self.peers[&id].as_str())
            .await
            .context("rebinding node address")?;
        self.start(id, listener)
    }

    /// Polls `condition` until it holds or [`SETTLE_TIMEOUT`] passes.
    pub async fn wait_for<F>(&self, what: &str, condition: F) -> Result<()>
    where
        F: Fn(&TestCluster) -> bool,
    {
        let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
        loop {
            if condition(self) {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("timeout waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn primaries(&self) -> Vec<NodeId> {
        self.running()
            .filter(|(_, node)| node.membership().is_primary())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn health_seen_by(&self, observer: NodeId, peer: NodeId) -> Option<Health> {
        self.node(observer).membership().health_of(peer)
    }

    pub async fn shutdown(mut self) {
        let ids: Vec<_> = self.members.keys().copied().collect();
        for id in ids {
            self.stop(id).await;
        }
    }
}
