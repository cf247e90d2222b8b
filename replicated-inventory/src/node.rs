use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::balancer::{Algorithm, LoadBalancer};
use crate::cluster::NodeId;
use crate::config::NodeConfig;
use crate::detector::{self, Membership};
use crate::error::InventoryError;
use crate::failover;
use crate::message::{decode_request, read_frame, write_message, Request, Response};
use crate::metrics::{self, NodeMetrics};
use crate::replication::ReplicationManager;
use crate::store::{InventoryKey, InventoryStore, Operation};
use crate::transport;

/// One cluster member: its store, its view of the cluster and the machinery that
/// keeps both current. Shared by every connection task behind an `Arc`.
pub struct Node {
    config: NodeConfig,
    store: Arc<InventoryStore>,
    membership: Arc<Membership>,
    replication: ReplicationManager,
    balancer: LoadBalancer,
    metrics: Arc<NodeMetrics>,
}

impl Node {
    pub fn new(config: NodeConfig) -> crate::error::Result<Self> {
        config.validate()?;
        let store = Arc::new(if config.seed_catalog {
            InventoryStore::seeded()
        } else {
            InventoryStore::new()
        });
        let membership = Arc::new(Membership::new(
            config.node_id,
            config.address.clone(),
            config.peers.clone(),
            config.initial_primary,
            config.timing.thresholds(),
        ));
        let replication =
            ReplicationManager::new(Arc::clone(&store), Arc::clone(&membership), config.timing);
        let balancer = LoadBalancer::new(config.algorithm);
        Ok(Self {
            config,
            store,
            membership,
            replication,
            balancer,
            metrics: Arc::new(NodeMetrics::new()),
        })
    }

    pub fn id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &InventoryStore {
        &self.store
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn replication(&self) -> &ReplicationManager {
        &self.replication
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    /// Serves one request. Failures become error responses.
    pub async fn handle(&self, request: Request) -> Response {
        let started = Instant::now();
        let kind = request.kind();
        let internal = request.is_internal();

        let mut response = match self.dispatch(request).await {
            Ok(response) => response,
            Err(err) => {
                debug!(node = self.id(), request = kind, error = %err, "request failed");
                Response::from_error(self.id(), &err)
            }
        };

        let elapsed = started.elapsed();
        if !internal {
            self.metrics.record_request(elapsed);
        }
        response.response_time.get_or_insert(elapsed.as_secs_f64());
        response
    }

    async fn dispatch(&self, request: Request) -> crate::error::Result<Response> {
        match request {
            Request::GetStatus { .. } => Ok(self.status()),
            Request::SearchProduct { query, forwarded } => self.search(query, forwarded).await,
            Request::BuyProduct {
                area,
                shop,
                item,
                quantity,
            } => {
                self.write(Operation::Buy, InventoryKey::new(area, shop, item), quantity)
                    .await
            }
            Request::AddStock {
                area,
                shop,
                item,
                quantity,
            } => {
                self.write(Operation::AddStock, InventoryKey::new(area, shop, item), quantity)
                    .await
            }
            Request::ConfigureLoadBalancer { algorithm } => Ok(self.configure(algorithm)),
            Request::GetLoadBalancerStats => Ok(Response {
                load_balancer: Some(self.balancer.stats(&self.membership.view())),
                ..Response::success(self.id())
            }),
            Request::Replicate {
                primary,
                epoch,
                entry,
            } => {
                let version = self.replication.receive(primary, epoch, entry).await?;
                Ok(Response {
                    version: Some(version),
                    ..Response::success(self.id())
                })
            }
            Request::CatchUp { after_version } => Ok(Response {
                version: Some(self.store.version()),
                entries: Some(self.store.entries_after(after_version)),
                ..Response::success(self.id())
            }),
            Request::SyncState {
                primary,
                epoch,
                snapshot,
            } => {
                let version = self
                    .replication
                    .handle_sync_state(primary, epoch, snapshot)
                    .await?;
                Ok(Response {
                    version: Some(version),
                    ..Response::success(self.id())
                })
            }
            Request::FetchSnapshot => {
                let snapshot = self.store.snapshot();
                Ok(Response {
                    version: Some(snapshot.version),
                    snapshot: Some(snapshot),
                    ..Response::success(self.id())
                })
            }
            Request::AnnouncePrimary { node_id, epoch, .. } => {
                failover::handle_announce(self, node_id, epoch).await?;
                Ok(Response {
                    epoch: Some(self.membership.epoch()),
                    version: Some(self.store.version()),
                    ..Response::success(self.id())
                })
            }
        }
    }

    fn status(&self) -> Response {
        let view = self.membership.view();
        let is_primary = view.primary == Some(self.id());
        let metrics = self.metrics.snapshot();
        let version = self.store.version();
        let members = view
            .nodes
            .values()
            .cloned()
            .map(|mut member| {
                if member.node_id == self.id() {
                    member.version = version;
                }
                member
            })
            .collect();
        Response {
            is_primary: Some(is_primary),
            epoch: Some(view.epoch),
            version: Some(version),
            request_count: Some(metrics.request_count),
            average_response_time: Some(metrics.average_response_time),
            cpu_usage: Some(metrics.cpu_usage),
            memory_usage: Some(metrics.memory_usage),
            transaction_count: Some(self.store.transaction_count()),
            primary_id: view.primary,
            primary_address: view.primary_address().map(str::to_string),
            members: Some(members),
            load_balancer: is_primary.then(|| self.balancer.stats(&view)),
            ..Response::success(self.id())
        }
    }

    /// Reads arriving at the primary are balanced across healthy backups. Backups,
    /// and reads the primary already balanced, are served from the local store.
    async fn search(&self, query: String, forwarded: bool) -> crate::error::Result<Response> {
        if query.trim().is_empty() {
            return Err(InventoryError::Validation("query must not be empty".into()));
        }
        if forwarded || !self.membership.is_primary() {
            return Ok(self.search_locally(&query, forwarded));
        }

        let view = self.membership.view();
        let target = self.balancer.select_target(false, &view, Some(&query))?;
        let Some(address) = view.address_of(target).filter(|_| target != self.id()) else {
            return Ok(self.search_locally(&query, false));
        };

        let dispatch = self.balancer.dispatch(target);
        let request = Request::SearchProduct {
            query: query.clone(),
            forwarded: true,
        };
        let result = transport::call(address, &request, self.config.timing.sync_timeout)
            .await
            .and_then(Response::into_result);
        match result {
            Ok(mut response) => {
                dispatch.finish(true);
                response.served_by = Some(target);
                response.processed_by = Some(self.id());
                response.load_balanced = Some(true);
                Ok(response)
            }
            Err(err) => {
                dispatch.finish(false);
                warn!(node = self.id(), target, error = %err, "balanced read failed, serving locally");
                Ok(self.search_locally(&query, false))
            }
        }
    }

    fn search_locally(&self, query: &str, load_balanced: bool) -> Response {
        let (results, version) = self.store.search(query);
        Response {
            version: Some(version),
            served_by: Some(self.id()),
            load_balanced: Some(load_balanced),
            results: Some(results),
            ..Response::success(self.id())
        }
    }

    async fn write(
        &self,
        operation: Operation,
        key: InventoryKey,
        quantity: u64,
    ) -> crate::error::Result<Response> {
        validate_key(&key)?;
        if operation == Operation::Buy && quantity == 0 {
            return Err(InventoryError::Validation(
                "purchase quantity must be positive".into(),
            ));
        }

        if !self.membership.is_primary() {
            return self.forward_write(operation, &key, quantity).await;
        }

        let outcome = self.replication.propose(operation, &key, quantity).await?;
        let mut response = Response {
            version: Some(outcome.version),
            processed_by: Some(self.id()),
            served_by: Some(self.id()),
            transaction_id: Some(outcome.transaction_id),
            replicas_acked: Some(outcome.acked),
            ..Response::success(self.id())
        };
        match operation {
            Operation::Buy => {
                response.remaining_quantity = Some(outcome.quantity);
                response.message = Some(format!("purchased {quantity} {}", key.item));
            }
            Operation::AddStock => {
                response.new_quantity = Some(outcome.quantity);
                response.message = Some(format!("added {quantity} {}", key.item));
            }
        }
        Ok(response)
    }

    async fn forward_write(
        &self,
        operation: Operation,
        key: &InventoryKey,
        quantity: u64,
    ) -> crate::error::Result<Response> {
        let view = self.membership.view();
        let Some(primary_address) = view.primary_address() else {
            return Err(InventoryError::NoPrimaryAvailable);
        };
        if !self.config.forward_writes {
            return Err(InventoryError::NotPrimary {
                primary_hint: Some(primary_address.to_string()),
            });
        }

        let request = match operation {
            Operation::Buy => Request::buy(key, quantity),
            Operation::AddStock => Request::add_stock(key, quantity),
        };
        debug!(node = self.id(), primary = ?view.primary, "forwarding write to primary");
        transport::call(primary_address, &request, self.config.timing.sync_timeout).await
    }

    fn configure(&self, algorithm: Algorithm) -> Response {
        let previous = self.balancer.configure(algorithm);
        if previous != algorithm {
            info!(node = self.id(), %previous, %algorithm, "load balancer reconfigured");
        }
        Response {
            message: Some(format!("load balancing algorithm set to {algorithm}")),
            load_balancer: Some(self.balancer.stats(&self.membership.view())),
            ..Response::success(self.id())
        }
    }
}

fn validate_key(key: &InventoryKey) -> crate::error::Result<()> {
    for (field, value) in [("area", &key.area), ("shop", &key.shop), ("item", &key.item)] {
        if value.trim().is_empty() {
            return Err(InventoryError::Validation(format!(
                "{field} must not be empty"
            )));
        }
    }
    Ok(())
}

/// TCP front end for a [`Node`].
pub struct NodeServer {
    listener: TcpListener,
    node: Arc<Node>,
}

impl NodeServer {
    pub fn new(listener: TcpListener, config: NodeConfig) -> crate::error::Result<Self> {
        Ok(Self {
            listener,
            node: Arc::new(Node::new(config)?),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn node(&self) -> Arc<Node> {
        Arc::clone(&self.node)
    }

    /// Serves requests until `shutdown` resolves, then stops background tasks.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let NodeServer { listener, node } = self;
        tokio::pin!(shutdown);

        if node.membership().is_primary() {
            detector::bootstrap(&node).await;
        }

        let (stop, stopped) = watch::channel(false);
        let detector = tokio::spawn(detector::run(Arc::clone(&node), stopped.clone()));
        let reviewer = node
            .config
            .auto_balance
            .then(|| tokio::spawn(review_balancer(Arc::clone(&node), stopped.clone())));
        let sampler = tokio::spawn(metrics::run_sampler(
            Arc::clone(&node.metrics),
            node.config.timing.metrics_interval,
            stopped,
        ));
        info!(
            node = node.id(),
            addr = %node.config.address,
            primary = node.membership().is_primary(),
            "node serving"
        );

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &node);
                }
            }
        }

        info!(node = node.id(), "node shutting down");
        stop.send_replace(true);
        let _ = detector.await;
        let _ = sampler.await;
        if let Some(reviewer) = reviewer {
            let _ = reviewer.await;
        }
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, node: &Arc<Node>) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, node),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

/// Lets the primary's balancer adapt to uneven backups until `shutdown` flips.
async fn review_balancer(node: Arc<Node>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(node.config.timing.balancer_review_interval);
    loop {
        select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if !node.membership().is_primary() {
                    continue;
                }
                if let Some(algorithm) = node.balancer.review(&node.membership().view()) {
                    info!(node = node.id(), %algorithm, "backups diverged, switched balancing algorithm");
                }
            }
        }
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, node: &Arc<Node>) {
    let node = Arc::clone(node);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, node).await {
            debug!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

async fn handle_connection(stream: TcpStream, node: Arc<Node>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let frame = match read_frame(&mut reader).await {
        Ok(Some(frame)) => frame,
        Ok(None) => return Ok(()),
        Err(err) if err.kind() == io::ErrorKind::InvalidData => {
            let err = InventoryError::Validation(err.to_string());
            write_message(&mut writer, &Response::from_error(node.id(), &err)).await?;
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    let response = match decode_request(&frame) {
        Ok(request) => node.handle(request).await,
        Err(err) => Response::from_error(node.id(), &err),
    };
    write_message(&mut writer, &response).await?;
    Ok(())
}
