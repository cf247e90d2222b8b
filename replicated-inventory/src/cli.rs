use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueHint};

use crate::balancer::Algorithm;
use crate::cluster::NodeId;
use crate::config::{parse_peer, ClientConfig, NodeConfig, Timing};
use crate::error::Result;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one inventory node until Ctrl-C.
    Node(NodeArgs),
    /// Send one request to the cluster and print the JSON response.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Numeric node id, unique within the cluster.
    #[arg(long)]
    pub id: NodeId,

    /// Socket address to listen on.
    #[arg(long, default_value = "127.0.0.1:8001")]
    pub listen: SocketAddr,

    /// Address other nodes and clients use to reach this node. Defaults to --listen.
    #[arg(long, value_hint = ValueHint::Hostname)]
    pub advertise: Option<String>,

    /// Comma-separated peer map: id=addr,id=addr,...
    #[arg(long, value_delimiter = ',', value_hint = ValueHint::Other)]
    pub peer: Vec<String>,

    /// Id of the node that starts as primary.
    #[arg(long)]
    pub primary: Option<NodeId>,

    /// Initial load balancing algorithm.
    #[arg(long, default_value_t = Algorithm::RoundRobin)]
    pub algorithm: Algorithm,

    /// Start with an empty store instead of the marketplace catalog.
    #[arg(long)]
    pub no_seed: bool,

    /// Forward writes to the primary instead of rejecting them.
    #[arg(long)]
    pub forward_writes: bool,

    /// Switch from round robin to weighted balancing when backups differ in load.
    #[arg(long)]
    pub auto_balance: bool,

    #[arg(long, default_value_t = 1000)]
    pub probe_interval_ms: u64,

    #[arg(long, default_value_t = 500)]
    pub probe_timeout_ms: u64,

    /// Consecutive failed probes before a peer is suspected.
    #[arg(long, default_value_t = 3)]
    pub suspect_after: u32,

    /// Further failed probes before a suspected peer is declared dead.
    #[arg(long, default_value_t = 2)]
    pub dead_after: u32,

    #[arg(long, default_value_t = 1000)]
    pub replication_timeout_ms: u64,
}

impl NodeArgs {
    pub fn to_config(&self) -> Result<NodeConfig> {
        let peers = self
            .peer
            .iter()
            .map(|raw| parse_peer(raw))
            .collect::<Result<BTreeMap<_, _>>>()?;
        let address = self
            .advertise
            .clone()
            .unwrap_or_else(|| self.listen.to_string());

        let mut config = NodeConfig::new(self.id, address);
        config.peers = peers;
        config.initial_primary = self.primary;
        config.algorithm = self.algorithm;
        config.seed_catalog = !self.no_seed;
        config.forward_writes = self.forward_writes;
        config.auto_balance = self.auto_balance;
        config.timing = Timing {
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            suspect_after: self.suspect_after,
            dead_after: self.dead_after,
            replication_timeout: Duration::from_millis(self.replication_timeout_ms),
            ..Timing::default()
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Comma-separated node addresses.
    #[arg(long, value_delimiter = ',', default_value = "127.0.0.1:8001")]
    pub nodes: Vec<String>,

    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,

    #[command(subcommand)]
    pub action: ClientAction,
}

impl ClientArgs {
    pub fn to_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(self.nodes.clone());
        config.request_timeout = Duration::from_millis(self.timeout_ms);
        config
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum ClientAction {
    /// Status of every reachable node.
    Status,
    /// Find in-stock items whose name contains QUERY.
    Search { query: String },
    Buy(ItemArgs),
    AddStock(ItemArgs),
    /// Switch the primary's load balancing algorithm.
    Configure { algorithm: Algorithm },
    /// Load balancer statistics from the primary.
    Stats,
}

#[derive(Args, Debug, Clone)]
pub struct ItemArgs {
    pub area: String,
    pub shop: String,
    pub item: String,
    pub quantity: u64,
}
