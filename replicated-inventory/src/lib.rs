//! Replicated inventory service for a small marketplace.
//!
//! One primary and any number of backups serve a shared table of
//! `(area, shop, item) -> quantity` records over a JSON line protocol. Writes go
//! through the primary, which replicates each versioned mutation to the backups
//! before answering. Reads are spread over healthy backups by a configurable load
//! balancer. When the primary stops answering probes the lowest-numbered healthy
//! backup takes over under a new epoch.
//!
//! - [`store`] holds the quantity table, version counter and transaction log.
//! - [`replication`] propagates mutations and replays missing log ranges.
//! - [`detector`] probes peers, tracks their health and publishes the
//!   [`cluster::ClusterView`]; [`failover`] picks and installs a new primary.
//! - [`balancer`] chooses which node serves a read.
//! - [`node`] wires everything together behind a TCP listener.
//! - [`router`] is the client library; [`cli`] backs the binary.
//! - [`message`] and [`transport`] carry the wire protocol.
//!
//! Integration tests under `tests/` run whole clusters on loopback sockets.

pub mod balancer;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod detector;
pub mod error;
pub mod failover;
pub mod message;
pub mod metrics;
pub mod node;
pub mod replication;
pub mod router;
pub mod store;
pub mod transport;
