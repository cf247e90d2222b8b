//! Error taxonomy shared by nodes and the client library.
//!
//! Every [`InventoryError`] has a stable [`ErrorCode`] that travels on the wire, so a
//! client can rebuild the typed error from an error response.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::NodeId;

/// Stable error identifiers carried in the `error` field of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    InsufficientStock,
    ItemNotFound,
    NotPrimary,
    NoPrimaryAvailable,
    ReplicationTimeout,
    ConnectionFailure,
    StaleEpoch,
    Diverged,
    VersionRegression,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InventoryError {
    /// Malformed request: missing field, unknown type, bad value.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("insufficient stock: available {available}, requested {requested}")]
    InsufficientStock { available: u64, requested: u64 },

    #[error("item {0} not found")]
    ItemNotFound(String),

    /// A write reached a node that does not hold the primary role.
    #[error("node is not the primary (primary: {})", primary_hint.as_deref().unwrap_or("unknown"))]
    NotPrimary { primary_hint: Option<String> },

    /// No node currently claims the primary role, typically mid-failover.
    #[error("no primary available")]
    NoPrimaryAvailable,

    #[error("backup {node} did not acknowledge version {version} in time")]
    ReplicationTimeout { node: NodeId, version: u64 },

    #[error("connection to {addr} failed: {reason}")]
    ConnectionFailure { addr: String, reason: String },

    /// A replication or announce message from a superseded primary.
    #[error("superseded by epoch {current}")]
    StaleEpoch { current: u64 },

    /// Local log disagrees with the primary; the node must resynchronize.
    #[error("replica diverged from primary at version {version}")]
    Diverged { version: u64 },

    /// The sender's log is shorter than this replica's, so its writes would
    /// overwrite acknowledged history.
    #[error("sender is behind replica at version {replica_version}")]
    VersionRegression { replica_version: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl InventoryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            InventoryError::Validation(_) => ErrorCode::Validation,
            InventoryError::InsufficientStock { .. } => ErrorCode::InsufficientStock,
            InventoryError::ItemNotFound(_) => ErrorCode::ItemNotFound,
            InventoryError::NotPrimary { .. } => ErrorCode::NotPrimary,
            InventoryError::NoPrimaryAvailable => ErrorCode::NoPrimaryAvailable,
            InventoryError::ReplicationTimeout { .. } => ErrorCode::ReplicationTimeout,
            InventoryError::ConnectionFailure { .. } => ErrorCode::ConnectionFailure,
            InventoryError::StaleEpoch { .. } => ErrorCode::StaleEpoch,
            InventoryError::Diverged { .. } => ErrorCode::Diverged,
            InventoryError::VersionRegression { .. } => ErrorCode::VersionRegression,
            InventoryError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn connection(addr: impl Into<String>, reason: impl ToString) -> Self {
        InventoryError::ConnectionFailure {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors after which the router should rediscover the primary.
    pub fn is_redirect(&self) -> bool {
        matches!(
            self,
            InventoryError::NotPrimary { .. } | InventoryError::ConnectionFailure { .. }
        )
    }
}

pub type Result<T, E = InventoryError> = std::result::Result<T, E>;
