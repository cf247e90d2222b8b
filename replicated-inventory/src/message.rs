//! Wire protocol: one JSON object per line, one request and one response per
//! connection. Clients and peers share the same framing.

use std::io;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::balancer::{Algorithm, LoadBalancerStats};
use crate::cluster::{NodeDescriptor, NodeId};
use crate::error::{ErrorCode, InventoryError, Result};
use crate::store::{InventoryKey, InventoryRecord, Snapshot, TransactionLogEntry};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Longest accepted line. Full snapshots are the largest messages.
pub const MAX_FRAME_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    GetStatus {
        /// Set on the failure detector's health checks so they stay out of the
        /// node's request metrics.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        from_peer: bool,
    },
    SearchProduct {
        query: String,
        /// Set when a primary hands the read to a backup, so it is not balanced twice.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        forwarded: bool,
    },
    BuyProduct {
        area: String,
        shop: String,
        item: String,
        quantity: u64,
    },
    AddStock {
        area: String,
        shop: String,
        item: String,
        quantity: u64,
    },
    ConfigureLoadBalancer {
        algorithm: Algorithm,
    },
    GetLoadBalancerStats,

    // Node-to-node messages.
    Replicate {
        primary: NodeId,
        epoch: u64,
        entry: TransactionLogEntry,
    },
    CatchUp {
        after_version: u64,
    },
    SyncState {
        primary: NodeId,
        epoch: u64,
        snapshot: Snapshot,
    },
    FetchSnapshot,
    AnnouncePrimary {
        node_id: NodeId,
        epoch: u64,
        version: u64,
    },
}

impl Request {
    pub fn status() -> Self {
        Request::GetStatus { from_peer: false }
    }

    pub fn peer_status() -> Self {
        Request::GetStatus { from_peer: true }
    }

    pub fn search(query: impl Into<String>) -> Self {
        Request::SearchProduct {
            query: query.into(),
            forwarded: false,
        }
    }

    pub fn buy(key: &InventoryKey, quantity: u64) -> Self {
        Request::BuyProduct {
            area: key.area.clone(),
            shop: key.shop.clone(),
            item: key.item.clone(),
            quantity,
        }
    }

    pub fn add_stock(key: &InventoryKey, quantity: u64) -> Self {
        Request::AddStock {
            area: key.area.clone(),
            shop: key.shop.clone(),
            item: key.item.clone(),
            quantity,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Request::GetStatus { .. } => "get_status",
            Request::SearchProduct { .. } => "search_product",
            Request::BuyProduct { .. } => "buy_product",
            Request::AddStock { .. } => "add_stock",
            Request::ConfigureLoadBalancer { .. } => "configure_load_balancer",
            Request::GetLoadBalancerStats => "get_load_balancer_stats",
            Request::Replicate { .. } => "replicate",
            Request::CatchUp { .. } => "catch_up",
            Request::SyncState { .. } => "sync_state",
            Request::FetchSnapshot => "fetch_snapshot",
            Request::AnnouncePrimary { .. } => "announce_primary",
        }
    }

    /// Node-to-node traffic, as opposed to client requests.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Request::GetStatus { from_peer: true }
                | Request::Replicate { .. }
                | Request::CatchUp { .. }
                | Request::SyncState { .. }
                | Request::FetchSnapshot
                | Request::AnnouncePrimary { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Success,
    Error,
}

/// Flat response shared by every request type. Only fields relevant to the
/// request are present on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_primary: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub served_by: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balanced: Option<bool>,
    /// Seconds spent producing this response on the answering node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_by: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_quantity: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_quantity: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_quantity: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<InventoryRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_response_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<NodeDescriptor>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<LoadBalancerStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas_acked: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<TransactionLogEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
}

impl Response {
    pub fn success(node_id: NodeId) -> Self {
        Self {
            node_id: Some(node_id),
            ..Self::default()
        }
    }

    pub fn from_error(node_id: NodeId, err: &InventoryError) -> Self {
        let mut response = Self {
            status: Status::Error,
            error: Some(err.code()),
            message: Some(err.to_string()),
            node_id: Some(node_id),
            ..Self::default()
        };
        match err {
            InventoryError::InsufficientStock {
                available,
                requested,
            } => {
                response.remaining_quantity = Some(*available);
                response.requested_quantity = Some(*requested);
            }
            InventoryError::ItemNotFound(key) => response.key = Some(key.clone()),
            InventoryError::NotPrimary { primary_hint } => {
                response.primary_address = primary_hint.clone();
            }
            InventoryError::ReplicationTimeout { node, version } => {
                response.processed_by = Some(*node);
                response.version = Some(*version);
            }
            InventoryError::ConnectionFailure { addr, .. } => {
                response.primary_address = Some(addr.clone());
            }
            InventoryError::StaleEpoch { current } => response.epoch = Some(*current),
            InventoryError::Diverged { version } => response.version = Some(*version),
            InventoryError::VersionRegression { replica_version } => {
                response.version = Some(*replica_version);
            }
            InventoryError::Validation(_)
            | InventoryError::NoPrimaryAvailable
            | InventoryError::Internal(_) => {}
        }
        response
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Turns an error response back into the typed error it was built from.
    pub fn into_result(self) -> Result<Response> {
        if self.is_success() {
            return Ok(self);
        }
        let message = self.message.clone().unwrap_or_default();
        let err = match self.error.unwrap_or(ErrorCode::Internal) {
            ErrorCode::Validation => InventoryError::Validation(detail(&message)),
            ErrorCode::InsufficientStock => InventoryError::InsufficientStock {
                available: self.remaining_quantity.unwrap_or_default(),
                requested: self.requested_quantity.unwrap_or_default(),
            },
            ErrorCode::ItemNotFound => InventoryError::ItemNotFound(self.key.unwrap_or(message)),
            ErrorCode::NotPrimary => InventoryError::NotPrimary {
                primary_hint: self.primary_address,
            },
            ErrorCode::NoPrimaryAvailable => InventoryError::NoPrimaryAvailable,
            ErrorCode::ReplicationTimeout => InventoryError::ReplicationTimeout {
                node: self.processed_by.unwrap_or_default(),
                version: self.version.unwrap_or_default(),
            },
            ErrorCode::ConnectionFailure => InventoryError::ConnectionFailure {
                addr: self.primary_address.unwrap_or_default(),
                reason: message,
            },
            ErrorCode::StaleEpoch => InventoryError::StaleEpoch {
                current: self.epoch.unwrap_or_default(),
            },
            ErrorCode::Diverged => InventoryError::Diverged {
                version: self.version.unwrap_or_default(),
            },
            ErrorCode::VersionRegression => InventoryError::VersionRegression {
                replica_version: self.version.unwrap_or_default(),
            },
            ErrorCode::Internal => InventoryError::Internal(detail(&message)),
        };
        Err(err)
    }
}

/// Strips the `prefix: ` that the error's `Display` added on the sending side.
fn detail(message: &str) -> String {
    message
        .split_once(": ")
        .map(|(_, rest)| rest)
        .unwrap_or(message)
        .to_string()
}

/// Reads the next non-empty line. `None` means the peer closed the connection.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    read_bounded_frame(reader, MAX_FRAME_BYTES).await
}

async fn read_bounded_frame<R>(reader: &mut R, limit: u64) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = (&mut *reader).take(limit).read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }
        if bytes as u64 >= limit && !line.ends_with('\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {limit} bytes"),
            ));
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if !trimmed.is_empty() {
            return Ok(Some(trimmed.to_string()));
        }
    }
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    match read_frame(reader).await? {
        Some(frame) => serde_json::from_str(&frame).map(Some).map_err(to_io_error),
        None => Ok(None),
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Parses a request line, reporting malformed input as a validation error the
/// caller can send back.
pub fn decode_request(frame: &str) -> Result<Request> {
    serde_json::from_str(frame).map_err(|err| InventoryError::Validation(err.to_string()))
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
