use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{InventoryError, Result};
use crate::message::{read_message, write_message, Request, Response};

/// Sends one request to `addr` and waits for its response.
///
/// The whole exchange (connect, write, read) shares one deadline. Transport
/// failures come back as [`InventoryError::ConnectionFailure`]; an error response
/// from the node is returned as a normal [`Response`].
pub async fn call(addr: &str, request: &Request, deadline: Duration) -> Result<Response> {
    match timeout(deadline, exchange(addr, request)).await {
        Ok(result) => result,
        Err(_) => Err(InventoryError::connection(
            addr,
            format!("no response within {deadline:?}"),
        )),
    }
}

async fn exchange(addr: &str, request: &Request) -> Result<Response> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|err| InventoryError::connection(addr, err))?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    write_message(&mut writer, request)
        .await
        .map_err(|err| InventoryError::connection(addr, err))?;
    read_message::<_, Response>(&mut reader)
        .await
        .map_err(|err| InventoryError::connection(addr, err))?
        .ok_or_else(|| InventoryError::connection(addr, "connection closed before response"))
}
