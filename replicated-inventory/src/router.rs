//! Client library.
//!
//! [`InventoryClient`] hides which node is primary. It caches the primary's
//! address, sends writes there, follows a `not_primary` redirect once, and backs
//! off while a failover leaves the cluster without a primary. Reads go to the
//! primary's load balancer when it is reachable and fall through the remaining
//! nodes otherwise.

use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::sleep;
use tracing::debug;

use crate::balancer::Algorithm;
use crate::config::ClientConfig;
use crate::error::{InventoryError, Result};
use crate::message::{Request, Response};
use crate::store::InventoryKey;
use crate::transport;

pub struct InventoryClient {
    config: ClientConfig,
    primary: Mutex<Option<String>>,
}

impl InventoryClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            primary: Mutex::new(None),
        }
    }

    pub fn cached_primary(&self) -> Option<String> {
        self.primary.lock().clone()
    }

    pub async fn search_product(&self, query: &str) -> Result<Response> {
        self.read(&Request::search(query)).await
    }

    pub async fn buy_product(
        &self,
        area: &str,
        shop: &str,
        item: &str,
        quantity: u64,
    ) -> Result<Response> {
        self.write(&Request::buy(&InventoryKey::new(area, shop, item), quantity))
            .await
    }

    pub async fn add_stock(
        &self,
        area: &str,
        shop: &str,
        item: &str,
        quantity: u64,
    ) -> Result<Response> {
        self.write(&Request::add_stock(&InventoryKey::new(area, shop, item), quantity))
            .await
    }

    /// Status of every reachable node. Refreshes the cached primary as a side effect.
    pub async fn get_server_status(&self) -> Result<Vec<Response>> {
        let mut statuses = Vec::new();
        let mut last_err = None;
        for address in &self.config.nodes {
            match self.send(address, &Request::status()).await {
                Ok(status) => {
                    if status.is_primary == Some(true) {
                        self.remember_primary(address);
                    }
                    statuses.push(status);
                }
                Err(err) => last_err = Some(err),
            }
        }
        match (statuses.is_empty(), last_err) {
            (true, Some(err)) => Err(err),
            _ => Ok(statuses),
        }
    }

    /// Reconfigures the primary's balancer, which is the one routing reads.
    pub async fn configure_load_balancer(&self, algorithm: Algorithm) -> Result<Response> {
        self.write(&Request::ConfigureLoadBalancer { algorithm }).await
    }

    pub async fn get_load_balancer_stats(&self) -> Result<Response> {
        self.write(&Request::GetLoadBalancerStats).await
    }

    /// Sends a request that only the primary may serve.
    async fn write(&self, request: &Request) -> Result<Response> {
        let mut redirected = false;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.primary_address().await {
                Ok(primary) => self.send(&primary, request).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(response) => return Ok(response),
                Err(err) if err.is_redirect() && !redirected => {
                    redirected = true;
                    self.forget_primary();
                    if let InventoryError::NotPrimary {
                        primary_hint: Some(hint),
                    } = &err
                    {
                        self.remember_primary(hint);
                    }
                    debug!(request = request.kind(), error = %err, "redirecting to primary");
                }
                Err(InventoryError::NoPrimaryAvailable) if attempt < self.config.max_attempts => {
                    self.forget_primary();
                    let delay = self.backoff(attempt);
                    debug!(request = request.kind(), attempt, ?delay, "no primary, backing off");
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn read(&self, request: &Request) -> Result<Response> {
        let primary = self.primary_address().await.ok();
        let candidates = primary.iter().chain(
            self.config
                .nodes
                .iter()
                .filter(|address| Some(*address) != primary.as_ref()),
        );

        let mut last_err = InventoryError::NoPrimaryAvailable;
        for address in candidates {
            match self.send(address, request).await {
                Ok(response) => return Ok(response),
                Err(err @ InventoryError::Validation(_)) => return Err(err),
                Err(err) => {
                    if Some(address) == primary.as_ref() {
                        self.forget_primary();
                    }
                    debug!(%address, error = %err, "read failed, trying next node");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    async fn primary_address(&self) -> Result<String> {
        if let Some(primary) = self.cached_primary() {
            return Ok(primary);
        }
        self.discover_primary().await
    }

    /// First node that reports itself as primary.
    async fn discover_primary(&self) -> Result<String> {
        for address in &self.config.nodes {
            let Ok(status) = self.send(address, &Request::status()).await else {
                continue;
            };
            if status.is_primary == Some(true) {
                self.remember_primary(address);
                return Ok(address.clone());
            }
        }
        Err(InventoryError::NoPrimaryAvailable)
    }

    async fn send(&self, address: &str, request: &Request) -> Result<Response> {
        transport::call(address, request, self.config.request_timeout)
            .await?
            .into_result()
    }

    fn remember_primary(&self, address: &str) {
        *self.primary.lock() = Some(address.to_string());
    }

    fn forget_primary(&self) {
        self.primary.lock().take();
    }

    /// Exponential backoff with up to 50% random jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .config
            .backoff_base
            .saturating_mul(1 << exponent)
            .min(self.config.backoff_max);
        let jitter_ms = delay.as_millis() as u64 / 2;
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut config = ClientConfig::new(Vec::new());
        config.backoff_base = Duration::from_millis(100);
        config.backoff_max = Duration::from_millis(400);
        let client = InventoryClient::new(config);

        let first = client.backoff(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        let capped = client.backoff(10);
        assert!(capped >= Duration::from_millis(400) && capped <= Duration::from_millis(600));
    }

    #[tokio::test]
    async fn writes_without_any_node_fail() {
        let mut config = ClientConfig::new(Vec::new());
        config.max_attempts = 2;
        config.backoff_base = Duration::from_millis(1);
        let client = InventoryClient::new(config);
        assert_eq!(
            client.add_stock("a", "s", "i", 1).await.unwrap_err(),
            InventoryError::NoPrimaryAvailable
        );
    }
}
