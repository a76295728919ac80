//! SSH port forwarding through the user-space network service.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use vmctl_core::MacAddress;

use crate::config::DEFAULT_BRIDGE_TIMEOUT;
use crate::unix_client::EndpointClient;
use crate::DriverError;

const LEASES_PATH: &str = "/services/dhcp/leases";
const EXPOSE_PATH: &str = "/services/forwarder/expose";
const UNEXPOSE_PATH: &str = "/services/forwarder/unexpose";

/// Port the guest SSH server listens on.
pub const GUEST_SSH_PORT: u16 = 22;

/// Default bound on waiting for the guest to obtain a DHCP lease.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Default interval between lease polls.
pub const DEFAULT_LEASE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Exposes and hides the guest SSH endpoint on a host port.
///
/// Failures are reported, but the driver treats every call as best-effort.
#[async_trait]
pub trait PortForwarder: Send + Sync {
    /// Resolve the guest address behind `mac` and forward `local_port` to its SSH port.
    ///
    /// # Errors
    /// Returns [`DriverError::Bridge`] if no lease appears or the service refuses.
    async fn forward(&self, mac: MacAddress, local_port: u16) -> Result<(), DriverError>;

    /// Remove the forward on `local_port`.
    ///
    /// # Errors
    /// Returns [`DriverError::Bridge`] if the service is unreachable or refuses.
    async fn unforward(&self, local_port: u16) -> Result<(), DriverError>;
}

#[derive(Serialize)]
struct ExposeRequest {
    local: String,
    remote: String,
}

#[derive(Serialize)]
struct UnexposeRequest {
    local: String,
}

/// Client for a user-space network's endpoint API.
#[derive(Debug, Clone)]
pub struct UsernetClient {
    endpoint: EndpointClient,
    lease_timeout: Duration,
    poll_interval: Duration,
}

impl UsernetClient {
    /// Create a client talking to the endpoint socket at `endpoint`.
    #[must_use]
    pub fn new(endpoint: PathBuf) -> Self {
        Self {
            endpoint: EndpointClient::new(endpoint, DEFAULT_BRIDGE_TIMEOUT),
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            poll_interval: DEFAULT_LEASE_POLL_INTERVAL,
        }
    }

    /// Override how long and how often to poll for the guest's lease.
    #[must_use]
    pub fn with_lease_wait(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.lease_timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    /// Bound each request, from connect to the end of the reply.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.endpoint = self.endpoint.with_request_timeout(timeout);
        self
    }

    /// Current DHCP leases, keyed by IP address.
    ///
    /// # Errors
    /// Returns [`DriverError::Bridge`] on transport or decoding failures.
    pub async fn leases(&self) -> Result<HashMap<String, String>, DriverError> {
        self.endpoint.get_json(LEASES_PATH).await
    }

    async fn resolve_ip(&self, mac: MacAddress) -> Result<String, DriverError> {
        let started = Instant::now();
        loop {
            match self.leases().await {
                Ok(leases) => {
                    let found = leases
                        .into_iter()
                        .find(|(_, m)| m.parse::<MacAddress>().is_ok_and(|m| m == mac));
                    if let Some((ip, _)) = found {
                        return Ok(ip);
                    }
                }
                Err(e) => tracing::debug!(%mac, error = %e, "lease lookup failed, retrying"),
            }
            if started.elapsed() > self.lease_timeout {
                return Err(DriverError::Bridge(format!(
                    "unable to resolve IP for {mac} within {:?}",
                    self.lease_timeout
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

fn local_addr(port: u16) -> String {
    format!("127.0.0.1:{port}")
}

#[async_trait]
impl PortForwarder for UsernetClient {
    async fn forward(&self, mac: MacAddress, local_port: u16) -> Result<(), DriverError> {
        let ip = self.resolve_ip(mac).await?;
        let req = ExposeRequest {
            local: local_addr(local_port),
            remote: format!("{ip}:{GUEST_SSH_PORT}"),
        };
        self.endpoint.post_json(EXPOSE_PATH, &req).await?;
        tracing::info!(%mac, %ip, local_port, "forwarded SSH port");
        Ok(())
    }

    async fn unforward(&self, local_port: u16) -> Result<(), DriverError> {
        let req = UnexposeRequest {
            local: local_addr(local_port),
        };
        self.endpoint.post_json(UNEXPOSE_PATH, &req).await
    }
}
