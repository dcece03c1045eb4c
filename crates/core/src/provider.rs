//! Cloud provider boundary.
//!
//! [`InstanceProvider`] is the thin per-backend primitive (launch one
//! instance, describe one instance, request termination). [`CloudAdapter`]
//! layers the polling semantics every phase relies on: wait until alive,
//! state queries, and terminate-and-confirm, each with a deadline.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::ProviderError;

/// Pricing mode an instance is launched in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarketType {
    OnDemand,
    Spot,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::OnDemand => "on-demand",
            MarketType::Spot => "spot",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "on-demand" => Some(MarketType::OnDemand),
            "spot" => Some(MarketType::Spot),
            _ => None,
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-reported lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    /// The provider no longer has a record of the instance. Treated as terminated.
    Unknown,
}

impl InstanceState {
    /// Whether the instance still holds provider resources.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            InstanceState::Pending | InstanceState::Running | InstanceState::ShuttingDown
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a provider needs to launch one instance.
#[derive(Debug, Clone)]
pub struct InstanceRequest {
    pub name: String,
    pub instance_type: String,
    pub market_type: MarketType,
    pub placement: Option<String>,
    pub key_name: String,
}

#[derive(Debug, Clone)]
pub struct InstanceDescription {
    pub id: String,
    pub state: InstanceState,
    pub public_ip: Option<String>,
}

#[async_trait]
pub trait InstanceProvider: Send + Sync {
    /// Identifier written to the `provider` field of registry records.
    fn name(&self) -> &str;

    /// Launch exactly one instance and return its provider-assigned id.
    async fn create_instance(&self, request: &InstanceRequest) -> Result<String, ProviderError>;

    /// Current state and address. [`ProviderError::NotFound`] once the provider forgot it.
    async fn describe_instance(&self, instance_id: &str)
    -> Result<InstanceDescription, ProviderError>;

    /// Ask the provider to terminate the given instances without waiting.
    async fn request_termination(&self, instance_ids: &[String]) -> Result<(), ProviderError>;
}

/// Polling knobs for [`CloudAdapter`].
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    pub alive_timeout: Duration,
    pub termination_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            alive_timeout: Duration::from_secs(15 * 60),
            termination_timeout: Duration::from_secs(10 * 60),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Clone)]
pub struct CloudAdapter {
    provider: Arc<dyn InstanceProvider>,
    poll: PollSettings,
}

impl CloudAdapter {
    pub fn new(provider: Arc<dyn InstanceProvider>, poll: PollSettings) -> Self {
        Self { provider, poll }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub async fn create_instance(&self, request: &InstanceRequest) -> Result<String, ProviderError> {
        info!(instance = %request.name, instance_type = %request.instance_type, "Launching instance");
        self.provider.create_instance(request).await
    }

    /// Block until the instance is running, has a public address and accepts
    /// connections on `ssh_port`. Returns the public address.
    pub async fn wait_until_alive(
        &self,
        instance_id: &str,
        ssh_port: u16,
    ) -> Result<String, ProviderError> {
        let started = Instant::now();
        let deadline = started + self.poll.alive_timeout;

        let address = loop {
            let description = match self.provider.describe_instance(instance_id).await {
                Ok(description) => description,
                // Freshly launched instances can lag behind in the provider's listing.
                Err(ProviderError::NotFound(_)) => {
                    debug!(instance = %instance_id, "Instance not listed yet");
                    self.pause_until(deadline, instance_id, started).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            match (description.state, description.public_ip) {
                (InstanceState::Running, Some(ip)) => break ip,
                (InstanceState::Terminated | InstanceState::ShuttingDown, _) => {
                    return Err(ProviderError::Api(format!(
                        "instance {} went to {} while waiting for it to start",
                        instance_id, description.state
                    )));
                }
                (state, _) => {
                    debug!(instance = %instance_id, state = %state, "Waiting for instance to run");
                }
            }
            self.pause_until(deadline, instance_id, started).await?;
        };

        loop {
            let connect = timeout(
                self.poll.connect_timeout,
                TcpStream::connect((address.as_str(), ssh_port)),
            )
            .await;
            if let Ok(Ok(_stream)) = connect {
                info!(instance = %instance_id, address = %address, "Instance is alive");
                return Ok(address);
            }
            debug!(instance = %instance_id, address = %address, port = ssh_port, "SSH port not open yet");
            self.pause_until(deadline, instance_id, started).await?;
        }
    }

    /// Request termination of an instance that will not be recorded, without waiting.
    pub async fn abandon(&self, instance_id: &str) {
        warn!(instance = %instance_id, "Abandoning instance that never became alive");
        if let Err(e) = self.provider.request_termination(&[instance_id.to_string()]).await {
            warn!(instance = %instance_id, error = %e, "Failed to terminate abandoned instance");
        }
    }

    pub async fn get_state(&self, instance_id: &str) -> Result<InstanceState, ProviderError> {
        match self.provider.describe_instance(instance_id).await {
            Ok(description) => Ok(description.state),
            Err(ProviderError::NotFound(_)) => Ok(InstanceState::Unknown),
            Err(e) => Err(e),
        }
    }

    /// The subset of `instance_ids` the provider still reports as active.
    pub async fn list_active(&self, instance_ids: &[String]) -> Result<Vec<String>, ProviderError> {
        let mut active = Vec::new();
        for id in instance_ids {
            if self.get_state(id).await?.is_active() {
                active.push(id.clone());
            }
        }
        Ok(active)
    }

    /// Request termination and wait until none of the instances is active.
    pub async fn terminate(&self, instance_ids: &[String]) -> Result<(), ProviderError> {
        if instance_ids.is_empty() {
            return Ok(());
        }

        match self.provider.request_termination(instance_ids).await {
            Ok(()) => {}
            Err(ProviderError::NotFound(id)) => {
                warn!(instance = %id, "Instance already gone before termination");
            }
            Err(e) => return Err(e),
        }

        let started = Instant::now();
        loop {
            let remaining = self.list_active(instance_ids).await?;
            if remaining.is_empty() {
                return Ok(());
            }
            if started.elapsed() >= self.poll.termination_timeout {
                return Err(ProviderError::TerminationTimeout {
                    instance_ids: remaining,
                    waited: started.elapsed(),
                });
            }
            debug!(remaining = remaining.len(), "Waiting for termination");
            sleep(self.poll.interval).await;
        }
    }

    async fn pause_until(
        &self,
        deadline: Instant,
        instance_id: &str,
        started: Instant,
    ) -> Result<(), ProviderError> {
        if Instant::now() >= deadline {
            return Err(ProviderError::Unreachable {
                instance_id: instance_id.to_string(),
                waited: started.elapsed(),
            });
        }
        sleep(self.poll.interval).await;
        Ok(())
    }
}
