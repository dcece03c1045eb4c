use tracing::{info, warn};

use super::Lifecycle;
use crate::error::{FleetError, Result};
use crate::scheduler::Policy;

impl Lifecycle {
    pub async fn terminate(&self, clusters: &[String], delete_registry: bool) -> Result<()> {
        self.for_each_cluster("terminate", clusters, Policy::BestEffort, move |lifecycle, cluster| {
            async move { lifecycle.terminate_cluster(&cluster.name, delete_registry).await }
        })
        .await
    }

    /// Terminate the still-active members of `cluster`, wait for confirmation
    /// and optionally delete its registry. A cluster without a registry is a no-op.
    /// A registry that lists another provider's instances is kept and the
    /// cluster fails with [`FleetError::ForeignInstances`].
    pub async fn terminate_cluster(&self, cluster: &str, delete_registry: bool) -> Result<()> {
        if !self.registry.exists(cluster) {
            info!(cluster = %cluster, "No registry found, nothing to terminate");
            return Ok(());
        }

        let provider = self.cloud.provider_name();
        let mut ids = Vec::new();
        let mut foreign = 0;
        for record in self.registry.read_all(cluster).await? {
            if record.provider == provider {
                ids.push(record.id);
            } else {
                foreign += 1;
                warn!(
                    cluster = %cluster,
                    instance = %record.name,
                    provider = %record.provider,
                    "Instance belongs to another provider, leaving it alone"
                );
            }
        }

        let active = self.cloud.list_active(&ids).await?;
        if active.is_empty() {
            info!(cluster = %cluster, "No active instances");
        } else {
            info!(cluster = %cluster, instances = active.len(), "Terminating instances");
            self.cloud.terminate(&active).await?;
            info!(cluster = %cluster, "Termination confirmed");
        }

        if delete_registry {
            if foreign > 0 {
                return Err(FleetError::ForeignInstances {
                    cluster: cluster.to_string(),
                    count: foreign,
                });
            }
            self.registry.delete(cluster).await?;
            info!(cluster = %cluster, "Registry deleted");
        }
        Ok(())
    }
}
