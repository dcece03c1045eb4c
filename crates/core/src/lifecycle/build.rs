use std::str::FromStr;

use tracing::{info, warn};

use super::Lifecycle;
use crate::config::{ClusterSettings, RoleGroupSettings};
use crate::error::{FleetError, ProviderError, Result};
use crate::provider::InstanceRequest;
use crate::registry::InstanceRecord;
use crate::scheduler::{FanOut, Policy};

/// What `build` does with a cluster whose registry already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExistingClusterPolicy {
    /// Leave the cluster alone.
    #[default]
    Skip,
    /// Leave the registry alone and report the members' live state.
    Keep,
    /// Terminate the active members, delete the registry and build from scratch.
    Replace,
}

impl FromStr for ExistingClusterPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(ExistingClusterPolicy::Skip),
            "keep" => Ok(ExistingClusterPolicy::Keep),
            "replace" => Ok(ExistingClusterPolicy::Replace),
            other => Err(format!(
                "unknown policy '{other}', expected skip, keep or replace"
            )),
        }
    }
}

impl Lifecycle {
    pub async fn build(&self, clusters: &[String], on_existing: ExistingClusterPolicy) -> Result<()> {
        self.for_each_cluster("build", clusters, Policy::BestEffort, move |lifecycle, cluster| {
            async move { lifecycle.build_cluster(&cluster, on_existing).await.map(|_| ()) }
        })
        .await
    }

    /// Build one cluster and return how many instances were recorded.
    pub async fn build_cluster(
        &self,
        cluster: &ClusterSettings,
        on_existing: ExistingClusterPolicy,
    ) -> Result<usize> {
        if self.registry.exists(&cluster.name) {
            match on_existing {
                ExistingClusterPolicy::Skip => {
                    info!(cluster = %cluster.name, "Cluster already built, skipping");
                    return Ok(0);
                }
                ExistingClusterPolicy::Keep => {
                    for member in self.cluster_status(&cluster.name).await? {
                        info!(
                            cluster = %cluster.name,
                            instance = %member.record.name,
                            state = %member.state,
                            "Keeping existing instance"
                        );
                    }
                    return Ok(0);
                }
                ExistingClusterPolicy::Replace => {
                    info!(cluster = %cluster.name, "Replacing existing cluster");
                    self.terminate_cluster(&cluster.name, true).await?;
                }
            }
        }

        let mut fan_out = FanOut::new("build-cluster");
        for group in &cluster.groups {
            let lifecycle = self.clone();
            let cluster = cluster.name.clone();
            let group = group.clone();
            fan_out.push(group.name.clone(), async move {
                lifecycle.build_group(&cluster, &group).await
            });
        }
        let recorded: usize = fan_out
            .run(Policy::FailFast)
            .await?
            .into_iter()
            .filter_map(|r| r.outcome.ok())
            .sum();
        info!(
            cluster = %cluster.name,
            requested = cluster.requested_instances(),
            recorded,
            "Cluster built"
        );
        Ok(recorded)
    }

    async fn build_group(&self, cluster: &str, group: &RoleGroupSettings) -> Result<usize> {
        let mut fan_out = FanOut::new("build-group");
        for ordinal in 0..group.count {
            let name = group.instance_name(cluster, ordinal);
            let lifecycle = self.clone();
            let cluster = cluster.to_string();
            let group = group.clone();
            fan_out.push(name.clone(), async move {
                lifecycle.launch_member(&cluster, &group, name).await
            });
        }

        let results = fan_out.run(Policy::FailFast).await?;
        let recorded = results
            .iter()
            .filter(|r| matches!(r.outcome, Ok(Some(_))))
            .count();
        if recorded < group.count as usize {
            warn!(
                cluster = %cluster,
                group = %group.name,
                requested = group.count,
                recorded,
                "Role-group is short of instances"
            );
        }
        Ok(recorded)
    }

    /// Create one instance, wait for it and record it. Provider failures are
    /// absorbed as `None`; capacity exhaustion and registry errors are not.
    async fn launch_member(
        &self,
        cluster: &str,
        group: &RoleGroupSettings,
        name: String,
    ) -> Result<Option<usize>> {
        let request = InstanceRequest {
            name: name.clone(),
            instance_type: group.instance_type.clone(),
            market_type: group.market_type,
            placement: group.placement.clone(),
            key_name: group.key_name.clone(),
        };

        let instance_id = match self.cloud.create_instance(&request).await {
            Ok(id) => id,
            Err(ProviderError::QuotaExceeded(message)) => {
                return Err(FleetError::CapacityExceeded {
                    cluster: cluster.to_string(),
                    instance: name,
                    message,
                });
            }
            Err(e) => {
                warn!(cluster = %cluster, instance = %name, error = %e, "Failed to create instance");
                return Ok(None);
            }
        };

        let address = match self.cloud.wait_until_alive(&instance_id, group.ssh_port).await {
            Ok(address) => address,
            Err(e) => {
                warn!(cluster = %cluster, instance = %name, error = %e, "Instance did not become alive");
                self.cloud.abandon(&instance_id).await;
                return Ok(None);
            }
        };

        let record = InstanceRecord {
            provider: self.cloud.provider_name().to_string(),
            name,
            id: instance_id,
            role: group.role,
            instance_type: group.instance_type.clone(),
            market_type: group.market_type,
            key_name: group.key_name.clone(),
            username: group.username.clone(),
            public_ipv4_address: address,
            ssh_port: group.ssh_port,
        };
        let ordinal = self.registry.append(cluster, &record).await?;
        info!(cluster = %cluster, instance = %record.name, id = %record.id, ordinal, "Instance recorded");
        Ok(Some(ordinal))
    }
}
