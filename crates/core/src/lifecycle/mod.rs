//! Cluster lifecycle phases.
//!
//! Every phase fans out over the selected clusters and, inside each cluster,
//! over its registry members. The registry is the only state carried between
//! invocations: `build` creates it, `terminate` removes it, and every other
//! phase reads it to discover membership.

mod build;
mod configure;
mod job;
mod stop;
mod terminate;

pub use build::ExistingClusterPolicy;

use std::future::Future;
use std::sync::Arc;

use tracing::info;

use crate::config::{ClusterSettings, Role, Settings};
use crate::error::{ClusterFailure, FleetError, Result};
use crate::keys::resolve_key_file;
use crate::provider::{CloudAdapter, InstanceState};
use crate::registry::{InstanceRecord, Registry};
use crate::scheduler::{FanOut, Policy, TaskResult, partition};
use crate::sh::{CommandRunner, Executor, SshTarget};
use crate::template::Vars;

/// Live view of one registry member.
#[derive(Debug, Clone)]
pub struct MemberStatus {
    pub record: InstanceRecord,
    pub state: InstanceState,
}

#[derive(Clone)]
pub struct Lifecycle {
    settings: Arc<Settings>,
    registry: Arc<Registry>,
    cloud: CloudAdapter,
    runner: Arc<dyn CommandRunner>,
    known_hosts_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Lifecycle {
    pub fn new(settings: Settings, cloud: CloudAdapter) -> Self {
        let executor = Executor::new(settings.configuration.retry_policy());
        Self::with_runner(settings, cloud, Arc::new(executor))
    }

    /// Like [`Lifecycle::new`], with remote commands going through `runner`.
    pub fn with_runner(settings: Settings, cloud: CloudAdapter, runner: Arc<dyn CommandRunner>) -> Self {
        let registry = Registry::new(settings.general.registry_folder.clone());
        Self {
            settings: Arc::new(settings),
            registry: Arc::new(registry),
            cloud,
            runner,
            known_hosts_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Registry members of `cluster` with their current provider state.
    /// An unbuilt cluster has no members.
    pub async fn cluster_status(&self, cluster: &str) -> Result<Vec<MemberStatus>> {
        let records = self.registry.read_all(cluster).await?;
        let mut members = Vec::with_capacity(records.len());
        for record in records {
            let state = self.cloud.get_state(&record.id).await?;
            members.push(MemberStatus { record, state });
        }
        Ok(members)
    }

    /// Run `op` for every selected cluster. Best-effort phases collect every
    /// cluster's failure into [`FleetError::PhaseFailed`]; fail-fast phases
    /// return the first failure as is.
    async fn for_each_cluster<F, Fut>(
        &self,
        phase: &'static str,
        clusters: &[String],
        policy: Policy,
        op: F,
    ) -> Result<()>
    where
        F: Fn(Lifecycle, ClusterSettings) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let selected = self.settings.select_clusters(clusters)?;
        info!(phase, clusters = selected.len(), "Starting phase");

        let mut fan_out =
            FanOut::new(phase).with_parallelism(self.settings.general.cluster_concurrency);
        for cluster in selected {
            fan_out.push(cluster.name.clone(), op(self.clone(), cluster));
        }

        let (_, failed) = partition(fan_out.run(policy).await?);
        if failed.is_empty() {
            info!(phase, "Phase finished");
            return Ok(());
        }
        Err(FleetError::PhaseFailed {
            phase,
            failures: failed
                .into_iter()
                .map(|(cluster, error)| ClusterFailure { cluster, error })
                .collect(),
        })
    }

    /// Registry members of a cluster that must already be built.
    async fn members(&self, cluster: &str) -> Result<Vec<InstanceRecord>> {
        if !self.registry.exists(cluster) {
            return Err(FleetError::ClusterNotBuilt(cluster.to_string()));
        }
        let records = self.registry.read_all(cluster).await?;
        if records.is_empty() {
            return Err(FleetError::ClusterNotBuilt(cluster.to_string()));
        }
        Ok(records)
    }

    async fn ssh_target(&self, record: &InstanceRecord) -> Result<SshTarget> {
        let key_file =
            resolve_key_file(&self.settings.general.key_folder, &record.key_name, &record.name)
                .await?;
        Ok(SshTarget {
            host: record.public_ipv4_address.clone(),
            port: record.ssh_port,
            user: record.username.clone(),
            key_file,
        })
    }

    fn vars(&self, cluster: &str, record: &InstanceRecord, master: Option<&InstanceRecord>) -> Vars {
        let rules = &self.settings.configuration;
        let mut vars = Vars::new()
            .with("cluster", cluster)
            .with("instance_name", record.name.as_str())
            .with("host", record.public_ipv4_address.as_str())
            .with("master_port", rules.master_port.to_string())
            .with("remote_script_folder", rules.remote_script_folder.as_str())
            .with("remote_folder", rules.job.remote_folder.as_str());
        if let Some(master) = master {
            vars.set("master_host", master.public_ipv4_address.as_str());
        }
        vars
    }
}

/// Turn best-effort member results into a cluster outcome.
fn members_outcome<T>(cluster: &str, results: Vec<TaskResult<T>>) -> Result<Vec<T>> {
    let total = results.len();
    let (ok, failed) = partition(results);
    match failed.into_iter().next() {
        None => Ok(ok),
        Some((_, first)) => Err(FleetError::MembersFailed {
            cluster: cluster.to_string(),
            failed: total - ok.len(),
            total,
            source: Box::new(first),
        }),
    }
}

fn first_master(records: &[InstanceRecord]) -> Option<&InstanceRecord> {
    records.iter().find(|r| r.role == Role::Master)
}
