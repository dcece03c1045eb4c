use tracing::{debug, info};

use super::{Lifecycle, members_outcome};
use crate::config::{ClusterSettings, Role};
use crate::error::{FleetError, Result};
use crate::provider::InstanceState;
use crate::registry::InstanceRecord;
use crate::scheduler::{FanOut, Policy};
use crate::sh::{SshTarget, Target, shell_quote};
use crate::template::{Vars, uses};

const PROBE_CORES: &str = "grep -c ^processor /proc/cpuinfo";
const PROBE_MEMORY_KB: &str = "awk '/^MemTotal:/ {print $2}' /proc/meminfo";

impl Lifecycle {
    /// The first master in registry order whose provider state is running.
    pub async fn get_first_running_master(&self, cluster: &str) -> Result<InstanceRecord> {
        let records = self.members(cluster).await?;
        for record in records.into_iter().filter(|r| r.role == Role::Master) {
            let state = self.cloud.get_state(&record.id).await?;
            if state == InstanceState::Running {
                return Ok(record);
            }
            debug!(cluster = %cluster, instance = %record.name, state = %state, "Skipping master");
        }
        Err(FleetError::NoRunningMaster(cluster.to_string()))
    }

    pub async fn start(&self, clusters: &[String]) -> Result<()> {
        self.for_each_cluster("start", clusters, Policy::BestEffort, |lifecycle, cluster| {
            async move { lifecycle.start_cluster(&cluster).await }
        })
        .await
    }

    pub async fn submit(&self, clusters: &[String]) -> Result<()> {
        self.for_each_cluster("submit", clusters, Policy::FailFast, |lifecycle, cluster| {
            async move { lifecycle.submit_cluster(&cluster).await.map(|_| ()) }
        })
        .await
    }

    pub async fn execute(&self, clusters: &[String]) -> Result<()> {
        self.for_each_cluster("execute", clusters, Policy::FailFast, |lifecycle, cluster| {
            async move { lifecycle.execute_cluster(&cluster).await.map(|_| ()) }
        })
        .await
    }

    /// Start the master daemon, then every worker pointed at it.
    pub async fn start_cluster(&self, cluster: &ClusterSettings) -> Result<()> {
        let records = self.members(&cluster.name).await?;
        let master = self.get_first_running_master(&cluster.name).await?;
        let rules = &self.settings.configuration;

        let master_target = Target::Remote(self.ssh_target(&master).await?);
        let vars = self.vars(&cluster.name, &master, Some(&master));
        for template in &rules.master.start {
            self.runner.run(&vars.render(template), &master_target).await?;
        }
        info!(cluster = %cluster.name, master = %master.name, "Master started");

        let mut fan_out = FanOut::new("start-workers");
        for record in records.into_iter().filter(|r| r.role == Role::Worker) {
            let lifecycle = self.clone();
            let cluster = cluster.name.clone();
            let master = master.clone();
            fan_out.push(record.name.clone(), async move {
                lifecycle.start_worker(&cluster, &record, &master).await
            });
        }
        let started = members_outcome(&cluster.name, fan_out.run(Policy::BestEffort).await?)?;
        info!(cluster = %cluster.name, workers = started.len(), "Workers started");
        Ok(())
    }

    async fn start_worker(
        &self,
        cluster: &str,
        record: &InstanceRecord,
        master: &InstanceRecord,
    ) -> Result<()> {
        let target = Target::Remote(self.ssh_target(record).await?);
        let templates = &self.settings.configuration.worker.start;
        let mut vars = self.vars(cluster, record, Some(master));
        self.probe_resources(templates, &target, &mut vars).await?;
        for template in templates {
            self.runner.run(&vars.render(template), &target).await?;
        }
        Ok(())
    }

    /// Fill `{cores}` and `{memory_kb}` from the remote host, only when used.
    async fn probe_resources(&self, templates: &[String], target: &Target, vars: &mut Vars) -> Result<()> {
        let probes = [("cores", PROBE_CORES), ("memory_kb", PROBE_MEMORY_KB)];
        for (key, probe) in probes {
            if !templates.iter().any(|t| uses(t, key)) {
                continue;
            }
            let output = self.runner.run(probe, target).await?;
            let value = output
                .first()
                .map(|line| line.trim().to_string())
                .filter(|v| v.parse::<u64>().is_ok())
                .ok_or_else(|| FleetError::CommandFailed {
                    command: probe.to_string(),
                    target: target.to_string(),
                    attempts: 1,
                    exit_code: Some(0),
                })?;
            vars.set(key, value);
        }
        Ok(())
    }

    /// Run the submit command on the first running master and return its output.
    pub async fn submit_cluster(&self, cluster: &ClusterSettings) -> Result<Vec<String>> {
        let submit = self
            .settings
            .configuration
            .job
            .submit
            .as_deref()
            .ok_or_else(|| FleetError::Config("no job submit command configured".to_string()))?;
        let master = self.get_first_running_master(&cluster.name).await?;
        let target = Target::Remote(self.ssh_target(&master).await?);
        let vars = self.vars(&cluster.name, &master, Some(&master));

        info!(cluster = %cluster.name, master = %master.name, "Submitting job");
        let output = self.runner.run(&vars.render(submit), &target).await?;
        for line in &output {
            info!(cluster = %cluster.name, "{}", line);
        }
        Ok(output)
    }

    /// Push the job artifacts to every member, then submit.
    pub async fn execute_cluster(&self, cluster: &ClusterSettings) -> Result<Vec<String>> {
        let records = self.members(&cluster.name).await?;
        let job = &self.settings.configuration.job;

        if !job.artifacts.is_empty() {
            let mut fan_out = FanOut::new("push-artifacts");
            for record in records {
                let lifecycle = self.clone();
                fan_out.push(record.name.clone(), async move {
                    let ssh = lifecycle.ssh_target(&record).await?;
                    lifecycle.push_artifacts(&ssh).await
                });
            }
            fan_out.run(Policy::FailFast).await?;
            info!(cluster = %cluster.name, artifacts = job.artifacts.len(), "Artifacts pushed");
        }

        self.submit_cluster(cluster).await
    }

    async fn push_artifacts(&self, ssh: &SshTarget) -> Result<()> {
        let job = &self.settings.configuration.job;
        let target = Target::Remote(ssh.clone());
        self.runner
            .run(&format!("mkdir -p {}", shell_quote(&job.remote_folder)), &target)
            .await?;
        self.runner.push(&job.artifacts, ssh, &job.remote_folder).await
    }
}
