use std::collections::HashSet;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{Lifecycle, first_master, members_outcome};
use crate::config::ClusterSettings;
use crate::error::{FleetError, Result};
use crate::registry::InstanceRecord;
use crate::scheduler::{FanOut, Policy};
use crate::sh::{Target, shell_quote};

impl Lifecycle {
    pub async fn configure(&self, clusters: &[String]) -> Result<()> {
        self.for_each_cluster("configure", clusters, Policy::BestEffort, |lifecycle, cluster| {
            async move { lifecycle.configure_cluster(&cluster).await }
        })
        .await
    }

    pub async fn configure_cluster(&self, cluster: &ClusterSettings) -> Result<()> {
        let records = self.members(&cluster.name).await?;
        let master = first_master(&records).cloned();

        let mut fan_out = FanOut::new("configure");
        for record in records {
            let lifecycle = self.clone();
            let cluster = cluster.name.clone();
            let master = master.clone();
            fan_out.push(record.name.clone(), async move {
                lifecycle.configure_member(&cluster, &record, master.as_ref()).await
            });
        }
        members_outcome(&cluster.name, fan_out.run(Policy::BestEffort).await?)?;
        info!(cluster = %cluster.name, "Cluster configured");
        Ok(())
    }

    async fn configure_member(
        &self,
        cluster: &str,
        record: &InstanceRecord,
        master: Option<&InstanceRecord>,
    ) -> Result<()> {
        let ssh = self.ssh_target(record).await?;
        let rules = &self.settings.configuration;

        if rules.seed_known_hosts {
            self.seed_known_hosts(record).await?;
        }

        let commands = rules.commands(record.role);
        let target = Target::Remote(ssh.clone());
        if !commands.upload.is_empty() {
            self.runner
                .run(
                    &format!("mkdir -p {}", shell_quote(&rules.remote_script_folder)),
                    &target,
                )
                .await?;
            self.runner
                .push(&commands.upload, &ssh, &rules.remote_script_folder)
                .await?;
        }

        let vars = self.vars(cluster, record, master);
        for template in &commands.setup {
            self.runner.run(&vars.render(template), &target).await?;
        }
        info!(cluster = %cluster, instance = %record.name, role = %record.role, "Instance configured");
        Ok(())
    }

    /// Scan the instance's host keys and append the ones not yet trusted.
    async fn seed_known_hosts(&self, record: &InstanceRecord) -> Result<()> {
        let rules = &self.settings.configuration;
        let scan = format!(
            "ssh-keyscan -p {} -t {} {}",
            record.ssh_port,
            shell_quote(&rules.key_types),
            shell_quote(&record.public_ipv4_address)
        );
        let scanned = self.runner.run(&scan, &Target::Local).await?;

        let path = &rules.known_hosts_file;
        let _guard = self.known_hosts_lock.lock().await;
        let existing = match fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(FleetError::io(format!("Failed to read {}", path.display()), e)),
        };
        let known: HashSet<&str> = existing.lines().collect();
        let fresh: Vec<&String> = scanned
            .iter()
            .filter(|line| !line.starts_with('#') && !known.contains(line.as_str()))
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| FleetError::io(format!("Failed to create {}", parent.display()), e))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| FleetError::io(format!("Failed to open {}", path.display()), e))?;
        let mut block = String::new();
        if !existing.is_empty() && !existing.ends_with('\n') {
            block.push('\n');
        }
        for line in &fresh {
            block.push_str(line);
            block.push('\n');
        }
        file.write_all(block.as_bytes())
            .await
            .map_err(|e| FleetError::io(format!("Failed to write {}", path.display()), e))?;
        debug!(instance = %record.name, keys = fresh.len(), "Seeded known hosts");
        Ok(())
    }
}
