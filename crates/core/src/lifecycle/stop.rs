use tracing::info;

use super::{Lifecycle, first_master, members_outcome};
use crate::config::ClusterSettings;
use crate::error::Result;
use crate::scheduler::{FanOut, Policy};
use crate::sh::Target;

impl Lifecycle {
    pub async fn stop(&self, clusters: &[String]) -> Result<()> {
        self.for_each_cluster("stop", clusters, Policy::BestEffort, |lifecycle, cluster| {
            async move { lifecycle.stop_cluster(&cluster).await }
        })
        .await
    }

    /// Run each member's role stop commands. Registry entries are kept.
    pub async fn stop_cluster(&self, cluster: &ClusterSettings) -> Result<()> {
        let records = self.members(&cluster.name).await?;
        let master = first_master(&records).cloned();

        let mut fan_out = FanOut::new("stop");
        for record in records {
            let lifecycle = self.clone();
            let cluster = cluster.name.clone();
            let master = master.clone();
            fan_out.push(record.name.clone(), async move {
                let templates = &lifecycle.settings.configuration.commands(record.role).stop;
                if templates.is_empty() {
                    return Ok(());
                }
                let target = Target::Remote(lifecycle.ssh_target(&record).await?);
                let vars = lifecycle.vars(&cluster, &record, master.as_ref());
                for template in templates {
                    lifecycle.runner.run(&vars.render(template), &target).await?;
                }
                Ok(())
            });
        }
        members_outcome(&cluster.name, fan_out.run(Policy::BestEffort).await?)?;
        info!(cluster = %cluster.name, "Cluster stopped");
        Ok(())
    }
}
