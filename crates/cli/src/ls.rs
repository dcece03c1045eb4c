use std::collections::BTreeMap;

use comfy_table::{Cell, Table};
use sparkfleet_core::{FleetError, Lifecycle, MemberStatus};

pub async fn handle_ls_command(lifecycle: &Lifecycle, clusters: &[String]) -> Result<(), FleetError> {
    for cluster in lifecycle.settings().select_clusters(clusters)? {
        let members = lifecycle.cluster_status(&cluster.name).await?;
        if members.is_empty() {
            println!("Cluster '{}' has not been built.\n", cluster.name);
            continue;
        }

        let mut table = Table::new();
        table.set_header(vec!["Name", "Role", "ID", "IP", "Instance Type", "Market", "State"]);
        for member in &members {
            let record = &member.record;
            table.add_row(vec![
                Cell::new(&record.name),
                Cell::new(record.role),
                Cell::new(&record.id),
                Cell::new(format!("{}:{}", record.public_ipv4_address, record.ssh_port)),
                Cell::new(&record.instance_type),
                Cell::new(record.market_type),
                Cell::new(member.state),
            ]);
        }
        println!(
            "Cluster '{}' ({} of {} requested instances recorded)",
            cluster.name,
            members.len(),
            cluster.requested_instances()
        );
        println!("{}", table);

        let mut summary = Table::new();
        summary.set_header(vec!["Attribute", "Value", "Count"]);
        for (attribute, value, count) in summarize(&members) {
            summary.add_row(vec![Cell::new(attribute), Cell::new(value), Cell::new(count)]);
        }
        println!("{}\n", summary);
    }
    Ok(())
}

/// Member counts per role, instance type, market type and live state.
fn summarize(members: &[MemberStatus]) -> Vec<(&'static str, String, usize)> {
    let mut counts: BTreeMap<(usize, &'static str, String), usize> = BTreeMap::new();
    for member in members {
        let record = &member.record;
        let attributes = [
            ("role", record.role.to_string()),
            ("instance type", record.instance_type.clone()),
            ("market", record.market_type.to_string()),
            ("state", member.state.to_string()),
        ];
        for (order, (attribute, value)) in attributes.into_iter().enumerate() {
            *counts.entry((order, attribute, value)).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .map(|((_, attribute, value), count)| (attribute, value, count))
        .collect()
}
