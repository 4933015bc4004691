use flotilla_core::machine::parse_preemptable_node_type;
use flotilla_provision::ClusterLifecycleManager;

use super::Session;
use super::cluster::row;

pub async fn add(
    session: &Session,
    cluster: &str,
    node_type: &str,
    count: u32,
    preemptable: bool,
) -> anyhow::Result<()> {
    let (machine_type, bid) = if preemptable {
        let (machine, bid) = parse_preemptable_node_type(node_type)?;
        (machine.name, Some(bid))
    } else {
        (node_type, None)
    };

    let added = session
        .manager()
        .add_nodes(cluster, machine_type, count, preemptable, bid)
        .await?;
    println!("✓ Added {added} of {count} {machine_type} worker(s) to {cluster}");
    if let Some(note) = shortfall(preemptable, added, count) {
        println!("  {note}");
    }
    Ok(())
}

/// Note about spot requests still open after a short launch.
fn shortfall(preemptable: bool, added: u32, count: u32) -> Option<String> {
    (preemptable && added < count).then(|| format!("{} spot request(s) remain open", count - added))
}

pub async fn remove(session: &Session, cluster: &str, instances: &[String]) -> anyhow::Result<()> {
    let removed = session.manager().remove_nodes(cluster, instances).await?;
    println!("✓ Terminated {} worker(s)", removed.len());
    for id in &removed {
        println!("  {id}");
    }
    Ok(())
}

pub async fn workers(session: &Session, cluster: &str, preemptable: bool) -> anyhow::Result<()> {
    let workers = session.manager().workers(cluster, preemptable).await?;
    if workers.is_empty() {
        println!("No {} workers", if preemptable { "preemptable" } else { "on-demand" });
    }
    for worker in &workers {
        println!("{}", row(worker));
    }
    Ok(())
}

pub fn shape(node_type: &str) -> anyhow::Result<()> {
    let shape = ClusterLifecycleManager::node_shape(node_type)?;
    println!("{}", serde_json::to_string_pretty(&shape)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortfall_is_reported_for_spot_only() {
        assert_eq!(shortfall(true, 1, 3).as_deref(), Some("2 spot request(s) remain open"));
        assert_eq!(shortfall(true, 3, 3), None);
        assert_eq!(shortfall(false, 1, 3), None);
    }
}
