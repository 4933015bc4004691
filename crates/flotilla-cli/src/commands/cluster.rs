use std::time::Duration;

use flotilla_core::InstanceRecord;
use flotilla_provision::ReadinessConfig;

use super::Session;

pub async fn launch(
    session: &Session,
    cluster: &str,
    leader_type: &str,
    bid: Option<f64>,
    deadline_secs: Option<u64>,
) -> anyhow::Result<()> {
    let mut readiness = ReadinessConfig::default();
    if let Some(secs) = deadline_secs {
        readiness = readiness.with_deadline(Duration::from_secs(secs));
    }
    let manager = session.manager().with_readiness(readiness);

    match manager.launch_cluster(cluster, leader_type, bid).await {
        Ok(ready) => {
            println!("✓ Cluster {cluster} is up");
            println!("  Leader:  {} ({})", ready.record.id, ready.record.machine_type);
            println!("  Address: {}", ready.address);
            Ok(())
        }
        Err(e) => {
            eprintln!("Launch failed: {e}");
            eprintln!("  Run `flotilla destroy {cluster}` to clean up partial resources.");
            Err(e.into())
        }
    }
}

pub async fn destroy(session: &Session, cluster: &str) -> anyhow::Result<()> {
    let report = session.manager().destroy_cluster(cluster).await?;
    println!("✓ Terminated {} instance(s)", report.terminated.len());
    if !report.cancelled_spot_requests.is_empty() {
        println!("  Cancelled {} spot request(s)", report.cancelled_spot_requests.len());
    }
    if report.is_complete() {
        println!("  Security group and identity deleted");
    } else {
        println!("  Preserved impaired instance(s): {}", report.preserved.join(", "));
        println!("  Security group and identity left in place");
    }
    Ok(())
}

pub async fn describe(session: &Session, cluster: &str, format: &str) -> anyhow::Result<()> {
    let description = session.manager().describe(cluster).await?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&description)?);
        return Ok(());
    }

    println!("Cluster {} ({})", description.cluster, description.cluster.namespace);
    match &description.leader {
        Some(leader) => println!("  leader   {}", row(leader)),
        None => println!("  no instances"),
    }
    for worker in &description.workers {
        println!("  worker   {}", row(worker));
    }
    for request in &description.spot_requests {
        println!("  spot     {} {:?} @ {:.3}", request.id, request.state, request.price);
    }
    match &description.security_group {
        Some(group) => println!("  group    {} ({} rules)", group.group_name, group.ingress.len()),
        None => println!("  group    none"),
    }
    Ok(())
}

pub(super) fn row(record: &InstanceRecord) -> String {
    format!(
        "{} {} {} {}{}",
        record.id,
        record.machine_type,
        record.state,
        record.address().unwrap_or("-"),
        if record.is_preemptable() { " (spot)" } else { "" }
    )
}
