use super::Session;

pub async fn ssh_leader(session: &Session, cluster: &str, command: &str, tty: bool) -> anyhow::Result<()> {
    session.manager().ssh_leader(cluster, command, tty).await?;
    Ok(())
}
