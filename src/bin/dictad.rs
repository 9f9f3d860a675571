#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dictaflow_daemon::run().await
}
