#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dictactl::run().await
}
