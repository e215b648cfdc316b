#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pos_offline_core::run().await
}
