#[tokio::main]
async fn main() -> anyhow::Result<()> {
    airwatch_lib::run().await
}
