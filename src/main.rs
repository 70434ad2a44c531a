use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    wick_cli::run().await
}
