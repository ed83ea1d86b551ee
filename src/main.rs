//! Native binary entry point for the qseek CLI.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    qseek::cli::run().await
}
