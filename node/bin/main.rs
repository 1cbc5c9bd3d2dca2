use clap::Parser;

use pulseflow::cli::Cli;
use pulseflow::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    Cli::parse().execute().await?;
    Ok(())
}
