use anyhow::Result;
use clap::Parser;

mod analysis;
mod cli;
mod config;
mod embed;
mod error;
mod generate;
mod search;
mod storage;
mod tracker;
mod types;
mod vector;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    cli.run().await
}
