mod cli;
mod config;
mod data_loader;
mod history;
mod metrics;
mod neural_net;
mod optimizer;
mod pipeline;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("iris_mlp=info")),
        )
        .init();

    Cli::parse().run()
}
