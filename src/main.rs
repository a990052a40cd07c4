//! QuantChat Agent - streaming market-analysis chat assistant
//!
//! Runs the interactive terminal chat by default; see `sessions` and
//! `config` subcommands for housekeeping.

use clap::Parser;
use quantchat_agent::cli::{self, Cli, Command};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Command::Sessions(args)) => cli::sessions::execute(args).await,
        Some(Command::Config(args)) => cli::config::execute(args).await,
        Some(Command::Chat) | None => cli::repl::run().await,
    }
}
