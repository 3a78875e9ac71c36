//! Wisp CLI - direct peer-to-peer file transfer
//!
//! Usage:
//!   wisp share <files...>     Host files under a share code
//!   wisp receive <code>       Download files from a share code
//!   wisp resume               Continue an interrupted download
//!   wisp registry             Run the peer registry
//!   wisp config               Manage configuration

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
pub mod ui;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match cli.command {
        Command::Share(args) => commands::share::run(args).await,
        Command::Receive(args) => commands::receive::run(args).await,
        Command::Resume(args) => commands::resume::run(args).await,
        Command::Registry(args) => commands::registry::run(args).await,
        Command::Config(args) => commands::config::run(args),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "debug"
    } else {
        "warn,wisp=info,wisp_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
