//! CLI command definitions and handlers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use wisp_core::code::EndpointId;
use wisp_core::config::Config;
use wisp_core::discovery::client::RegistryClient;
use wisp_core::transport::{Resolver, StaticResolver, TcpTransport, Transport};

pub mod config;
pub mod receive;
pub mod registry;
pub mod resume;
pub mod share;

/// Load configuration, falling back to defaults when the file is unusable.
pub fn load_config() -> Config {
    match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Ignoring configuration: {e}");
            Config::default()
        }
    }
}

/// Build the TCP transport.
///
/// With a registry URL endpoints are published and resolved there. Without
/// one, `direct` pre-seeds the only address the receiver will dial.
pub fn build_transport(
    config: &Config,
    listen: Option<SocketAddr>,
    registry: Option<&str>,
    direct: Option<(EndpointId, SocketAddr)>,
) -> Result<(Arc<dyn Transport>, Arc<dyn Resolver>)> {
    let resolver: Arc<dyn Resolver> = match registry.or(config.network.registry.as_deref()) {
        Some(url) => Arc::new(
            RegistryClient::new(url, config.general.device_name.clone())
                .context("Failed to create registry client")?,
        ),
        None => {
            let resolver = StaticResolver::new();
            if let Some((id, addr)) = direct {
                resolver.insert(id, addr);
            }
            Arc::new(resolver)
        }
    };

    let transport = TcpTransport::new(
        listen.unwrap_or(config.network.listen),
        Arc::clone(&resolver),
    )
    .with_refresh(config.network.announce_interval)
    .with_open_timeout(config.network.open_timeout);

    Ok((Arc::new(transport), resolver))
}

/// Wisp - direct peer-to-peer file transfer
#[derive(Parser)]
#[command(name = "wisp")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Detailed logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Host files under a share code
    Share(ShareArgs),

    /// Download files using a share code
    Receive(ReceiveArgs),

    /// Continue an interrupted download
    Resume(ResumeArgs),

    /// Run the peer registry server
    Registry(RegistryArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the share command
#[derive(Parser)]
pub struct ShareArgs {
    /// Files and folders to share
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Require a generated password
    #[arg(short, long)]
    pub password: bool,

    /// Lock the room once the first transfer starts
    #[arg(long)]
    pub lock: bool,

    /// Unix timestamp (seconds) before which files are not served
    #[arg(long)]
    pub at: Option<i64>,

    /// Listen address for channels
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Registry URL for publishing the endpoint
    #[arg(long)]
    pub registry: Option<String>,

    /// Print the share URL as a QR code
    #[arg(long)]
    pub qr: bool,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the receive command
#[derive(Parser)]
pub struct ReceiveArgs {
    /// Share code to connect to
    pub code: String,

    /// Output directory for received files
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Download every file without asking
    #[arg(long)]
    pub all: bool,

    /// Session password
    #[arg(long)]
    pub password: Option<String>,

    /// Registry URL for resolving the code
    #[arg(long)]
    pub registry: Option<String>,

    /// Sender address, when no registry is used
    #[arg(long)]
    pub peer: Option<SocketAddr>,

    /// Connection attempts to repeat while the code is unreachable
    #[arg(long, default_value = "0")]
    pub retries: u32,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the resume command
#[derive(Parser)]
pub struct ResumeArgs {
    /// Registry URL for resolving the sender
    #[arg(long)]
    pub registry: Option<String>,

    /// Sender address, when no registry is used
    #[arg(long)]
    pub peer: Option<SocketAddr>,

    /// Session password
    #[arg(long)]
    pub password: Option<String>,
}

/// Arguments for the registry command
#[derive(Parser)]
pub struct RegistryArgs {
    /// Address to serve on
    #[arg(short, long, default_value = "0.0.0.0:7878")]
    pub bind: SocketAddr,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config subcommand
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand, Clone, Copy)]
pub enum ConfigAction {
    /// Show all configuration
    Show,

    /// Show the configuration file path
    Path,

    /// Reset to defaults
    Reset,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_share() {
        let cli = Cli::try_parse_from([
            "wisp", "share", "a.txt", "dir", "--password", "--at", "1700000000",
        ])
        .expect("parse");
        let Command::Share(args) = cli.command else {
            panic!("expected share");
        };
        assert_eq!(args.paths.len(), 2);
        assert!(args.password);
        assert_eq!(args.at, Some(1_700_000_000));
        assert!(!args.lock);
    }

    #[test]
    fn test_parse_receive() {
        let cli = Cli::try_parse_from([
            "wisp", "-v", "receive", "123456", "--all", "--peer", "10.0.0.2:4000",
        ])
        .expect("parse");
        assert!(cli.verbose);
        let Command::Receive(args) = cli.command else {
            panic!("expected receive");
        };
        assert_eq!(args.code, "123456");
        assert!(args.all);
        assert_eq!(args.retries, 0);
        assert_eq!(args.peer, Some("10.0.0.2:4000".parse().expect("addr")));
    }

    #[test]
    fn test_share_requires_paths() {
        assert!(Cli::try_parse_from(["wisp", "share"]).is_err());
    }

    #[tokio::test]
    async fn test_direct_address_is_resolvable() {
        let config = Config::default();
        let id = EndpointId::from_raw("wisp-transfer-v2-123456");
        let addr: SocketAddr = "10.0.0.2:4000".parse().expect("addr");
        let (_, resolver) =
            build_transport(&config, None, None, Some((id.clone(), addr))).expect("transport");
        assert_eq!(resolver.resolve(&id).await.expect("resolve"), Some(addr));
    }
}
