//! Share command implementation.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};

use wisp_core::file::{format_size, format_speed};
use wisp_core::security::PasswordGate;
use wisp_core::session::{ShareEvent, ShareHandle, ShareSession, ShareSnapshot};
use wisp_core::transfer::SenderStats;
use wisp_core::transport::Resolver;

use super::ShareArgs;
use crate::ui::{banner, format_remaining, CodeBox};

/// Run the share command.
pub async fn run(args: ShareArgs) -> Result<()> {
    let global_config = super::load_config();

    let available_from = match args.at {
        Some(secs) => Some(
            DateTime::<Utc>::from_timestamp(secs, 0)
                .with_context(|| format!("Invalid timestamp: {secs}"))?,
        ),
        None => None,
    };

    let mut config = global_config.session_config();
    if args.password {
        config.password = PasswordGate::generated();
    }
    if args.lock {
        config.lock_on_transfer = true;
    }

    let (transport, resolver) =
        super::build_transport(&global_config, args.listen, args.registry.as_deref(), None)?;
    let direct = args.registry.is_none() && global_config.network.registry.is_none();

    let session = ShareSession::start(transport, config).await?;

    for path in &args.paths {
        if let Err(e) = session.add_path(path.clone(), available_from).await {
            let _ = session.shutdown().await;
            return Err(e).with_context(|| format!("Cannot share {}", path.display()));
        }
    }

    let snapshot = session.snapshot().await?;
    if snapshot.files.is_empty() {
        let _ = session.shutdown().await;
        bail!("Nothing to share: no regular files found");
    }

    if !args.quiet {
        banner();
        display_share_info(&snapshot, args.qr);
        if let Some(at) = available_from {
            let wait = at.signed_duration_since(Utc::now()).to_std().unwrap_or_default();
            println!(
                "  Available from {} (in {})",
                at.format("%Y-%m-%d %H:%M:%S UTC"),
                format_remaining(wait)
            );
            println!();
        }
    } else {
        println!("{}", snapshot.code);
    }

    if direct {
        if let Some(addr) = resolver.resolve(&snapshot.endpoint).await? {
            println!("  No registry configured. Receivers connect with:");
            println!("    wisp receive {} --peer {}", snapshot.code, addr);
            println!();
        }
    }

    if !args.quiet {
        println!("  Waiting for receivers... (Ctrl+C to stop)");
        println!();
    }

    let progress_handle =
        (!args.quiet).then(|| tokio::spawn(display_progress(session.sender_stats())));

    let outcome = wait_for_exit(
        &session,
        session.subscribe(),
        args.quiet,
        direct.then_some(&resolver),
    )
    .await;

    let _ = session.shutdown().await;
    if let Some(handle) = progress_handle {
        handle.abort();
    }

    if !args.quiet {
        println!();
        println!("  Sharing stopped.");
        println!();
    }

    outcome
}

fn display_share_info(snapshot: &ShareSnapshot, qr: bool) {
    let total: u64 = snapshot.files.iter().map(|f| f.size).sum();
    println!(
        "  Sharing {} files ({})",
        snapshot.files.len(),
        format_size(total)
    );
    println!();
    for file in &snapshot.files {
        println!("    {}  {}", file.name, format_size(file.size));
    }
    println!();

    CodeBox::new(snapshot.code.as_str())
        .with_url(&snapshot.url)
        .with_password(snapshot.password.as_deref())
        .display();
    println!();

    if qr {
        match wisp_core::qr::generate_ascii(&snapshot.url) {
            Ok(rendered) => {
                for line in rendered.lines() {
                    println!("  {line}");
                }
                println!();
            }
            Err(e) => tracing::warn!("QR code unavailable: {e}"),
        }
    }
}

async fn wait_for_exit(
    session: &ShareHandle,
    mut events: broadcast::Receiver<ShareEvent>,
    quiet: bool,
    direct: Option<&Arc<dyn Resolver>>,
) -> Result<()> {
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(ShareEvent::Fatal { error }) => bail!("Sharing failed: {error}"),
                Ok(ShareEvent::IdentityRotated { previous, code, url }) => {
                    println!();
                    println!("  Too many failed attempts on {previous}; new code issued.");
                    println!();
                    CodeBox::new(code.as_str()).with_url(&url).display();
                    println!();
                    if let Some(resolver) = direct {
                        let endpoint = session.snapshot().await?.endpoint;
                        if let Some(addr) = resolver.resolve(&endpoint).await? {
                            println!("    wisp receive {code} --peer {addr}");
                            println!();
                        }
                    }
                }
                Ok(event) if !quiet => print_event(&event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Share events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

fn print_event(event: &ShareEvent) {
    match event {
        ShareEvent::PeerVerified { peer } => {
            println!("\n  Receiver {} connected", peer.short_label());
        }
        ShareEvent::PeerLeft { peer } => {
            println!("\n  Receiver {} left", peer.short_label());
        }
        ShareEvent::AuthFailed { peer } => {
            println!("\n  Wrong password from {}", peer.short_label());
        }
        ShareEvent::Scheduled {
            peer,
            file_id,
            seconds,
        } => {
            println!(
                "\n  {} asked for {} early; available in {}s",
                peer.short_label(),
                file_id,
                seconds
            );
        }
        ShareEvent::TransferFinished { peer, file_id } => {
            println!("\n  Sent {} to {}", file_id, peer.short_label());
        }
        ShareEvent::TransferFailed {
            peer,
            file_id,
            error,
        } => {
            println!(
                "\n  Sending {} to {} stopped: {}",
                file_id,
                peer.short_label(),
                error
            );
        }
        ShareEvent::RoomLocked => println!("\n  Room locked"),
        ShareEvent::RoomUnlocked => println!("\n  Room unlocked"),
        _ => {}
    }
}

async fn display_progress(mut rx: watch::Receiver<SenderStats>) {
    while rx.changed().await.is_ok() {
        let stats = rx.borrow().clone();
        let line = stats
            .peers
            .values()
            .filter(|peer| !peer.done)
            .map(|peer| {
                format!(
                    "{} {} {:>5.1}% {}",
                    peer.label,
                    peer.file_name,
                    peer.progress,
                    format_speed(peer.speed_bps)
                )
            })
            .collect::<Vec<_>>()
            .join(" | ");

        if !line.is_empty() {
            print!("\r  {line}    ");
            let _ = io::stdout().flush();
        }
    }
}
