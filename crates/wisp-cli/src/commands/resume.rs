//! Resume command implementation.

use anyhow::Result;

use wisp_core::file::format_size;
use wisp_core::session::ReceiveSession;
use wisp_core::transfer::ResumeStore;
use wisp_core::Error;

use super::ResumeArgs;
use crate::ui::{banner, prompt};

/// Run the resume command.
pub async fn run(args: ResumeArgs) -> Result<()> {
    let global_config = super::load_config();

    let Some(checkpoint) = ResumeStore::new().load().await? else {
        println!("  Nothing to resume.");
        return Ok(());
    };

    banner();
    println!(
        "  Resuming {} ({} of {}) from {}",
        checkpoint.name,
        format_size(checkpoint.committed_bytes),
        format_size(checkpoint.size),
        checkpoint.peer_id.short_label()
    );
    println!("  Target: {}", checkpoint.handle.display());
    println!();

    let direct = args.peer.map(|addr| (checkpoint.peer_id.clone(), addr));
    let (transport, _) =
        super::build_transport(&global_config, None, args.registry.as_deref(), direct)?;
    let session = ReceiveSession::start(transport, global_config.session_config());

    let mut result = session
        .resume(Some(checkpoint.clone()), args.password.clone())
        .await;
    if matches!(result, Err(Error::AuthFailed)) && args.password.is_none() {
        let password = prompt("Password:").await?;
        result = session.resume(Some(checkpoint), Some(password)).await;
    }

    let _ = session.shutdown().await;

    let completed = result?;
    let location = completed
        .path
        .map_or_else(|| completed.name.clone(), |p| p.display().to_string());
    println!("  Finished {}  {}", location, format_size(completed.size));
    println!();
    Ok(())
}
