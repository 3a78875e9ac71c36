//! Registry command implementation.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use wisp_core::discovery::server;

use super::RegistryArgs;
use crate::ui::banner;

/// Run the registry server until Ctrl+C.
pub async fn run(args: RegistryArgs) -> Result<()> {
    banner();
    println!("  Registry serving on http://{}", args.bind);
    println!("  Point senders and receivers at it with --registry.");
    println!();

    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.cancel();
        }
    });

    server::serve(args.bind, cancel)
        .await
        .with_context(|| format!("Registry on {} failed", args.bind))
}
