//! Receive command implementation.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{broadcast, watch};

use wisp_core::code::{EndpointId, ShareCode};
use wisp_core::file::{format_size, format_speed, Destination};
use wisp_core::session::{ConnectOutcome, ReceiveEvent, ReceiveHandle, ReceiveSession};
use wisp_core::transfer::{CompletedFile, IncomingFile, TransferProgress};
use wisp_core::Error;

use super::ReceiveArgs;
use crate::ui::{banner, parse_choice, prompt};

/// Pause between attempts on an unreachable code.
const RETRY_PAUSE: Duration = Duration::from_secs(2);

/// Password prompts before giving up.
const PASSWORD_ATTEMPTS: u32 = 3;

/// Run the receive command.
pub async fn run(args: ReceiveArgs) -> Result<()> {
    let global_config = super::load_config();
    let code = ShareCode::parse(&args.code)?;

    let output_dir = args
        .output
        .clone()
        .or_else(|| global_config.general.default_output.clone())
        .or_else(dirs::download_dir)
        .unwrap_or_else(|| PathBuf::from("."));

    let direct = args.peer.map(|addr| (EndpointId::for_code(&code), addr));
    let (transport, _) =
        super::build_transport(&global_config, None, args.registry.as_deref(), direct)?;
    let session = ReceiveSession::start(transport, global_config.session_config());

    if !args.quiet {
        banner();
        println!("  Connecting to {}...", code);
        println!();
    }

    let result = receive(&session, &code, &args, &output_dir).await;
    let _ = session.shutdown().await;
    result
}

async fn receive(
    session: &ReceiveHandle,
    code: &ShareCode,
    args: &ReceiveArgs,
    output_dir: &Path,
) -> Result<()> {
    let files = connect(session, code, args).await?;
    if files.is_empty() {
        bail!("The sender is not offering any files");
    }

    if !args.quiet {
        let total: u64 = files.iter().map(|f| f.size).sum();
        println!(
            "  {} files offered ({}), saving to {}",
            files.len(),
            format_size(total),
            output_dir.display()
        );
        println!();
        for (i, file) in files.iter().enumerate() {
            println!("    {}. {}  {}", i + 1, file.name, format_size(file.size));
        }
        println!();
    }

    let selected: Vec<IncomingFile> = if args.all || files.len() == 1 {
        files
    } else {
        let answer = prompt(&format!("Download which file? [1-{}, a = all]", files.len())).await?;
        if answer.eq_ignore_ascii_case("a") {
            files
        } else {
            let index = parse_choice(&answer, files.len())
                .with_context(|| format!("Invalid choice: {answer}"))?;
            vec![files[index].clone()]
        }
    };

    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("Cannot create {}", output_dir.display()))?;

    let watchers = (!args.quiet).then(|| {
        (
            tokio::spawn(display_progress(session.progress())),
            tokio::spawn(display_events(session.subscribe())),
        )
    });

    let mut done = Vec::with_capacity(selected.len());
    let mut outcome = Ok(());
    for file in &selected {
        let destination = Destination::Disk(output_dir.join(file.relative_path()));
        match session.download(&file.id, destination).await {
            Ok(completed) => done.push(completed),
            Err(e) => {
                outcome = Err(anyhow::Error::new(e)
                    .context(format!("Download of {} failed", file.name)));
                break;
            }
        }
    }

    if let Some((progress, events)) = watchers {
        progress.abort();
        events.abort();
    }

    if !args.quiet {
        print_summary(&done);
    }
    if outcome.is_err() && !done.is_empty() {
        println!("  Run `wisp resume` to continue the interrupted file.");
    }
    outcome
}

/// Connect, answering human checks and password requests on stdin.
async fn connect(
    session: &ReceiveHandle,
    code: &ShareCode,
    args: &ReceiveArgs,
) -> Result<Vec<IncomingFile>> {
    let mut retries_left = args.retries;

    let outcome = loop {
        let attempt = match &args.password {
            Some(password) => session.connect_with_password(code, password).await,
            None => session.connect(code).await,
        };

        match attempt {
            Ok(outcome) => break outcome,
            Err(Error::HumanCheckRequired) => {
                answer_human_check(session).await?;
            }
            Err(Error::PeerUnavailable(_)) if retries_left > 0 => {
                retries_left -= 1;
                if !args.quiet {
                    println!("  Nobody answers on {code}, retrying...");
                }
                tokio::time::sleep(RETRY_PAUSE).await;
            }
            Err(e) => return Err(e.into()),
        }
    };

    match outcome {
        ConnectOutcome::Ready(files) => Ok(files),
        ConnectOutcome::PasswordRequired => {
            for _ in 0..PASSWORD_ATTEMPTS {
                let password = prompt("Password:").await?;
                match session.submit_password(&password).await {
                    Ok(files) => return Ok(files),
                    Err(Error::AuthFailed) => println!("  Wrong password."),
                    Err(e) => return Err(e.into()),
                }
            }
            bail!("Too many wrong passwords")
        }
    }
}

async fn answer_human_check(session: &ReceiveHandle) -> Result<()> {
    println!();
    println!("  Several codes in a row led nowhere. Please confirm you are human.");

    // A wrong answer draws a new question.
    while let Some(question) = session.human_challenge().await? {
        let answer = prompt(&format!("What is {question}?")).await?;
        if session.solve_human_check(&answer).await? {
            break;
        }
        println!("  That is not right, try again.");
    }
    println!();
    Ok(())
}

async fn display_progress(mut rx: watch::Receiver<TransferProgress>) {
    while rx.changed().await.is_ok() {
        let progress = rx.borrow().clone();
        if progress.total_bytes == 0 && !progress.finished {
            continue;
        }

        let eta = progress
            .eta
            .map_or_else(|| "--".to_string(), |d| format!("{}s", d.as_secs()));
        print!(
            "\r  [{:>6.2}%] {} - {} - ETA: {}    ",
            progress.percentage(),
            progress.file_name,
            format_speed(progress.speed_bps),
            eta
        );
        let _ = io::stdout().flush();

        if progress.finished {
            println!();
        }
    }
}

async fn display_events(mut events: broadcast::Receiver<ReceiveEvent>) {
    loop {
        match events.recv().await {
            Ok(ReceiveEvent::Scheduled { seconds }) => {
                println!("  Not available yet; asking again in {seconds}s");
            }
            Ok(ReceiveEvent::DownloadStarted { offset, .. }) if offset > 0 => {
                println!("  Resuming at {}", format_size(offset));
            }
            Ok(ReceiveEvent::Rejected { reason }) => {
                println!("\n  Sender refused: {reason}");
            }
            Ok(ReceiveEvent::Disconnected) => {
                println!("\n  Sender disconnected");
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_summary(done: &[CompletedFile]) {
    if done.is_empty() {
        return;
    }
    println!();
    println!("  Received {} files:", done.len());
    for file in done {
        let location = file
            .path
            .as_ref()
            .map_or_else(|| file.name.clone(), |p| p.display().to_string());
        println!("    {}  {}", location, format_size(file.size));
    }
    println!();
}
