//! Main Entrypoint for the Voice Dashboard
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and the command line.
//! 2. Building the token client and the media backend.
//! 3. Spawning the call controller with a console audio surface.
//! 4. Reading commands from stdin until `quit` or Ctrl+C, then tearing the call down.

use anyhow::Context;
use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};
use voice_dashboard::{
    config::{Config, MediaBackend},
    console::{Console, ConsoleSurface, Flow, HELP, forward_status},
    media_service,
};
use voice_dashboard_core::{CallSession, token::HttpTokenClient};

#[derive(Parser, Debug)]
#[command(name = "dashboard", version, about = "Place voice calls to a remote agent")]
struct Args {
    /// Use the in-process loopback media backend instead of LiveKit.
    #[arg(long)]
    loopback: bool,

    /// Initial prompt sent with the first call.
    #[arg(long, conflicts_with = "prompt_file")]
    prompt: Option<String>,

    /// Read the initial prompt from a file.
    #[arg(long)]
    prompt_file: Option<PathBuf>,
}

/// Listens for the `Ctrl+C` signal.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Ending call and exiting...");
}

fn initial_prompt(args: &Args) -> anyhow::Result<Option<String>> {
    if let Some(path) = &args.prompt_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read prompt file {}", path.display()))?;
        return Ok(Some(text.trim_end().to_string()));
    }
    Ok(args.prompt.clone())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Load Configuration ---
    let backend = args.loopback.then_some(MediaBackend::Loopback);
    let config = Config::from_env_with(backend).context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    // Logs go to stderr so they do not interleave with the console on stdout.
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!(
        backend = ?config.media_backend,
        token_service = %config.token_service_url,
        ws_host = %config.ws_host,
        room = %config.room_name,
        "Configuration loaded."
    );

    // --- 3. Initialize Services ---
    let tokens = Arc::new(HttpTokenClient::new(config.token_service_url.clone()));
    let media = media_service(&config.media_backend)?;

    let (output_tx, mut output_rx) = mpsc::unbounded_channel::<String>();
    let printer = tokio::spawn(async move {
        while let Some(line) = output_rx.recv().await {
            println!("{line}");
        }
    });

    let surface = Arc::new(ConsoleSurface::new(output_tx.clone()));
    let session = CallSession::spawn(config.session_config(), tokens, media, surface);

    if let Some(prompt) = initial_prompt(&args)? {
        session
            .set_prompt(prompt)
            .await
            .context("Failed to set initial prompt")?;
    }

    let status = tokio::spawn(forward_status(session.subscribe(), output_tx.clone()));
    let console = Console::new(session.clone(), output_tx.clone());
    let _ = output_tx.send(HELP.to_string());

    // --- 4. Run the Console ---
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let signal = shutdown_signal();
    tokio::pin!(signal);
    loop {
        tokio::select! {
            _ = &mut signal => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if console.handle_line(&line).await == Flow::Quit {
                        break;
                    }
                }
                Ok(None) => {
                    info!("Input closed.");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read from stdin");
                    break;
                }
            },
        }
    }

    // --- 5. Teardown ---
    drop(console);
    session.shutdown().await;
    let _ = status.await;
    drop(output_tx);
    let _ = printer.await;

    info!("Dashboard has shut down.");
    Ok(())
}
