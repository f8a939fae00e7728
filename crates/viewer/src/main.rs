mod capture;
mod cli;
mod config;
mod console;
mod controller;
mod hosts;
mod input;
mod negotiator;
mod recording;
mod renderer;
mod transport;

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use capture::X11DisplayCapture;
use console::ConsoleInput;
use controller::{SessionController, UserCommand};
use hosts::SavedHostStore;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use transport::{RelayHandle, Transport};

/// How long the relay connection gets to flush the disconnect request.
const TRANSPORT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // Logs go to stderr; stdout belongs to the console front-end
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::parse_args()?;
    let config_path = args
        .config_path
        .clone()
        .unwrap_or_else(config::default_config_path);
    let mut config = config::load_config(&config_path)?;
    config::apply_overrides(&mut config, &args);

    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                error!("{}", issue);
            } else {
                warn!("{}", issue);
            }
        }
        if has_errors {
            error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let client_id = config
        .relay
        .client_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!(%client_id, relay = %config.relay.url, "Starting viewer");

    // Subscribe before the transport starts so the first status is not missed
    let (relay, mut outbox_rx) = RelayHandle::new();
    let events = relay.subscribe();
    let event_tx = relay.event_sender();
    let transport: Arc<dyn Transport> = Arc::new(relay);
    let relay_config = config.relay.clone();
    let transport_client_id = client_id.clone();
    let transport_task = tokio::spawn(async move {
        if let Err(e) =
            transport::run_transport(relay_config, transport_client_id, &mut outbox_rx, event_tx).await
        {
            error!("Relay transport failed: {e:#}");
        }
    });

    let saved_hosts_path = config
        .storage
        .saved_hosts_path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(SavedHostStore::default_path);
    let saved = SavedHostStore::load_or_empty(saved_hosts_path);
    let capture = X11DisplayCapture::new(
        &config.recording.display,
        config.recording.framerate,
        config.recording.jpeg_quality,
    );

    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    let (mut controller, decoded_rx) = SessionController::new(
        &config,
        client_id,
        transport,
        Box::new(capture),
        saved,
        ui_tx,
    );

    let printer = tokio::spawn(async move {
        while let Some(event) = ui_rx.recv().await {
            println!("{}", console::format_ui_event(&event));
        }
    });

    // A plain thread: a blocked stdin read must not hold up runtime shutdown
    let (command_tx, command_rx) = mpsc::unbounded_channel::<UserCommand>();
    std::thread::Builder::new()
        .name("console-input".to_string())
        .spawn(move || {
            println!("Type 'help' for commands.");
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                match console::parse_line(&line) {
                    Ok(Some(ConsoleInput::Command(command))) => {
                        if command_tx.send(command).is_err() {
                            break;
                        }
                    }
                    Ok(Some(ConsoleInput::Help)) => println!("{}", console::HELP),
                    Ok(Some(ConsoleInput::Quit)) => break,
                    Ok(None) => {}
                    Err(message) => eprintln!("{message}"),
                }
            }
        })
        .context("Failed to spawn console input thread")?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = controller::run_session_loop(&mut controller, events, command_rx, decoded_rx) => {
            info!("Console closed, shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    }

    controller.shutdown().await;
    // Dropping the controller releases the last transport handle, which lets
    // the transport flush its outbox and close the socket.
    drop(controller);
    if tokio::time::timeout(TRANSPORT_DRAIN_TIMEOUT, transport_task)
        .await
        .is_err()
    {
        warn!("Relay transport did not close in time");
    }
    let _ = printer.await;

    info!("Viewer shutdown complete");
    Ok(())
}
