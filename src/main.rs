//! `aria` - the home-assistant host binary.
//!
//! Usage: `aria [CONFIG]` (default `configuration/main.toml`).
//!
//! Exits 0 after a clean shutdown (SIGINT, SIGTERM, SIGQUIT or an
//! `EmergencyShutdown` signal) and non-zero if the configuration or the plugin
//! directory is unusable.

use std::path::PathBuf;
use std::process::ExitCode;

use aria_host::{Host, HostConfig, Shutdown};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "configuration/main.toml";

fn main() -> ExitCode {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    let config = match HostConfig::from_file(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("aria: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    tracing::info!(config = %path.display(), version = aria_host::VERSION, "starting aria");

    let host = Host::new(config);

    if let Err(e) = spawn_signal_bridge(host.shutdown_token().clone()) {
        tracing::warn!(error = %e, "OS signal handling unavailable");
    }

    if let Err(e) = host.start() {
        tracing::error!(error = %e, fatal = e.is_fatal(), "host start-up failed");
        host.stop();
        return ExitCode::FAILURE;
    }

    host.run();
    host.stop();
    ExitCode::SUCCESS
}

/// Trip `shutdown` on the first termination signal.
fn spawn_signal_bridge(shutdown: Shutdown) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;

    std::thread::Builder::new()
        .name("os-signals".to_string())
        .spawn(move || {
            match runtime.block_on(wait_for_shutdown_signal()) {
                Ok(()) => {
                    tracing::info!("termination signal received");
                    shutdown.request();
                }
                Err(e) => tracing::error!(error = %e, "failed to listen for OS signals"),
            }
        })?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
