//! Bridge daemon
//!
//! Wires the subsystems together: discovery feeds the registry, the group
//! manager owns lifecycle and keep-alives, and the control API serves
//! external automation. SIGINT/SIGTERM request an orderly shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use airroom::config::AppConfig;
use airroom::control::ControlServer;
use airroom::discovery::Discovery;
use airroom::group::GroupManager;
use airroom::raop;
use airroom::secrets::SecretStore;
use airroom::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting airroom bridge");

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_string());
    let config = AppConfig::load(&config_path);

    let secrets = Arc::new(SecretStore::load("secrets.json"));
    if !secrets.is_empty() {
        tracing::info!("Loaded {} device secrets", secrets.len());
    }

    let state = AppState::new();
    state.seed_static(&config.speakers);

    // Termination signals flip a flag; the main loop turns that into an
    // orderly shutdown.
    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, term.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, term.clone())?;

    // Discovery drives the registry. Failure to even create the mDNS
    // daemon means the platform is unusable.
    let mut discovery = Discovery::new();
    let merge_state = state.clone();
    if let Err(e) = discovery.start(Arc::new(move |snapshot| {
        merge_state.apply_snapshot(snapshot);
    })) {
        eprintln!("Platform init failure: {e}");
        std::process::exit(1);
    }

    let manager = Arc::new(GroupManager::new(state.clone(), raop::default_factory()));
    manager.start_heartbeat();

    let control = ControlServer::new(state.clone(), manager.clone());
    let api_port = config.api_port;
    let server = tokio::spawn(async move {
        if let Err(e) = control.serve(api_port).await {
            tracing::error!("Control API terminated: {e}");
        }
    });

    state.set_status("Ready.");
    tracing::info!("Bridge ready (API on port {})", api_port);

    while state.is_running() {
        if term.load(Ordering::Relaxed) {
            state.request_shutdown();
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    tracing::info!("Shutting down");
    server.abort();
    discovery.stop();
    manager.shutdown();

    tracing::info!("Goodbye");
    Ok(())
}
