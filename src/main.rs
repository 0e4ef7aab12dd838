//! simbridge server binary.
//!
//! Startup: resolve configuration (exit 2 on invalid options, 3 on an
//! unusable state dir, 4 when the simulator tooling is missing), reconcile
//! the session store against live devices, then serve the REST and WebSocket
//! surfaces until SIGTERM/ctrl-c. Shutdown cancels in dependency order:
//! endpoints, background tasks, capture services, recordings (emergency
//! saved), and finally a session-store flush.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use simbridge::api::{self, AppState};
use simbridge::capture::Quality;
use simbridge::config::Config;
use simbridge::connections::ConnectionManager;
use simbridge::driver::HostDriver;
use simbridge::recording::RecordingService;
use simbridge::resources::ResourceManager;
use simbridge::session::SessionManager;
use simbridge::store::SessionStore;

const EXIT_BAD_CONFIG: i32 = 2;
const EXIT_STATE_DIR: i32 = 3;
const EXIT_NO_DRIVER: i32 = 4;

/// How often idle capture services are considered for eviction.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// simbridge - remote control plane for iOS simulators.
///
/// Creates and drives simulator sessions on this host and exposes them to
/// remote clients over REST and WebSockets: live video, input, app and file
/// management, GPS simulation, and MP4 recording.
#[derive(Parser, Debug)]
#[command(name = "simbridge", version, about, long_about = None)]
struct Args {
    /// TOML config file; CLI flags override file values.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    bind_host: Option<String>,

    #[arg(long)]
    bind_port: Option<u16>,

    /// Location of the session store and recordings.
    #[arg(long, env = "SIMBRIDGE_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[arg(long)]
    max_connections_per_session: Option<usize>,

    #[arg(long)]
    max_connections_per_minute: Option<usize>,

    #[arg(long)]
    rate_limit_window_seconds: Option<u64>,

    #[arg(long)]
    max_memory_mb: Option<u64>,

    #[arg(long)]
    memory_check_interval: Option<u64>,

    #[arg(long)]
    service_idle_timeout: Option<u64>,

    #[arg(long)]
    connection_cleanup_interval: Option<u64>,

    /// Initial capture preset: low, medium, high, or ultra.
    #[arg(long)]
    default_quality: Option<String>,

    #[arg(long)]
    default_fps: Option<u32>,

    #[arg(long)]
    backup_retention_count: Option<usize>,
}

fn resolve_config(args: &Args) -> Result<Config, String> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("config file {} does not exist", path.display()))?,
        None => Config::default(),
    };

    if let Some(host) = &args.bind_host {
        config.bind_host = host.clone();
    }
    if let Some(port) = args.bind_port {
        config.bind_port = port;
    }
    if let Some(dir) = &args.state_dir {
        config.state_dir = dir.clone();
    }
    if let Some(v) = args.max_connections_per_session {
        config.max_connections_per_session = v;
    }
    if let Some(v) = args.max_connections_per_minute {
        config.max_connections_per_minute = v;
    }
    if let Some(v) = args.rate_limit_window_seconds {
        config.rate_limit_window_seconds = v;
    }
    if let Some(v) = args.max_memory_mb {
        config.max_memory_mb = v;
    }
    if let Some(v) = args.memory_check_interval {
        config.memory_check_interval_secs = v;
    }
    if let Some(v) = args.service_idle_timeout {
        config.service_idle_timeout_secs = v;
    }
    if let Some(v) = args.connection_cleanup_interval {
        config.connection_cleanup_interval_secs = v;
    }
    if let Some(quality) = &args.default_quality {
        config.default_quality = match quality.as_str() {
            "low" => Quality::Low,
            "medium" => Quality::Medium,
            "high" => Quality::High,
            "ultra" => Quality::Ultra,
            other => return Err(format!("unknown quality preset '{}'", other)),
        };
    }
    if let Some(v) = args.default_fps {
        config.default_fps = v;
    }
    if let Some(v) = args.backup_retention_count {
        config.backup_retention_count = v;
    }

    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "simbridge=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match resolve_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("simbridge: {}", e);
            std::process::exit(EXIT_BAD_CONFIG);
        }
    };
    tracing::info!(state_dir = %config.state_dir.display(), "simbridge starting");

    let store = match SessionStore::open(&config.state_dir, config.backup_retention_count) {
        Ok(store) => store,
        Err(e) => {
            eprintln!(
                "simbridge: state dir {} is unusable: {}",
                config.state_dir.display(),
                e
            );
            std::process::exit(EXIT_STATE_DIR);
        }
    };
    let recording = match RecordingService::new(
        config.recordings_dir(),
        config.emergency_recordings_dir(),
        Duration::from_secs(config.emergency_recording_max_age_secs),
    ) {
        Ok(recording) => recording,
        Err(e) => {
            eprintln!(
                "simbridge: recordings dir under {} is unusable: {}",
                config.state_dir.display(),
                e
            );
            std::process::exit(EXIT_STATE_DIR);
        }
    };

    let driver = Arc::new(HostDriver::new());
    if let Err(e) = driver.check_tooling().await {
        eprintln!("simbridge: simulator tooling unavailable: {}", e);
        std::process::exit(EXIT_NO_DRIVER);
    }

    let sessions = SessionManager::new(Arc::clone(&driver), store);
    sessions.startup().await;

    let resources = ResourceManager::new(
        Duration::from_secs(config.service_idle_timeout_secs),
        config.max_memory_mb,
        config.default_quality,
        config.default_fps,
    );
    let connections = ConnectionManager::new(
        config.max_connections_per_session,
        config.max_connections_per_minute,
        Duration::from_secs(config.rate_limit_window_seconds),
    );

    let state = AppState {
        config: Arc::new(config.clone()),
        driver,
        sessions: sessions.clone(),
        resources: resources.clone(),
        connections: connections.clone(),
        recording: recording.clone(),
    };

    // Background tasks are owned here, not by the components, so shutdown
    // ordering stays under the server's control.
    let cancel = CancellationToken::new();
    spawn_background_tasks(&state, &cancel);

    let bind = match config.bind_addr() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("simbridge: {}", e);
            std::process::exit(EXIT_BAD_CONFIG);
        }
    };
    let listener = match tokio::net::TcpListener::bind(bind).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("simbridge: cannot bind {}: {}", bind, e);
            std::process::exit(EXIT_BAD_CONFIG);
        }
    };
    tracing::info!(addr = %bind, "server listening");

    let app = api::router(state);
    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(e) = serve.await {
        tracing::error!(error = %e, "server error");
    }

    // Endpoints are closed; unwind the rest in dependency order.
    tracing::info!("shutting down");
    cancel.cancel();
    resources.cleanup_all().await;
    recording.emergency_stop_all().await;
    sessions.persist().await;
    tracing::info!("simbridge exiting");
}

fn spawn_background_tasks(state: &AppState, cancel: &CancellationToken) {
    let resources = state.resources.clone();
    let memory_interval = Duration::from_secs(state.config.memory_check_interval_secs);
    let token = cancel.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(memory_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => resources.check_memory().await,
            }
        }
    });

    let resources = state.resources.clone();
    let token = cancel.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(IDLE_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => resources.sweep_idle().await,
            }
        }
    });

    let connections = state.connections.clone();
    let reaper_interval = Duration::from_secs(state.config.connection_cleanup_interval_secs);
    let token = cancel.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reaper_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => connections.reap(),
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
