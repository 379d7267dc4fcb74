mod config;
mod error;
mod events;
mod governor;
mod naming;
mod notify;
mod platform;
mod postprocess;
mod recorder;
mod registry;
mod resolver;
mod status;
mod supervisor;

use std::io::Write;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::{ConfigStore, Settings};
use events::EventBus;
use governor::Governor;
use notify::NotificationHub;
use registry::UrlRegistry;
use resolver::ResolverRouter;
use status::StatusBoard;
use supervisor::{SupervisorContext, SupervisorPool};

// ─── Startup checks ─────────────────────────────────────────────────────────

/// The muxer is a hard dependency; refuse to start without it.
async fn check_muxer(ffmpeg_path: &str) -> bool {
    tokio::process::Command::new(ffmpeg_path)
        .arg("-version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

/// First run with an empty URL list: ask for one room on stdin.
async fn prompt_first_url(store: &ConfigStore) {
    let lines = match store.read_url_lines().await {
        Ok(lines) => lines,
        Err(e) => {
            warn!(error = %e, "URL list unreadable, skipping first-run prompt");
            return;
        }
    };
    if lines.iter().any(|l| !l.trim().is_empty()) {
        return;
    }

    print!("URL list is empty. Paste one live room URL to start monitoring: ");
    let _ = std::io::stdout().flush();
    let mut input = String::new();
    if std::io::stdin().read_line(&mut input).is_err() {
        return;
    }
    let input = input.trim();
    if input.contains("://") {
        if let Err(e) = store.write_url_lines(&[input.to_string()]).await {
            warn!(error = %e, "could not write the URL list");
        } else {
            info!(url = input, "room added to the URL list");
        }
    } else if !input.is_empty() {
        warn!("that did not look like a URL; edit the URL list file to add rooms");
    }
}

// ─── Shutdown signal ────────────────────────────────────────────────────────

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// ─── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Load .env before anything else so STREAMREC_LOG is available.
    let _ = dotenvy::dotenv();
    let log_level = std::env::var("STREAMREC_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────────
    let base_dir = config::exe_dir();
    let store = match ConfigStore::open(
        base_dir.join("config.ini"),
        base_dir.join("URL_config.ini"),
    )
    .await
    {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "cannot open configuration");
            std::process::exit(1);
        }
    };
    let settings = Arc::new(Settings::load(&store).await);

    // ── Fatal startup checks ────────────────────────────────────────────
    if !check_muxer(&settings.ffmpeg_path).await {
        error!(
            path = %settings.ffmpeg_path,
            "ffmpeg not found; install it or set ffmpeg_path in config.ini"
        );
        std::process::exit(1);
    }
    let disk_probe_at = if settings.save_root.exists() {
        settings.save_root.clone()
    } else {
        base_dir.clone()
    };
    if let Some(free) = supervisor::free_space_gb(&disk_probe_at) {
        if free < settings.disk_space_floor_gb {
            error!(
                free_gb = format!("{free:.2}"),
                floor_gb = settings.disk_space_floor_gb,
                "disk space below the configured floor"
            );
            std::process::exit(-1);
        }
    }

    prompt_first_url(&store).await;

    // ── Wiring ──────────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let bus = EventBus::new();
    let board = StatusBoard::new();
    let governor = Governor::new(settings.preset_threads);
    let registry = UrlRegistry::new(store.clone());

    // Platform resolvers are pluggable: deployments register their
    // `StreamResolver` implementations here, keyed by host predicate.  The
    // built-in route covers raw `.m3u8`/`.flv` rooms.
    let router = Arc::new(ResolverRouter::new(settings.clone(), store.clone()));

    let hub = Arc::new(NotificationHub::from_settings(&settings));
    let ctx = Arc::new(SupervisorContext {
        settings: settings.clone(),
        store: store.clone(),
        registry: registry.clone(),
        router,
        governor: governor.clone(),
        bus: bus.clone(),
        board: board.clone(),
    });

    // ── Background tasks ────────────────────────────────────────────────
    let ticker = governor::spawn_ticker(governor.clone(), shutdown.clone());
    let backup = config::spawn_backup_worker(store.clone(), shutdown.clone());
    let reporter = status::spawn_reporter(
        board.clone(),
        registry.clone(),
        governor.clone(),
        settings.clone(),
        shutdown.clone(),
    );
    let dispatcher = notify::spawn_dispatcher(
        bus.clone(),
        hub,
        settings.clone(),
        shutdown.clone(),
    );

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let scanner = registry::spawn_scanner(registry.clone(), event_tx, shutdown.clone());

    let pool = SupervisorPool::new(ctx, shutdown.clone());
    let pool_task = tokio::spawn(pool.run(event_rx));

    info!("monitoring started; add or pause rooms by editing the URL list");

    // ── Run until signalled ─────────────────────────────────────────────
    shutdown_signal().await;
    info!("shutdown requested, stopping recorders gracefully");
    shutdown.cancel();

    // The pool waits out every room's grace window; the auxiliary tasks stop
    // on the same token.
    let _ = pool_task.await;
    for task in [ticker, backup, reporter, dispatcher, scanner] {
        let _ = task.await;
    }
    info!("bye");
}
