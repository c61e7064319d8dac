pub mod address;
pub mod app_state;
pub mod auth;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod persistence;
pub mod quota;
pub mod registry;
pub mod releases;
pub mod router;
pub mod routes;
pub mod services;
pub mod session;
pub mod status;
pub mod supervisor;
pub mod tasks;
pub mod telemetry;
pub mod tokens;
pub mod traffic;
pub mod updates;
pub mod version;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::{env, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app_state::AppState;
use crate::metrics::{init_metrics_recorder, record_build_info};
use crate::releases::GithubReleaseSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMode {
    Serve,
    MigrationsDryRun,
}

pub fn parse_command() -> Result<CommandMode> {
    parse_args(env::args().skip(1))
}

fn parse_args<I>(mut args: I) -> Result<CommandMode>
where
    I: Iterator<Item = String>,
{
    let Some(first) = args.next() else {
        return Ok(CommandMode::Serve);
    };

    match first.as_str() {
        "--migrations-dry-run" => Ok(CommandMode::MigrationsDryRun),
        "migrate" => match args.next().as_deref() {
            Some("--dry-run") | Some("dry-run") => Ok(CommandMode::MigrationsDryRun),
            _ => anyhow::bail!("unknown migrate option; use --dry-run"),
        },
        "--help" | "-h" => {
            println!(
                "Usage: node-hub [--migrations-dry-run]|[migrate --dry-run]\n\
                 Run without arguments to start the hub. Configuration is read from\n\
                 config.toml and NODE_HUB__* environment variables."
            );
            std::process::exit(0);
        }
        other => anyhow::bail!("unknown argument: {other}"),
    }
}

/// Boot the hub using the provided command mode.
pub async fn run(mode: CommandMode) -> Result<()> {
    run_with_shutdown(mode, shutdown_signal()).await
}

pub async fn run_with_shutdown<S>(mode: CommandMode, shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let app_config = config::load()?;
    let metrics_handle = init_metrics_recorder();

    let db_pool = persistence::migrations::init_pool(&app_config.database.url).await?;
    if mode == CommandMode::MigrationsDryRun {
        let snapshot = persistence::migrations::migration_snapshot(&db_pool).await?;
        info!(
            current_version = snapshot.latest_applied,
            target_version = snapshot.latest_available,
            pending = snapshot.pending.len(),
            "migration dry-run completed"
        );
        return Ok(());
    }

    let migration_outcome = persistence::migrations::run_migrations(&db_pool).await?;
    if migration_outcome.applied.is_empty() {
        info!(
            current_version = migration_outcome.snapshot.latest_applied,
            target_version = migration_outcome.snapshot.latest_available,
            "database schema is up to date"
        );
    } else {
        for mig in &migration_outcome.applied {
            info!(
                version = mig.version,
                description = mig.description,
                "applied database migration"
            );
        }
    }
    record_build_info(&migration_outcome.snapshot);

    let releases = Arc::new(GithubReleaseSource::new(&app_config.releases)?);
    let state = AppState::assemble(
        db_pool.clone(),
        &app_config,
        releases,
        metrics_handle,
        migration_outcome.snapshot,
    )?;
    info!(
        repo = %app_config.releases.github_repo,
        max_frame_bytes = app_config.hub.max_frame_bytes,
        ping_interval_secs = app_config.hub.ping_interval_secs,
        pong_timeout_secs = app_config.hub.pong_timeout_secs,
        "hub components assembled"
    );

    let api_addr: SocketAddr = format!("{}:{}", app_config.server.host, app_config.server.port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid listen address: {}", err))?;
    let metrics_addr: SocketAddr =
        format!("{}:{}", app_config.metrics.host, app_config.metrics.port)
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid metrics listen address: {}", err))?;

    let app = routes::build_router(state.clone()).with_state(state.clone());
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    let metrics_app = routes::build_metrics_router(state.clone()).with_state(state.clone());
    let metrics_service = metrics_app.into_make_service_with_connect_info::<SocketAddr>();

    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    info!(%api_addr, "node-hub listening");
    info!(%metrics_addr, "node-hub metrics listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx_for_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown.await;
        let _ = shutdown_tx_for_signal.send(true);
    });

    let flush_task = tokio::spawn(routes::traffic_flush_loop(
        state.db.clone(),
        state.buffer.clone(),
        Duration::from_secs(app_config.traffic.flush_interval_secs),
        shutdown_rx.clone(),
    ));

    let mut api_shutdown = shutdown_rx.clone();
    let mut metrics_shutdown = shutdown_rx.clone();

    let mut api_task = tokio::spawn(async move {
        axum::serve(api_listener, make_service)
            .with_graceful_shutdown(async move {
                let _ = api_shutdown.changed().await;
            })
            .await
    });

    let mut metrics_task = tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_service)
            .with_graceful_shutdown(async move {
                let _ = metrics_shutdown.changed().await;
            })
            .await
    });

    let served = tokio::select! {
        res = &mut api_task => {
            let _ = shutdown_tx.send(true);
            let served = join_server("node-hub", res);
            join_server("node-hub metrics", metrics_task.await).and(served)
        }
        res = &mut metrics_task => {
            let _ = shutdown_tx.send(true);
            let served = join_server("node-hub metrics", res);
            join_server("node-hub", api_task.await).and(served)
        }
    };

    // Upgraded agent sockets outlive the listeners; drop them before the last flush.
    let closed = state.registry.close_all().await;
    if closed > 0 {
        info!(closed, "closed agent sessions on shutdown");
    }

    if let Err(err) = flush_task.await {
        warn!(%err, "traffic flush task did not finish cleanly");
    }

    served
}

fn join_server(
    name: &str,
    res: std::result::Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    res.map_err(|err| anyhow::anyhow!("{name} task failed: {err}"))?
        .map_err(|err| anyhow::anyhow!("{name} server failed: {err}"))
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                std::future::pending::<Option<()>>().await
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }
}
