use std::future::IntoFuture;
use std::process::ExitCode;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use aily_core::adapter::PlatformAdapter;
use aily_core::api::{api_router, ApiContext};
use aily_core::bus::EventBus;
use aily_core::config::Config;
use aily_core::discord::DiscordAdapter;
use aily_core::rate_limit::RateLimiter;
use aily_core::registry::SessionRegistry;
use aily_core::router::Router;
use aily_core::schedulers::{self, SchedulerContext};
use aily_core::scrape::TranscriptScraper;
use aily_core::slack::SlackAdapter;
use aily_core::snapshot;
use aily_core::ssh::{HostExecutor, SessionHost};
use aily_core::store::MessageStore;
use aily_core::types::PlatformKind;
use aily_core::BridgeError;

const EXIT_CONFIG: u8 = 2;
const EXIT_STORAGE: u8 = 3;
const EXIT_PLATFORM_AUTH: u8 = 4;
const EXIT_SIGNAL: u8 = 130;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const RATE_LIMIT_PER_SEC: u32 = 20;
const RATE_LIMIT_BURST: u32 = 40;

#[derive(Debug, Parser)]
#[command(name = "aily")]
#[command(about = "Bridge tmux sessions running AI agents to chat threads and a dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the relay service.
    Serve,
    /// Write a compressed database snapshot and prune old ones, then exit.
    Snapshot,
}

fn init_tracing() {
    let filter = std::env::var("AILY_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match cli.command {
        Commands::Serve => run_serve(config).await,
        Commands::Snapshot => run_snapshot(&config),
    }
}

fn run_snapshot(config: &Config) -> ExitCode {
    let retain = Duration::from_secs(config.backup_retain_days * 24 * 3_600);
    let result = snapshot::write_snapshot(&config.db_path, &config.backup_dir).and_then(|path| {
        println!("{}", path.display());
        snapshot::prune_snapshots(&config.backup_dir, retain)
    });
    match result {
        Ok(pruned) => {
            if pruned > 0 {
                tracing::info!(pruned, "pruned old snapshots");
            }
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("snapshot failed: {error}");
            ExitCode::from(EXIT_STORAGE)
        }
    }
}

async fn run_serve(config: Config) -> ExitCode {
    tracing::info!(
        hosts = ?config.ssh_hosts,
        platforms = ?config.platforms.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
        db = %config.db_path.display(),
        "starting aily"
    );
    if config.dashboard_token.is_empty() {
        tracing::warn!("DASHBOARD_TOKEN is unset; dashboard API is unauthenticated");
    }

    let store = match MessageStore::open(&config.db_path).await {
        Ok(store) => store,
        Err(error) => {
            eprintln!(
                "failed to open database at {}: {error}",
                config.db_path.display()
            );
            return ExitCode::from(EXIT_STORAGE);
        }
    };

    let bus = EventBus::new();
    let registry = Arc::new(SessionRegistry::new(store.pool().clone(), bus.clone()));
    if let Err(error) = registry.load().await {
        eprintln!("failed to load sessions: {error}");
        return ExitCode::from(EXIT_STORAGE);
    }

    let executor: Arc<dyn SessionHost> = Arc::new(HostExecutor::new(config.ssh_hosts.clone()));

    let mut adapters: Vec<Arc<dyn PlatformAdapter>> = Vec::new();
    for platform in &config.platforms {
        let adapter: Arc<dyn PlatformAdapter> = match platform {
            PlatformKind::Discord => Arc::new(DiscordAdapter::new(
                &config.discord_bot_token,
                &config.discord_channel_id,
            )),
            PlatformKind::Slack => Arc::new(SlackAdapter::new(
                &config.slack_bot_token,
                &config.slack_app_token,
                &config.slack_channel_id,
            )),
        };
        adapters.push(adapter);
    }

    let router = Arc::new(Router::new(
        registry.clone(),
        store.clone(),
        bus.clone(),
        executor.clone(),
        adapters.clone(),
        config.clone(),
    ));

    // Platform gateways. A rejected token is unrecoverable; transport
    // failures leave the platform degraded and the gateway keeps retrying.
    let (inbound_tx, mut inbound_rx) = mpsc::channel(512);
    for adapter in &adapters {
        match adapter.connect(inbound_tx.clone()).await {
            Ok(()) => {}
            Err(BridgeError::AuthRejected(reason)) => {
                eprintln!("platform authentication failed: {reason}");
                return ExitCode::from(EXIT_PLATFORM_AUTH);
            }
            Err(error) => {
                tracing::error!(
                    platform = adapter.kind().as_str(),
                    %error,
                    "platform connect failed; continuing without it"
                );
            }
        }
    }
    drop(inbound_tx);

    // A single consumer keeps per-session ordering trivial: platform
    // events are handled strictly in arrival order.
    let inbound_router = router.clone();
    let inbound_loop = tokio::spawn(async move {
        while let Some(event) = inbound_rx.recv().await {
            inbound_router.handle_platform_inbound(event).await;
        }
    });

    router.announce().await;

    let scraper = Arc::new(TranscriptScraper::new(executor.clone(), store.clone()));
    let sched_ctx = Arc::new(SchedulerContext {
        router: router.clone(),
        registry: registry.clone(),
        executor: executor.clone(),
        scraper,
        bus: bus.clone(),
        config: config.clone(),
    });
    let scheduler_handles = schedulers::spawn_all(sched_ctx.clone());

    let api_ctx = Arc::new(ApiContext {
        router: router.clone(),
        registry,
        store: store.clone(),
        bus,
        sched: sched_ctx,
        token: (!config.dashboard_token.is_empty()).then(|| config.dashboard_token.clone()),
        limiter: RateLimiter::new(RATE_LIMIT_PER_SEC, RATE_LIMIT_BURST),
        ws_clients: AtomicUsize::new(0),
    });

    let bind = format!("{}:{}", config.bind_host, config.bind_port);
    let listener = match tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))
    {
        Ok(listener) => listener,
        Err(error) => {
            eprintln!("{error:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    tracing::info!(addr = %bind, "dashboard listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let app = api_router(api_ctx)
        .into_make_service_with_connect_info::<std::net::SocketAddr>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
    });
    let server_handle = tokio::spawn(server.into_future());

    wait_for_signal().await;
    tracing::info!("shutting down");

    // Shutdown order: stop accepting and drain HTTP/streaming (bounded),
    // flush the store writer, close platform gateways, stop schedulers.
    let _ = shutdown_tx.send(());
    if tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await.is_err() {
        tracing::warn!("drain timeout elapsed; abandoning open connections");
    }

    store.flush().await;
    for adapter in &adapters {
        adapter.disconnect().await;
    }
    for handle in scheduler_handles {
        handle.abort();
    }
    inbound_loop.abort();

    tracing::info!("shutdown complete");
    ExitCode::from(EXIT_SIGNAL)
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(error) => {
                    tracing::warn!(%error, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
