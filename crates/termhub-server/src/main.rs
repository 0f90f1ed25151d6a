//! termhub server.
//!
//! Run standalone with `termhub`, as HQ with `termhub --hq`, or as a remote
//! with `termhub --hq-url http://hq:4020 --remote-name box-1 --remote-url ...`.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use termhub_buffer::TerminalManager;
use termhub_core::{PtyManager, ShutdownState};
use termhub_hq::{ControlDirWatcher, HqClient, RemoteRegistry, SessionChange, WatcherMode};
use termhub_transport::{AppState, BufferAggregator, ServerMode, WsUpstreamConnector, router};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Cli, ServerConfig};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const TERMINAL_TTL: Duration = Duration::from_secs(30 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = ServerConfig::from_cli(Cli::parse())?;
    run(config).await
}

/// Everything torn down on shutdown, in order.
struct Services {
    shutdown: ShutdownState,
    watcher: ControlDirWatcher,
    hq_client: Option<Arc<HqClient>>,
    registry: Option<Arc<RemoteRegistry>>,
    aggregator: Arc<BufferAggregator>,
    terminals: Arc<TerminalManager>,
    tasks: Vec<JoinHandle<()>>,
}

impl Services {
    async fn shutdown(self) {
        if !self.shutdown.begin() {
            return;
        }
        tracing::info!("Shutting down");

        self.watcher.stop();
        if let Some(client) = &self.hq_client {
            client.destroy().await;
        }
        if let Some(registry) = &self.registry {
            registry.destroy();
        }
        for task in &self.tasks {
            task.abort();
        }
        self.aggregator.destroy();
        self.terminals.destroy();
    }
}

async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let shutdown = ShutdownState::new();
    let control_dir = config.control_dir.clone();
    control_dir
        .ensure_exists()
        .await
        .with_context(|| format!("Failed to create control directory {}", control_dir.path().display()))?;

    let terminals = Arc::new(TerminalManager::new(control_dir.clone()));

    let registry = (config.mode == ServerMode::Hq).then(|| {
        let registry = Arc::new(RemoteRegistry::new());
        registry.start_health_checker();
        registry
    });

    // Bind before registering so HQ can reach us as soon as it knows our URL.
    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.addr))?;

    let hq_client = match &config.remote {
        Some(remote) => {
            let client = Arc::new(HqClient::new(
                remote.hq_url.clone(),
                &remote.hq_username,
                &remote.hq_password,
                remote.name.clone(),
                remote.url.clone(),
                remote.bearer_token.clone(),
            ));
            client
                .register()
                .await
                .with_context(|| format!("Failed to register with HQ at {}", remote.hq_url))?;
            Some(client)
        }
        None => None,
    };

    let watcher_mode = match (&hq_client, &registry) {
        (Some(client), _) => WatcherMode::Remote(client.clone()),
        (None, Some(registry)) => WatcherMode::Hq(registry.clone()),
        (None, None) => WatcherMode::Standalone,
    };
    let pty_manager: Arc<dyn PtyManager> = Arc::new(control_dir.clone());
    let watcher = ControlDirWatcher::new(control_dir.clone(), watcher_mode, shutdown.clone())
        .with_pty_manager(pty_manager);
    let changes = watcher.subscribe();
    watcher
        .start()
        .await
        .context("Failed to watch control directory")?;

    let aggregator = BufferAggregator::new(
        terminals.clone(),
        registry.clone(),
        Arc::new(WsUpstreamConnector),
    );

    let tasks = vec![
        close_deleted_sessions(changes, terminals.clone()),
        cleanup_inactive_terminals(terminals.clone()),
    ];

    let app = router(
        AppState {
            mode: config.mode,
            control_dir,
            terminals: terminals.clone(),
            aggregator: aggregator.clone(),
            registry: registry.clone(),
            shutdown: shutdown.clone(),
        },
        config.auth.clone(),
    );

    let services = Services {
        shutdown,
        watcher,
        hq_client,
        registry,
        aggregator,
        terminals,
        tasks,
    };

    tracing::info!(mode = %config.mode, "Server listening on http://{}", config.addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            services.shutdown().await;
        })
        .await
        .context("Server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}

fn close_deleted_sessions(
    mut changes: broadcast::Receiver<SessionChange>,
    terminals: Arc<TerminalManager>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(SessionChange::Deleted(session_id)) => {
                    terminals.close_terminal(&session_id);
                }
                Ok(SessionChange::Created(_)) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Missed session change events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn cleanup_inactive_terminals(terminals: Arc<TerminalManager>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            terminals.cleanup_inactive_terminals(TERMINAL_TTL);
        }
    })
}
