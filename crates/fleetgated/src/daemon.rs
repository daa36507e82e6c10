//! Wiring and lifecycle of the daemon's subsystems.

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use fleetgate_api::{ApiState, build_router};
use fleetgate_auth::AccessValidator;
use fleetgate_proxy::{ProxySync, WorkloadProxy};
use fleetgate_state::StateStore;

use crate::config::Config;

const DB_FILE: &str = "fleetgate.redb";

/// Running subsystems, minus the HTTP listener.
pub struct Daemon {
    state: ApiState,
    shutdown_tx: watch::Sender<bool>,
    sync_handle: JoinHandle<()>,
}

impl Daemon {
    /// Open the store, build the proxy and start following the store.
    pub fn start(config: &Config) -> anyhow::Result<Self> {
        let store = open_store(config)?;

        let proxy = Arc::new(WorkloadProxy::new(config.balancer.balancer_config()));
        info!("workload proxy initialized");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let events = store.subscribe();
        let sync = ProxySync::new(Arc::clone(&proxy));
        let sync_handle = tokio::spawn(sync.run(store.clone(), events, shutdown_rx));
        info!("proxy sync started");

        let state = ApiState {
            validator: AccessValidator::from_store(store.clone()),
            store,
            proxy,
            settings: Arc::new(config.workload_proxy.settings()),
        };
        Ok(Self {
            state,
            shutdown_tx,
            sync_handle,
        })
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub fn state(&self) -> &ApiState {
        &self.state
    }

    /// Stop the store watcher, then every load balancer.
    pub async fn stop(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.sync_handle.await {
            error!(error = %e, "proxy sync task failed");
        }
        self.state
            .proxy
            .shutdown()
            .await
            .context("failed to stop load balancers")?;
        info!("subsystems stopped");
        Ok(())
    }
}

fn open_store(config: &Config) -> anyhow::Result<StateStore> {
    let Some(dir) = &config.server.data_dir else {
        info!("state store in memory");
        return StateStore::open_in_memory().context("failed to open in-memory store");
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create data dir {}", dir.display()))?;
    let path = dir.join(DB_FILE);
    let store = StateStore::open(&path)
        .with_context(|| format!("failed to open state store {}", path.display()))?;
    info!(path = ?path, "state store opened");
    Ok(store)
}

/// Serve until Ctrl-C, then shut everything down.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let daemon = Daemon::start(&config)?;
    let router = daemon.router();

    let addr = config.server.listen;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
        })
        .await
        .context("HTTP server failed")?;

    daemon.stop().await?;
    info!("fleetgate daemon stopped");
    Ok(())
}
