// Standalone daemon runtime: Unix socket, HTTP gateway, registry sweep, and
// shutdown wiring.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::hub::SessionHub;
use crate::proxy::{SubscriptionProxy, UnixSocketCaller};
use crate::registry::{MemoryRegistry, SubscriptionRegistry};
use crate::rpc::methods::RpcServerState;
use crate::rpc::unix::serve_unix_until_shutdown;
use crate::rpc::ws::GatewayState;
use crate::source::MemoryRecordSource;

/// Handle to a running daemon.
pub struct DaemonHandle {
    shutdown_tx: broadcast::Sender<()>,
    state: RpcServerState,
    http_addr: std::net::SocketAddr,
    tasks: Vec<JoinHandle<Result<()>>>,
}

impl DaemonHandle {
    pub fn state(&self) -> &RpcServerState {
        &self.state
    }

    /// Address the HTTP gateway actually bound (resolves port 0).
    pub fn http_addr(&self) -> std::net::SocketAddr {
        self.http_addr
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Wait for every server task to finish, returning the first error.
    pub async fn wait(self) -> Result<()> {
        let mut outcome = Ok(());
        for task in self.tasks {
            let result = task.await.context("daemon task panicked")?;
            if outcome.is_ok() {
                outcome = result;
            }
        }
        outcome
    }
}

/// Bind every listener and start serving. Returns once the daemon accepts
/// connections.
pub async fn start(config: &DaemonConfig) -> Result<DaemonHandle> {
    let listener = bind_socket(&config.socket_path)?;
    let http = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind http listener on {}", config.http_addr))?;
    let http_addr = http.local_addr().context("failed to read http listener address")?;

    let (shutdown_tx, _) = broadcast::channel(4);
    let hub = SessionHub::default();
    let backend = MemoryRegistry::default();
    let records = MemoryRecordSource::default();
    let registry =
        SubscriptionRegistry::new(Arc::new(backend.clone()), config.registry_settings());
    let state = RpcServerState::in_memory_with(registry, records, hub.clone())
        .with_shutdown_notifier(shutdown_tx.clone());

    let gateway = match &config.upstream_socket {
        Some(upstream) => {
            info!(upstream = %upstream.display(), "forwarding session subscriptions upstream");
            let proxy = SubscriptionProxy::new(Arc::new(UnixSocketCaller::new(upstream)));
            GatewayState::forwarding(state.clone(), hub, proxy)
        }
        None => GatewayState::local(state.clone(), hub),
    };

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(serve_unix_until_shutdown(
        listener,
        state.clone(),
        shutdown_tx.subscribe(),
    )));
    tasks.push(tokio::spawn(crate::http::serve_until_shutdown(
        http,
        gateway,
        shutdown_tx.subscribe(),
    )));
    tasks.push(tokio::spawn(sweep_until_shutdown(
        backend,
        config.sweep_interval(),
        shutdown_tx.subscribe(),
    )));

    info!(
        socket_path = %config.socket_path.display(),
        http_addr = %http_addr,
        "modelsync daemon started"
    );
    Ok(DaemonHandle { shutdown_tx, state, http_addr, tasks })
}

/// Run until ctrl-c or `daemon.shutdown`, then clean up the socket file.
pub async fn run(config: DaemonConfig) -> Result<()> {
    let handle = start(&config).await?;

    let ctrl_c_tx = handle.shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = ctrl_c_tx.send(());
        }
    });

    let result = handle.wait().await;
    remove_socket_file(&config.socket_path);
    info!("modelsync daemon stopped");
    result
}

async fn sweep_until_shutdown(
    backend: MemoryRegistry,
    every: std::time::Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut interval = tokio::time::interval(every);
    interval.reset();
    loop {
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            _ = interval.tick() => {
                let removed = backend.evict_expired();
                if removed > 0 {
                    debug!(removed, "swept expired listener lists");
                }
            }
        }
    }
}

/// Remove a stale socket file and bind a fresh listener, creating the parent
/// directory when needed.
fn bind_socket(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create `{}`", parent.display()))?;
    }
    if path.exists() {
        std::fs::remove_file(path).context("failed to remove stale socket")?;
    }
    UnixListener::bind(path).with_context(|| format!("failed to bind `{}`", path.display()))
}

fn remove_socket_file(path: &Path) {
    if let Err(error) = std::fs::remove_file(path) {
        if error.kind() != std::io::ErrorKind::NotFound {
            warn!(error = %error, "failed to remove socket file");
        }
    }
}
