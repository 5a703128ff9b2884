//! Top-level orchestration: entry points, background tasks and shutdown.
//!
//! [`Server`] ties a cancellable [`Lifecycle`] to the [`EntryPointList`]:
//! once the lifecycle is cancelled (usually by [`shutdown_signal`]) every
//! entry point drains concurrently. [`TaskPool`] owns long-running
//! background work such as the config refresh loop. [`build_routers`]
//! turns a config snapshot into one handler chain per entry point.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::model::{Config, EntryPointConfig};
use crate::entrypoint::list::EntryPointList;
use crate::error::{ConfigError, GatewayError};
use crate::middleware::retry::RetryListener;
use crate::middleware::{self, SharedHandler};
use crate::proxy::ReverseProxy;
use crate::transport::manager::RoundTripperManager;

/// Hard ceiling on [`Server::close`]. Exceeding it aborts the process.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Process-wide cancellation token. Cancelling is one-way and idempotent.
#[derive(Clone)]
pub struct Lifecycle {
    cancelled: Arc<watch::Sender<bool>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    #[must_use]
    pub fn new() -> Self {
        let (cancelled, _) = watch::channel(false);
        Self {
            cancelled: Arc::new(cancelled),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.send_replace(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Background tasks that are told to stop together.
///
/// Each task receives a stop receiver that flips to `true` on
/// [`stop`](Self::stop).
pub struct TaskPool {
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskPool {
    #[must_use]
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stop,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn spawn<F, Fut>(&self, task: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task(self.stop.subscribe()));
        self.tasks.lock().push(handle);
    }

    /// Signal every task and wait for all of them.
    pub async fn stop(&self) {
        self.stop.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "background task failed");
            }
        }
    }
}

pub struct Server {
    lifecycle: Lifecycle,
    pool: Arc<TaskPool>,
    entry_points: Arc<EntryPointList>,
    stopping: AtomicBool,
    stopped: watch::Sender<bool>,
}

impl Server {
    #[must_use]
    pub fn new(
        lifecycle: Lifecycle,
        pool: Arc<TaskPool>,
        entry_points: Arc<EntryPointList>,
    ) -> Arc<Self> {
        let (stopped, _) = watch::channel(false);
        Arc::new(Self {
            lifecycle,
            pool,
            entry_points,
            stopping: AtomicBool::new(false),
            stopped,
        })
    }

    #[must_use]
    pub fn entry_points(&self) -> &Arc<EntryPointList> {
        &self.entry_points
    }

    /// Start every entry point and stop them all once the lifecycle is
    /// cancelled.
    pub fn start(self: &Arc<Self>) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = server.lifecycle.cancelled() => {
                    tracing::info!("stopping server gracefully");
                    server.stop().await;
                }
                () = server.wait() => {}
            }
        });
        self.entry_points.start();
    }

    /// Shut every entry point down. Repeated calls wait for the first one.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            self.wait().await;
            return;
        }
        self.entry_points.stop().await;
        self.stopped.send_replace(true);
        tracing::info!("server stopped");
    }

    /// Block until the server has stopped.
    pub async fn wait(&self) {
        let mut rx = self.stopped.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Release the background tasks. Taking longer than [`CLOSE_TIMEOUT`]
    /// means something cannot be reclaimed, and the process is aborted.
    pub async fn close(&self) {
        let watchdog = tokio::spawn(async {
            tokio::time::sleep(CLOSE_TIMEOUT).await;
            tracing::error!("timeout while stopping, killing instance");
            std::process::abort();
        });

        self.pool.stop().await;
        self.stopped.send_replace(true);
        watchdog.abort();
    }
}

/// Handler chain of one entry point: its middleware around the reverse
/// proxy bound to its transport.
pub fn build_router(
    config: &Config,
    entry_point: &EntryPointConfig,
    manager: &Arc<RoundTripperManager>,
    retry_listener: &Arc<dyn RetryListener>,
) -> Result<SharedHandler, ConfigError> {
    let proxy: SharedHandler = Arc::new(ReverseProxy::new(
        Arc::clone(manager),
        entry_point.transport_name(),
    ));
    let chain = middleware::resolve(config.middleware_for(entry_point))?;
    middleware::build_chain(&chain, proxy, retry_listener)
}

pub fn build_routers(
    config: &Config,
    manager: &Arc<RoundTripperManager>,
    retry_listener: &Arc<dyn RetryListener>,
) -> Result<BTreeMap<String, SharedHandler>, GatewayError> {
    config
        .entry_points
        .iter()
        .map(|(name, entry_point)| {
            build_router(config, entry_point, manager, retry_listener)
                .map(|router| (name.clone(), router))
                .map_err(|source| GatewayError::EntryPoint {
                    entry_point: name.clone(),
                    source,
                })
        })
        .collect()
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}
