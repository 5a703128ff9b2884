//! `gatehouse run`: start the gateway.
//!
//! Loads the config file, builds the transports and one handler chain per
//! entry point, binds the entry points and serves until SIGTERM / Ctrl+C.
//! A background refresh loop polls the config file and hot-swaps
//! transports and routers when it changes.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::cli::RunArgs;
use crate::config::sources;
use crate::config::{ConfigSource, ConfigVersion};
use crate::entrypoint::list::EntryPointList;
use crate::error::GatewayError;
use crate::logging;
use crate::middleware::retry::{LogRetryListener, RetryListener};
use crate::server::{self, Lifecycle, Server, TaskPool};
use crate::transport::manager::RoundTripperManager;

pub async fn execute(args: RunArgs) -> Result<(), GatewayError> {
    let log_format = logging::resolve_format(args.pretty, args.json);
    logging::init(&args.log_level, log_format, args.log_file.as_deref())?;

    let source = sources::from_path(&args.config)?;
    let (config, version) = source.load().await?;

    let manager = Arc::new(RoundTripperManager::new());
    manager.update(config.transport_configs());
    let retry_listener: Arc<dyn RetryListener> = Arc::new(LogRetryListener);
    let routers = server::build_routers(&config, &manager, &retry_listener)?;
    let entry_points = Arc::new(EntryPointList::bind(&config.entry_points, routers).await?);

    let pool = Arc::new(TaskPool::new());
    if args.poll_interval > 0 {
        let reloader = Reloader {
            source,
            version,
            entry_point_names: config.entry_points.keys().cloned().collect(),
            manager,
            entry_points: Arc::clone(&entry_points),
            retry_listener,
        };
        let every = Duration::from_secs(args.poll_interval);
        pool.spawn(move |stop| reloader.run(every, stop));
    }

    let lifecycle = Lifecycle::new();
    let server = Server::new(lifecycle.clone(), pool, Arc::clone(&entry_points));
    server.start();

    tracing::info!(
        config = %args.config.display(),
        entry_points = entry_points.len(),
        "gatehouse started"
    );

    tokio::spawn(async move {
        server::shutdown_signal().await;
        lifecycle.cancel();
    });

    server.wait().await;
    server.close().await;

    tracing::info!("gatehouse stopped");
    Ok(())
}

/// Polls the config source and applies changes to the running gateway.
pub struct Reloader {
    source: Box<dyn ConfigSource>,
    version: ConfigVersion,
    entry_point_names: BTreeSet<String>,
    manager: Arc<RoundTripperManager>,
    entry_points: Arc<EntryPointList>,
    retry_listener: Arc<dyn RetryListener>,
}

impl Reloader {
    async fn run(mut self, every: Duration, mut stop: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop.changed() => {
                    tracing::debug!("config refresh loop shutting down");
                    return;
                }
            }

            match self.source.has_changed(&self.version).await {
                Ok(true) => {
                    tracing::info!("config change detected, reloading");
                    if let Err(e) = self.reload().await {
                        tracing::error!(error = %e, "config reload failed, keeping current config");
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "config change check failed");
                }
            }
        }
    }

    /// Load the current config and apply it. Routers are built before
    /// anything is touched, so an invalid config changes nothing.
    pub async fn reload(&mut self) -> Result<(), GatewayError> {
        let (config, version) = self.source.load().await?;
        let routers = server::build_routers(&config, &self.manager, &self.retry_listener)?;

        let names: BTreeSet<String> = config.entry_points.keys().cloned().collect();
        if names != self.entry_point_names {
            tracing::warn!(
                "entry points were added or removed; listeners only change on restart"
            );
        }

        let rebuilt = self.manager.update(config.transport_configs());
        self.entry_points.switch(routers);
        self.version = version;
        self.entry_point_names = names;

        tracing::info!(
            transports_rebuilt = rebuilt,
            entry_points = config.entry_points.len(),
            "config reloaded"
        );
        Ok(())
    }
}
