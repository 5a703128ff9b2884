//! The set of configured entry points.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::http::StatusCode;
use tokio::task::JoinSet;

use super::EntryPoint;
use crate::config::model::EntryPointConfig;
use crate::error::{GatewayError, HandlerError};
use crate::middleware::{handler_fn, text_response, Request, SharedHandler};
use crate::tls::{CertificateProvider, StaticCertificateProvider};

/// Router used by an entry point that has none yet.
#[must_use]
pub fn not_found_handler() -> SharedHandler {
    handler_fn(|_req: Request| async {
        Ok::<_, HandlerError>(text_response(StatusCode::NOT_FOUND, "404 page not found"))
    })
}

#[derive(Default)]
pub struct EntryPointList {
    entry_points: BTreeMap<String, Arc<EntryPoint>>,
}

impl EntryPointList {
    /// Bind every entry point. Fails on the first one that cannot be built.
    pub async fn bind(
        configs: &BTreeMap<String, EntryPointConfig>,
        mut routers: BTreeMap<String, SharedHandler>,
    ) -> Result<Self, GatewayError> {
        let mut entry_points = BTreeMap::new();
        for (name, cfg) in configs {
            let certificates = cfg
                .tls
                .as_ref()
                .map(|tls| StaticCertificateProvider::new(tls.certificates.clone()));
            let router = routers.remove(name).unwrap_or_else(not_found_handler);
            let entry_point = EntryPoint::bind(
                name,
                cfg,
                router,
                certificates.as_ref().map(|p| p as &dyn CertificateProvider),
            )
            .await?;
            entry_points.insert(name.clone(), Arc::new(entry_point));
        }
        Ok(Self { entry_points })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<EntryPoint>> {
        self.entry_points.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<EntryPoint>)> {
        self.entry_points.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entry_points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entry_points.is_empty()
    }

    pub fn start(&self) {
        for (name, entry_point) in &self.entry_points {
            tracing::debug!(entry_point = %name, "starting entry point");
            entry_point.start();
        }
    }

    /// Shut every entry point down concurrently and wait for all of them.
    pub async fn stop(&self) {
        let mut stopping = JoinSet::new();
        for (name, entry_point) in &self.entry_points {
            let name = name.clone();
            let entry_point = Arc::clone(entry_point);
            stopping.spawn(async move {
                entry_point.shutdown().await;
                tracing::debug!(entry_point = %name, "entry point closed");
            });
        }
        while let Some(result) = stopping.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "entry point shutdown task failed");
            }
        }
    }

    /// Hot-swap the routers of the named entry points.
    pub fn switch(&self, routers: BTreeMap<String, SharedHandler>) {
        for (name, router) in routers {
            match self.entry_points.get(&name) {
                Some(entry_point) => entry_point.switch_router(Some(router)),
                None => tracing::warn!(entry_point = %name, "no such entry point, router ignored"),
            }
        }
    }
}
