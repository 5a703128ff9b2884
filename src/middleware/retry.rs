//! Retries requests the backend never saw.
//!
//! Each attempt carries a fresh [`ClientTrace`] in its extensions. The
//! forwarding layer marks the trace committed once request data may have
//! reached the backend; from then on the attempt's outcome is final. An
//! uncommitted attempt that ended in 502/503/504 or a handler error is
//! retried after a deterministic exponential backoff while attempts remain.
//!
//! Bodies are buffered up to `maxBodyBytes` so every attempt sends the same
//! bytes. A body of unknown or larger size is streamed once and the request
//! is not retried.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use http::StatusCode;
use http_body_util::BodyExt;

use super::{Handler, Request, Response, SharedHandler};
use crate::config::model::RetryConfig;
use crate::error::{ConfigError, HandlerError};

const MAX_INTERVAL: Duration = Duration::from_secs(60);
const RETRYABLE_STATUS: [StatusCode; 3] = [
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Shared flag telling the retry loop that the backend received data.
#[derive(Debug, Clone, Default)]
pub struct ClientTrace(Arc<AtomicBool>);

impl ClientTrace {
    pub fn commit(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Notified before every new attempt with the 1-based attempt number.
pub trait RetryListener: Send + Sync {
    fn retried(&self, req: &http::request::Parts, attempt: u32);
}

/// Default listener: a debug log line per retry.
#[derive(Debug, Default)]
pub struct LogRetryListener;

impl RetryListener for LogRetryListener {
    fn retried(&self, req: &http::request::Parts, attempt: u32) {
        tracing::debug!(attempt, method = %req.method, uri = %req.uri, "retrying request");
    }
}

/// Exponential backoff without jitter. The multiplier is chosen so the
/// interval at most doubles over the configured attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    multiplier: f64,
}

impl Backoff {
    #[must_use]
    pub fn new(attempts: u32, initial_interval: Duration) -> Self {
        if attempts < 2 || initial_interval.is_zero() {
            return Self {
                current: Duration::ZERO,
                multiplier: 1.0,
            };
        }
        Self {
            current: initial_interval,
            multiplier: 2f64.powf(1.0 / f64::from(attempts - 1)),
        }
    }

    pub fn next_backoff(&mut self) -> Duration {
        let interval = self.current;
        self.current = self.current.mul_f64(self.multiplier).min(MAX_INTERVAL);
        interval
    }
}

pub struct Retry {
    next: SharedHandler,
    attempts: u32,
    initial_interval: Duration,
    max_body_bytes: usize,
    listener: Arc<dyn RetryListener>,
}

impl Retry {
    pub fn new(
        next: SharedHandler,
        cfg: &RetryConfig,
        listener: Arc<dyn RetryListener>,
    ) -> Result<Self, ConfigError> {
        let attempts = u32::try_from(cfg.attempts)
            .ok()
            .filter(|a| *a > 0)
            .ok_or(ConfigError::InvalidAttempts(cfg.attempts))?;
        Ok(Self {
            next,
            attempts,
            initial_interval: cfg.initial_interval,
            max_body_bytes: cfg.max_body_bytes,
            listener,
        })
    }

    async fn buffer(&self, body: Body) -> Result<Result<Bytes, Body>, HandlerError> {
        let fits = hyper::body::Body::size_hint(&body)
            .upper()
            .is_some_and(|n| n <= self.max_body_bytes as u64);
        if !fits {
            return Ok(Err(body));
        }
        match body.collect().await {
            Ok(collected) => Ok(Ok(collected.to_bytes())),
            Err(e) => {
                tracing::debug!(error = %e, "request body failed while buffering for retry");
                Err(HandlerError::Aborted)
            }
        }
    }

    fn should_retry(result: &Result<Response, HandlerError>) -> bool {
        match result {
            Ok(resp) => RETRYABLE_STATUS.contains(&resp.status()),
            Err(HandlerError::Aborted) => false,
            Err(_) => true,
        }
    }
}

#[async_trait]
impl Handler for Retry {
    async fn handle(&self, req: Request) -> Result<Response, HandlerError> {
        if self.attempts < 2 {
            return self.next.handle(req).await;
        }

        let (parts, body) = req.into_parts();
        let body = match self.buffer(body).await? {
            Ok(bytes) => bytes,
            Err(stream) => {
                tracing::debug!(uri = %parts.uri, "request body too large to replay, not retrying");
                return self.next.handle(Request::from_parts(parts, stream)).await;
            }
        };

        let mut backoff = Backoff::new(self.attempts, self.initial_interval);
        let mut attempt = 1;
        loop {
            let trace = ClientTrace::default();
            let mut req = Request::from_parts(parts.clone(), Body::from(body.clone()));
            req.extensions_mut().insert(trace.clone());

            let result = self.next.handle(req).await;
            if attempt >= self.attempts || trace.is_committed() || !Self::should_retry(&result) {
                return result;
            }
            drop(result);

            let delay = backoff.next_backoff();
            attempt += 1;
            self.listener.retried(&parts, attempt);
            tokio::time::sleep(delay).await;
        }
    }
}
