//! Request/response transformers and the chain they form.
//!
//! Every unit implements [`Handler`] and wraps a "next" [`SharedHandler`].
//! Constructors validate their typed config and return a [`ConfigError`]
//! instead of a partially built handler. The configured subset is resolved
//! into the closed [`Middleware`] enum by [`resolve`] and composed by
//! [`build_chain`], outermost first:
//!
//! rate limit → add prefix → replace path (regex) → replace host →
//! circuit breaker → retry → terminal handler.
//!
//! Entry points additionally wrap the chain in [`recovery::Recovery`],
//! [`forwarded_headers::ForwardedHeaders`] and a hot-swappable
//! [`switcher::HandlerSwitcher`].

pub mod add_prefix;
pub mod circuit_breaker;
pub mod forwarded_headers;
pub mod path;
pub mod rate_limit;
pub mod recovery;
pub mod replace_host;
pub mod replace_path;
pub mod replace_path_regex;
pub mod retry;
pub mod switcher;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::config::model::{
    AddPrefixConfig, CircuitBreakerConfig, MiddlewareConfig, RateLimitConfig, ReplaceHostConfig,
    ReplacePathConfig, ReplacePathRegexConfig, RetryConfig,
};
use crate::error::{ConfigError, HandlerError};

pub type Request = http::Request<Body>;
pub type Response = http::Response<Body>;

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, req: Request) -> Result<Response, HandlerError>;
}

pub type SharedHandler = Arc<dyn Handler>;

/// Peer details attached to every request by the accepting entry point.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    pub tls: bool,
}

struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
{
    async fn handle(&self, req: Request) -> Result<Response, HandlerError> {
        (self.0)(req).await
    }
}

/// Turn an async closure into a handler.
pub fn handler_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

/// Plain-text response with the given status.
pub fn text_response(status: StatusCode, body: impl Into<String>) -> Response {
    (status, body.into()).into_response()
}

/// One configured middleware, in the order it is applied.
#[derive(Debug, Clone)]
pub enum Middleware {
    RateLimit(RateLimitConfig),
    AddPrefix(AddPrefixConfig),
    ReplacePath(ReplacePathConfig),
    ReplacePathRegex(ReplacePathRegexConfig),
    ReplaceHost(ReplaceHostConfig),
    CircuitBreaker(CircuitBreakerConfig),
    Retry(RetryConfig),
}

impl Middleware {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RateLimit(_) => "rateLimit",
            Self::AddPrefix(_) => "addPrefix",
            Self::ReplacePath(_) => "replacePath",
            Self::ReplacePathRegex(_) => "replacePathRegex",
            Self::ReplaceHost(_) => "replaceHost",
            Self::CircuitBreaker(_) => "circuitBreaker",
            Self::Retry(_) => "retry",
        }
    }
}

/// Resolve the optional middleware blocks into an ordered list.
pub fn resolve(cfg: &MiddlewareConfig) -> Result<Vec<Middleware>, ConfigError> {
    if cfg.replace_path.is_some() && cfg.replace_path_regex.is_some() {
        return Err(ConfigError::Ambiguous(
            "replacePath and replacePathRegex cannot both be set".into(),
        ));
    }

    let mut chain = Vec::new();
    if let Some(ref c) = cfg.rate_limit {
        chain.push(Middleware::RateLimit(c.clone()));
    }
    if let Some(ref c) = cfg.add_prefix {
        chain.push(Middleware::AddPrefix(c.clone()));
    }
    if let Some(ref c) = cfg.replace_path_regex {
        chain.push(Middleware::ReplacePathRegex(c.clone()));
    }
    if let Some(ref c) = cfg.replace_path {
        chain.push(Middleware::ReplacePath(c.clone()));
    }
    if let Some(ref c) = cfg.replace_host {
        chain.push(Middleware::ReplaceHost(c.clone()));
    }
    if let Some(ref c) = cfg.circuit_breaker {
        chain.push(Middleware::CircuitBreaker(c.clone()));
    }
    if let Some(ref c) = cfg.retry {
        chain.push(Middleware::Retry(c.clone()));
    }
    Ok(chain)
}

/// Wrap `terminal` in every middleware, the first element ending up
/// outermost. Fails on the first invalid config.
pub fn build_chain(
    middlewares: &[Middleware],
    terminal: SharedHandler,
    retry_listener: &Arc<dyn retry::RetryListener>,
) -> Result<SharedHandler, ConfigError> {
    let mut next = terminal;
    for middleware in middlewares.iter().rev() {
        next = match middleware {
            Middleware::RateLimit(c) => Arc::new(rate_limit::RateLimit::new(next, c)),
            Middleware::AddPrefix(c) => Arc::new(add_prefix::AddPrefix::new(next, c)?),
            Middleware::ReplacePath(c) => Arc::new(replace_path::ReplacePath::new(next, c)),
            Middleware::ReplacePathRegex(c) => {
                Arc::new(replace_path_regex::ReplacePathRegex::new(next, c)?)
            }
            Middleware::ReplaceHost(c) => Arc::new(replace_host::ReplaceHost::new(next, c)?),
            Middleware::CircuitBreaker(c) => {
                Arc::new(circuit_breaker::CircuitBreaker::new(next, c))
            }
            Middleware::Retry(c) => {
                Arc::new(retry::Retry::new(next, c, Arc::clone(retry_listener))?)
            }
        };
        tracing::debug!(middleware = middleware.name(), "middleware added to chain");
    }
    Ok(next)
}
