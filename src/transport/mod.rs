//! Backend transports ("round trippers").
//!
//! A [`RoundTripper`] is a pooled hyper client built from one
//! [`ServersTransportConfig`]. Transports are shared by name through the
//! [`manager::RoundTripperManager`].

pub mod manager;
pub mod tls;

use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use http::Uri;
use hyper::body::Incoming;
use hyper_rustls::{FixedServerNameResolver, HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use rustls::pki_types::ServerName;

use crate::config::model::ServersTransportConfig;
use crate::error::{ConfigError, TransportError};
use crate::middleware::retry::ClientTrace;
use crate::middleware::Request;

/// Name under which the unconfigured transport is always registered.
pub const DEFAULT_TRANSPORT: &str = "default@internal";

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_MAX_IDLE_PER_HOST: usize = 200;

type Connector = HandshakeTimeout<HttpsConnector<HttpConnector>>;
pub type HttpClient = Client<Connector, Body>;

pub struct RoundTripper {
    client: HttpClient,
    response_header_timeout: Option<Duration>,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl std::fmt::Debug for RoundTripper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundTripper")
            .field("response_header_timeout", &self.response_header_timeout)
            .field("tls_override", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

/// Build a transport from its config.
///
/// Fails only when a TLS override cannot be turned into a client config.
pub fn create_round_tripper(cfg: &ServersTransportConfig) -> Result<RoundTripper, ConfigError> {
    let tls = if cfg.has_tls_override() {
        Some(tls::client_config(cfg)?)
    } else {
        None
    };
    Ok(RoundTripper::build(cfg, tls))
}

impl RoundTripper {
    /// The transport used when nothing is configured.
    #[must_use]
    pub fn unconfigured() -> Self {
        Self::build(&ServersTransportConfig::default(), None)
    }

    fn build(cfg: &ServersTransportConfig, tls: Option<rustls::ClientConfig>) -> Self {
        let timeouts = cfg.forwarding_timeouts.clone().unwrap_or_default();
        let dial_timeout = timeouts.dial_timeout.unwrap_or(DEFAULT_DIAL_TIMEOUT);

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_keepalive(Some(TCP_KEEPALIVE));
        if !dial_timeout.is_zero() {
            http.set_connect_timeout(Some(dial_timeout));
        }

        crate::tls::install_crypto_provider();
        let https = match tls.clone() {
            Some(client_config) => {
                let builder = HttpsConnectorBuilder::new()
                    .with_tls_config(client_config)
                    .https_or_http();
                let server_name = cfg
                    .server_name
                    .as_deref()
                    .filter(|s| !s.is_empty())
                    .and_then(|s| ServerName::try_from(s.to_string()).ok());
                match server_name {
                    Some(name) => builder
                        .with_server_name_resolver(FixedServerNameResolver::new(name))
                        .enable_http1()
                        .wrap_connector(http),
                    None => builder.enable_http1().wrap_connector(http),
                }
            }
            None => HttpsConnectorBuilder::new()
                .with_webpki_roots()
                .https_or_http()
                .enable_http1()
                .wrap_connector(http),
        };

        let connector = HandshakeTimeout {
            inner: https,
            timeout: dial_timeout.saturating_add(TLS_HANDSHAKE_TIMEOUT),
        };
        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(timeouts.idle_conn_timeout.unwrap_or(DEFAULT_IDLE_CONN_TIMEOUT))
            .pool_max_idle_per_host(cfg.max_idle_conn_per_host.unwrap_or(DEFAULT_MAX_IDLE_PER_HOST))
            .build(connector);

        Self {
            client,
            response_header_timeout: timeouts.response_header_timeout.filter(|d| !d.is_zero()),
            tls: tls.map(Arc::new),
        }
    }

    /// Client TLS settings, when the config overrides the defaults.
    #[must_use]
    pub const fn tls_config(&self) -> Option<&Arc<rustls::ClientConfig>> {
        self.tls.as_ref()
    }

    /// Send `req` and wait for the response head.
    ///
    /// A [`ClientTrace`] in the request extensions is committed as soon as
    /// the backend may have seen the request: on any response, and on every
    /// failure except a failed connect.
    pub async fn round_trip(&self, req: Request) -> Result<http::Response<Incoming>, TransportError> {
        let trace = req.extensions().get::<ClientTrace>().cloned();
        let fut = self.client.request(req);
        let result = match self.response_header_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result.map_err(classify),
                Err(_) => Err(TransportError::Timeout("response headers")),
            },
            None => fut.await.map_err(classify),
        };

        if let Some(trace) = trace {
            match result {
                Err(ref e) if e.is_connect() => {}
                _ => trace.commit(),
            }
        }
        result
    }
}

fn classify(err: hyper_util::client::legacy::Error) -> TransportError {
    let connect = err.is_connect();
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(e) = source {
        // Body errors are the client's stream failing, not the backend.
        if let Some(body) = e.downcast_ref::<axum::Error>() {
            return TransportError::RequestBody(body.to_string());
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::TimedOut if connect => return TransportError::ConnectTimeout,
                std::io::ErrorKind::TimedOut => return TransportError::Timeout("response"),
                std::io::ErrorKind::UnexpectedEof if !connect => {
                    return TransportError::UnexpectedEof
                }
                _ => {}
            }
        }
        if let Some(h) = e.downcast_ref::<hyper::Error>() {
            if h.is_incomplete_message() {
                return TransportError::UnexpectedEof;
            }
            if h.is_canceled() {
                return TransportError::Cancelled;
            }
            if h.is_timeout() {
                return TransportError::Timeout("response");
            }
        }
        source = e.source();
    }

    if connect {
        TransportError::Connect(error_chain(&err))
    } else {
        TransportError::Other(error_chain(&err))
    }
}

fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        message.push_str(": ");
        message.push_str(&e.to_string());
        source = e.source();
    }
    message
}

/// Bounds the whole connect, TCP dial plus TLS handshake.
#[derive(Clone)]
pub struct HandshakeTimeout<C> {
    inner: C,
    timeout: Duration,
}

impl<C> tower::Service<Uri> for HandshakeTimeout<C>
where
    C: tower::Service<Uri>,
    C::Future: Send + 'static,
    C::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    type Response = C::Response;
    type Error = Box<dyn StdError + Send + Sync>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let fut = self.inner.call(uri);
        let timeout = self.timeout;
        Box::pin(async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(Box::new(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                )) as Box<dyn StdError + Send + Sync>),
            }
        })
    }
}
