//! HTTP entry points: one listener, its handler chain and its lifecycle.
//!
//! Every accepted connection is peeked before serving. A first byte of
//! `0x16` (TLS handshake record) sends it through the entry point's TLS
//! acceptor; anything else is served as plaintext HTTP/1.1. Connections run
//! on their own tasks, tracked by a [`tracker::ConnectionTracker`] so
//! shutdown can drain them or cut them off.

pub mod list;
pub mod tracker;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode};
use hyper::body::Incoming;
use hyper::rt::{Read, Write};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;

use crate::config::model::{EntryPointConfig, LifeCycle, Protocol};
use crate::error::{ConfigError, GatewayError, HandlerError};
use crate::middleware::forwarded_headers::ForwardedHeaders;
use crate::middleware::recovery::Recovery;
use crate::middleware::switcher::HandlerSwitcher;
use crate::middleware::{text_response, ConnectionInfo, Request, Response, SharedHandler};
use crate::tls::CertificateProvider;
use tracker::ConnectionTracker;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

const TLS_RECORD_HANDSHAKE: u8 = 0x16;

#[derive(Debug, Clone, Copy)]
struct Timeouts {
    /// Bounds reading a request head, and the peek/handshake of a new
    /// connection.
    header_read: Duration,
    write: Option<Duration>,
}

pub struct EntryPoint {
    name: String,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    switcher: Arc<HandlerSwitcher>,
    root: SharedHandler,
    tls: Option<TlsAcceptor>,
    life_cycle: LifeCycle,
    timeouts: Timeouts,
    tracker: Arc<ConnectionTracker>,
    shutdown: watch::Sender<bool>,
}

impl EntryPoint {
    /// Bind the listener and build the serving chain
    /// `recovery → forwarded headers → switcher(router)`.
    pub async fn bind(
        name: &str,
        cfg: &EntryPointConfig,
        router: SharedHandler,
        certificates: Option<&dyn CertificateProvider>,
    ) -> Result<Self, GatewayError> {
        let wrap = |source: ConfigError| GatewayError::EntryPoint {
            entry_point: name.to_string(),
            source,
        };

        // HTTP is always served over tcp, whatever transport was declared.
        let (address, protocol) = cfg.listen_address().map_err(wrap)?;
        if protocol != Protocol::Tcp {
            tracing::info!(entry_point = %name, %protocol, "serving HTTP over tcp");
        }

        let tls = certificates
            .map(|provider| provider.server_config().map(TlsAcceptor::from))
            .transpose()
            .map_err(wrap)?;

        let switcher = Arc::new(HandlerSwitcher::new(router));
        let forwarded =
            ForwardedHeaders::new(switcher.clone(), &cfg.forwarded_headers).map_err(wrap)?;
        let root: SharedHandler = Arc::new(Recovery::new(Arc::new(forwarded)));

        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| GatewayError::Bind {
                address: address.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let responding = &cfg.transport.responding_timeouts;
        let timeouts = Timeouts {
            header_read: responding
                .read_timeout
                .filter(|d| !d.is_zero())
                .unwrap_or_else(|| responding.idle()),
            write: responding.write_timeout.filter(|d| !d.is_zero()),
        };

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            name: name.to_string(),
            local_addr,
            listener: Mutex::new(Some(listener)),
            accept_task: Mutex::new(None),
            switcher,
            root,
            tls,
            life_cycle: cfg.transport.life_cycle.clone(),
            timeouts,
            tracker: ConnectionTracker::new(),
            shutdown,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Open connections right now.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.tracker.len()
    }

    /// Start accepting. Calling it again is a no-op.
    pub fn start(&self) {
        let Some(listener) = self.listener.lock().take() else {
            return;
        };
        let span = tracing::info_span!("entry_point", entry_point = %self.name);
        let ctx = AcceptContext {
            root: self.root.clone(),
            tls: self.tls.clone(),
            timeouts: self.timeouts,
            tracker: self.tracker.clone(),
            shutdown: self.shutdown.subscribe(),
        };
        tracing::info!(
            entry_point = %self.name,
            address = %self.local_addr,
            tls = self.tls.is_some(),
            "entry point listening"
        );
        let task = tokio::spawn(accept_loop(listener, ctx).instrument(span));
        *self.accept_task.lock() = Some(task);
    }

    /// Stop accepting and drain.
    ///
    /// Connections are still accepted during the request-accept grace
    /// period. After it the listener closes, idle connections are closed and
    /// in-flight requests get the grace timeout to finish. Whatever is left
    /// then is closed by force.
    pub async fn shutdown(&self) {
        let accept_grace = self.life_cycle.accept_grace();
        if !accept_grace.is_zero() {
            tracing::info!(
                entry_point = %self.name,
                grace = %crate::config::duration::format(accept_grace),
                "waiting for incoming requests to cease"
            );
            tokio::time::sleep(accept_grace).await;
        }

        let grace = self.life_cycle.grace();
        tracing::debug!(
            entry_point = %self.name,
            grace = %crate::config::duration::format(grace),
            "waiting before killing connections"
        );
        let deadline = Instant::now() + grace;

        let _ = self.shutdown.send(true);
        self.listener.lock().take();
        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                tracing::error!(entry_point = %self.name, error = %e, "accept loop failed");
            }
        }

        match self.tracker.shutdown(deadline, std::future::pending()).await {
            Ok(()) => {}
            Err(GatewayError::DeadlineExceeded) => {
                tracing::debug!(
                    entry_point = %self.name,
                    remaining = self.tracker.len(),
                    "connections not drained within deadline, closing them"
                );
                self.tracker.close();
            }
            Err(e) => {
                tracing::error!(entry_point = %self.name, error = %e, "drain failed");
                self.tracker.close();
            }
        }
    }

    /// Replace the router. `None` leaves the current one in place.
    pub fn switch_router(&self, router: Option<SharedHandler>) {
        if let Some(router) = router {
            self.switcher.update(router);
            tracing::debug!(entry_point = %self.name, "router switched");
        }
    }
}

struct AcceptContext {
    root: SharedHandler,
    tls: Option<TlsAcceptor>,
    timeouts: Timeouts,
    tracker: Arc<ConnectionTracker>,
    shutdown: watch::Receiver<bool>,
}

async fn accept_loop(listener: TcpListener, mut ctx: AcceptContext) {
    loop {
        tokio::select! {
            _ = ctx.shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let conn = Connection {
                        root: ctx.root.clone(),
                        tls: ctx.tls.clone(),
                        timeouts: ctx.timeouts,
                        shutdown: ctx.shutdown.clone(),
                    };
                    let span = tracing::debug_span!("connection", peer = %peer);
                    let id = ctx.tracker.spawn(conn.serve(stream, peer).instrument(span));
                    tracing::trace!(conn_id = id, peer = %peer, "connection accepted");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    tracing::debug!("listener closed");
}

struct Connection {
    root: SharedHandler,
    tls: Option<TlsAcceptor>,
    timeouts: Timeouts,
    shutdown: watch::Receiver<bool>,
}

impl Connection {
    async fn serve(mut self, stream: TcpStream, peer: SocketAddr) {
        let limit = self.timeouts.header_read;
        let mut first = [0u8; 1];
        let peeked = tokio::select! {
            _ = self.shutdown.changed() => return,
            peeked = tokio::time::timeout(limit, stream.peek(&mut first)) => peeked,
        };
        let is_tls = match peeked {
            Ok(Ok(n)) if n > 0 => first[0] == TLS_RECORD_HANDSHAKE,
            Ok(Ok(_)) => return,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "failed to read from connection");
                return;
            }
            Err(_) => {
                tracing::debug!("connection idle before first byte, closing");
                return;
            }
        };

        if !is_tls {
            let info = ConnectionInfo { peer, tls: false };
            self.serve_http(TokioIo::new(stream), info).await;
            return;
        }

        let Some(acceptor) = self.tls.clone() else {
            tracing::debug!("TLS handshake on a plaintext entry point, closing");
            return;
        };
        match tokio::time::timeout(limit, acceptor.accept(stream)).await {
            Ok(Ok(stream)) => {
                let info = ConnectionInfo { peer, tls: true };
                self.serve_http(TokioIo::new(stream), info).await;
            }
            Ok(Err(e)) => tracing::debug!(error = %e, "TLS handshake failed"),
            Err(_) => tracing::debug!("TLS handshake timed out"),
        }
    }

    async fn serve_http<I>(mut self, io: I, info: ConnectionInfo)
    where
        I: Read + Write + Unpin + Send + 'static,
    {
        let root = self.root.clone();
        let write_timeout = self.timeouts.write;
        let service = service_fn(move |req: http::Request<Incoming>| {
            let root = root.clone();
            async move { dispatch(root, req, info, write_timeout).await }
        });

        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .keep_alive(true)
            .header_read_timeout(self.timeouts.header_read);
        let conn = builder.serve_connection(io, service);
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = self.shutdown.changed() => {
                conn.as_mut().graceful_shutdown();
                conn.as_mut().await
            }
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "connection closed with error");
        }
    }
}

async fn dispatch(
    root: SharedHandler,
    req: http::Request<Incoming>,
    info: ConnectionInfo,
    write_timeout: Option<Duration>,
) -> Result<Response, HandlerError> {
    let (mut parts, body) = req.into_parts();
    parts.extensions.insert(info);
    let request_id = ensure_request_id(&mut parts.headers);
    let span = tracing::debug_span!(
        "request",
        request_id = ?request_id,
        method = %parts.method,
        uri = %parts.uri,
    );
    let req = Request::from_parts(parts, Body::new(body));

    let handled = root.handle(req).instrument(span);
    let result = match write_timeout {
        Some(limit) => match tokio::time::timeout(limit, handled).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(request_id = ?request_id, "request exceeded write timeout");
                return Ok(text_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout"));
            }
        },
        None => handled.await,
    };

    let mut resp = match result {
        Ok(resp) => resp,
        // The client is gone: hyper drops the connection without a response.
        Err(HandlerError::Aborted) => return Err(HandlerError::Aborted),
        Err(e) => {
            tracing::error!(request_id = ?request_id, error = %e, "unhandled request failure");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    };
    resp.headers_mut()
        .entry(REQUEST_ID_HEADER)
        .or_insert(request_id);
    Ok(resp)
}

/// Keep the caller's request id, or assign a fresh one.
fn ensure_request_id(headers: &mut http::HeaderMap) -> HeaderValue {
    if let Some(existing) = headers.get(REQUEST_ID_HEADER) {
        return existing.clone();
    }
    let generated = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("unknown"));
    headers.insert(REQUEST_ID_HEADER, generated.clone());
    generated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::EntryPointTransport;
    use crate::middleware::handler_fn;
    use crate::middleware::test_support::echo;

    fn local(grace_ms: u64) -> EntryPointConfig {
        EntryPointConfig {
            address: Some("127.0.0.1:0".into()),
            transport: EntryPointTransport {
                life_cycle: LifeCycle {
                    request_accept_grace_timeout: None,
                    grace_timeout: Some(Duration::from_millis(grace_ms)),
                },
                ..EntryPointTransport::default()
            },
            ..EntryPointConfig::default()
        }
    }

    #[tokio::test]
    async fn udp_entry_point_serves_http_over_tcp() {
        let cfg = EntryPointConfig {
            address: Some("127.0.0.1:0/udp".into()),
            ..EntryPointConfig::default()
        };
        let ep = EntryPoint::bind("dns", &cfg, echo(), None).await.unwrap();
        ep.start();

        let resp = reqwest::get(format!("http://{}/q", ep.local_addr())).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["x-echo-uri"], "/q");
        drop(resp);

        ep.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_protocol_is_rejected() {
        let cfg = EntryPointConfig {
            address: Some("127.0.0.1:0/sctp".into()),
            ..EntryPointConfig::default()
        };
        let err = EntryPoint::bind("x", &cfg, echo(), None).await.err().unwrap();
        assert!(matches!(
            err,
            GatewayError::EntryPoint {
                source: ConfigError::InvalidProtocol(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn aborted_request_gets_no_response() {
        let aborted = handler_fn(|_req: Request| async { Err(HandlerError::Aborted) });
        let ep = EntryPoint::bind("web", &local(100), aborted, None).await.unwrap();
        ep.start();

        let result = reqwest::get(format!("http://{}/", ep.local_addr())).await;
        assert!(result.is_err(), "{result:?}");

        ep.shutdown().await;
    }

    #[test]
    fn request_id_is_kept_or_generated() {
        let mut headers = http::HeaderMap::new();
        let generated = ensure_request_id(&mut headers);
        assert_eq!(generated.len(), 36);
        assert_eq!(headers[REQUEST_ID_HEADER], generated);

        let mut headers = http::HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, "abc".parse().unwrap());
        assert_eq!(ensure_request_id(&mut headers), "abc");
    }

    #[tokio::test]
    async fn serves_and_switches_router() {
        let ep = EntryPoint::bind("web", &local(100), echo(), None).await.unwrap();
        ep.start();
        let base = format!("http://{}", ep.local_addr());

        let resp = reqwest::get(format!("{base}/hello?x=1")).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["x-echo-uri"], "/hello?x=1");
        assert!(resp.headers().contains_key(REQUEST_ID_HEADER));

        ep.switch_router(None);
        ep.switch_router(Some(handler_fn(|_req: Request| async {
            Ok(text_response(StatusCode::IM_A_TEAPOT, "switched"))
        })));
        let resp = reqwest::get(format!("{base}/hello")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::IM_A_TEAPOT.as_u16());
        drop(resp);

        ep.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_force_closes_stuck_connections() {
        let stuck = handler_fn(|_req: Request| async {
            std::future::pending::<()>().await;
            Ok(text_response(StatusCode::OK, "unreachable"))
        });
        let ep = Arc::new(EntryPoint::bind("web", &local(50), stuck, None).await.unwrap());
        ep.start();
        let url = format!("http://{}/", ep.local_addr());

        let client = tokio::spawn(async move { reqwest::get(url).await });
        while ep.connections() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let start = std::time::Instant::now();
        ep.shutdown().await;
        assert!(start.elapsed() < Duration::from_millis(500), "{:?}", start.elapsed());
        assert_eq!(ep.connections(), 0);
        assert!(client.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn idle_entry_point_shuts_down_quickly() {
        let ep = EntryPoint::bind("web", &local(10_000), echo(), None).await.unwrap();
        ep.start();
        let resp = reqwest::get(format!("http://{}/", ep.local_addr())).await.unwrap();
        assert_eq!(resp.status(), 200);
        drop(resp);

        let start = std::time::Instant::now();
        ep.shutdown().await;
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
