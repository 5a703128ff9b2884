//! Terminal handler forwarding requests to their backend.
//!
//! The [`ReverseProxy`] normalizes the outgoing request, sends it through
//! the round tripper named by its entry point and streams the backend
//! response back. Transport failures become plain-text error responses:
//!
//! | failure                     | status |
//! |-----------------------------|--------|
//! | connection closed early     | 502    |
//! | client went away            | 499    |
//! | connect or response timeout | 504    |
//! | connect / I/O error         | 502    |
//! | anything else               | 500    |
//!
//! A request body that fails to arrive means the client is gone: no
//! response is written and [`HandlerError::Aborted`] is returned instead.

pub mod headers;

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::StatusCode;

use crate::error::{HandlerError, TransportError};
use crate::middleware::{text_response, Handler, Request, Response};
use crate::transport::manager::RoundTripperManager;

/// Non-standard status for requests abandoned by the client.
pub const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;

pub struct ReverseProxy {
    manager: Arc<RoundTripperManager>,
    transport: String,
}

impl ReverseProxy {
    #[must_use]
    pub fn new(manager: Arc<RoundTripperManager>, transport: impl Into<String>) -> Self {
        Self {
            manager,
            transport: transport.into(),
        }
    }
}

#[async_trait]
impl Handler for ReverseProxy {
    async fn handle(&self, req: Request) -> Result<Response, HandlerError> {
        // Resolved per request so a reloaded transport is picked up.
        let round_tripper = self
            .manager
            .get(&self.transport)
            .map_err(|e| HandlerError::Internal(e.to_string()))?;

        let method = req.method().clone();
        let uri = req.uri().clone();
        let result = match direct(req) {
            Ok(req) => round_tripper.round_trip(req).await,
            Err(e) => Err(e),
        };

        match result {
            Err(TransportError::RequestBody(e)) => {
                tracing::debug!(%method, %uri, error = %e, "client request body failed");
                Err(HandlerError::Aborted)
            }
            Ok(resp) => {
                let (mut parts, body) = resp.into_parts();
                headers::strip_hop_by_hop(&mut parts.headers);
                Ok(Response::from_parts(parts, Body::new(body)))
            }
            Err(e) => {
                let status = status_for(&e);
                tracing::debug!(
                    %method,
                    %uri,
                    status = status.as_u16(),
                    error = %e,
                    "forwarding failed"
                );
                Ok(text_response(status, status_text(status)))
            }
        }
    }
}

/// Prepare a request for the backend: it must carry an absolute target,
/// hop-by-hop headers are dropped and `Host` names the backend.
fn direct(mut req: Request) -> Result<Request, TransportError> {
    let Some(authority) = req.uri().authority().cloned() else {
        return Err(TransportError::MissingAuthority);
    };
    if req.uri().scheme().is_none() {
        return Err(TransportError::MissingAuthority);
    }
    headers::strip_hop_by_hop(req.headers_mut());
    headers::rewrite_host(req.headers_mut(), &authority);
    Ok(req)
}

fn status_for(err: &TransportError) -> StatusCode {
    match err {
        TransportError::UnexpectedEof => StatusCode::BAD_GATEWAY,
        TransportError::Cancelled => client_closed_request(),
        TransportError::Timeout(_) | TransportError::ConnectTimeout => {
            StatusCode::GATEWAY_TIMEOUT
        }
        TransportError::Connect(_) | TransportError::MissingAuthority => StatusCode::BAD_GATEWAY,
        TransportError::RequestBody(_) => client_closed_request(),
        TransportError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn client_closed_request() -> StatusCode {
    StatusCode::from_u16(STATUS_CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
}

fn status_text(status: StatusCode) -> &'static str {
    if status.as_u16() == STATUS_CLIENT_CLOSED_REQUEST {
        "Client Closed Request"
    } else {
        status.canonical_reason().unwrap_or("Unknown Status")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::test_support::{broken_body, request};
    use http_body_util::BodyExt;
    use tokio::io::AsyncReadExt;

    #[test]
    fn classifies_transport_errors() {
        assert_eq!(status_for(&TransportError::UnexpectedEof), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(&TransportError::Cancelled).as_u16(), 499);
        assert_eq!(
            status_for(&TransportError::Timeout("response headers")),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(status_for(&TransportError::ConnectTimeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_for(&TransportError::Connect("refused".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&TransportError::Other("protocol".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(status_text(client_closed_request()), "Client Closed Request");
    }

    #[tokio::test]
    async fn relative_target_is_a_bad_gateway() {
        let proxy = ReverseProxy::new(Arc::new(RoundTripperManager::new()), "");
        let resp = proxy.handle(request("/no/host")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Bad Gateway");
    }

    #[tokio::test]
    async fn unknown_transport_is_an_internal_error() {
        let proxy = ReverseProxy::new(Arc::new(RoundTripperManager::new()), "missing");
        let err = proxy.handle(request("http://backend/")).await.unwrap_err();
        assert!(matches!(err, HandlerError::Internal(_)));
    }

    #[test]
    fn director_rewrites_host_and_strips_hop_by_hop() {
        let mut req = request("http://backend:8080/a?b=1");
        req.headers_mut().insert("connection", "close".parse().unwrap());
        let req = direct(req).unwrap();
        assert_eq!(req.headers()["host"], "backend:8080");
        assert!(req.headers().get("connection").is_none());
        assert_eq!(req.uri().to_string(), "http://backend:8080/a?b=1");
    }

    #[tokio::test]
    async fn failing_client_body_aborts_without_response() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let backend = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            while socket.read(&mut buf).await.is_ok_and(|n| n > 0) {}
        });

        let proxy = ReverseProxy::new(Arc::new(RoundTripperManager::new()), "");
        let req = http::Request::builder()
            .method("POST")
            .uri(format!("http://{addr}/upload"))
            .body(broken_body(10))
            .unwrap();
        let result = proxy.handle(req).await;
        assert!(matches!(result, Err(HandlerError::Aborted)), "{result:?}");
        backend.abort();
    }
}
