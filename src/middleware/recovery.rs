//! Fault boundary of an entry point.
//!
//! The downstream chain runs in its own task so a panic surfaces as a
//! `JoinError` instead of tearing down the connection task. Panics and
//! internal errors become a plain 500. A client abort produces no response
//! at all: the error is handed back to the server, which drops the
//! connection. Dropping the boundary (client went away) aborts the
//! downstream task.

use std::any::Any;

use async_trait::async_trait;
use http::StatusCode;
use tokio::task::AbortHandle;

use super::{text_response, Handler, Request, Response, SharedHandler};
use crate::error::HandlerError;

pub struct Recovery {
    next: SharedHandler,
}

impl Recovery {
    #[must_use]
    pub fn new(next: SharedHandler) -> Self {
        Self { next }
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn internal_error() -> Response {
    text_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        StatusCode::INTERNAL_SERVER_ERROR
            .canonical_reason()
            .unwrap_or("Internal Server Error"),
    )
}

#[async_trait]
impl Handler for Recovery {
    async fn handle(&self, req: Request) -> Result<Response, HandlerError> {
        let method = req.method().clone();
        let uri = req.uri().clone();
        let next = self.next.clone();

        let task = tokio::spawn(async move { next.handle(req).await });
        let _guard = AbortOnDrop(task.abort_handle());

        match task.await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(HandlerError::Aborted)) => {
                tracing::debug!(method = %method, uri = %uri, "request aborted by client");
                Err(HandlerError::Aborted)
            }
            Ok(Err(e)) => {
                tracing::error!(method = %method, uri = %uri, error = %e, "handler failed");
                Ok(internal_error())
            }
            Err(join) if join.is_panic() => {
                let payload = join.into_panic();
                tracing::error!(
                    method = %method,
                    uri = %uri,
                    panic = panic_message(payload.as_ref()),
                    "recovered from panic in handler"
                );
                Ok(internal_error())
            }
            Err(_) => {
                tracing::debug!(method = %method, uri = %uri, "handler task cancelled");
                Err(HandlerError::Aborted)
            }
        }
    }
}
