//! Hot-swappable root handler of an entry point.
//!
//! [`HandlerSwitcher::dispatch`] clones the current handler under a read
//! lock and runs it after the lock is released, so an [`update`] never
//! blocks on in-flight requests and a request never sees a mix of old and
//! new chains.
//!
//! [`update`]: HandlerSwitcher::update

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{Handler, Request, Response, SharedHandler};
use crate::error::HandlerError;

pub struct HandlerSwitcher {
    current: RwLock<SharedHandler>,
}

impl HandlerSwitcher {
    #[must_use]
    pub fn new(initial: SharedHandler) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    /// Snapshot of the handler new requests are dispatched to.
    #[must_use]
    pub fn current(&self) -> SharedHandler {
        Arc::clone(&self.current.read())
    }

    pub fn update(&self, handler: SharedHandler) {
        *self.current.write() = handler;
    }

    pub async fn dispatch(&self, req: Request) -> Result<Response, HandlerError> {
        let handler = self.current();
        handler.handle(req).await
    }
}

#[async_trait]
impl Handler for HandlerSwitcher {
    async fn handle(&self, req: Request) -> Result<Response, HandlerError> {
        self.dispatch(req).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::StatusCode;

    use super::*;
    use crate::middleware::handler_fn;
    use crate::middleware::test_support::request;

    fn status_handler(status: StatusCode) -> SharedHandler {
        handler_fn(move |_req| async move {
            Ok(http::Response::builder()
                .status(status)
                .body(axum::body::Body::empty())
                .unwrap())
        })
    }

    #[tokio::test]
    async fn update_replaces_handler() {
        let switcher = HandlerSwitcher::new(status_handler(StatusCode::OK));
        assert_eq!(switcher.dispatch(request("/")).await.unwrap().status(), StatusCode::OK);
        switcher.update(status_handler(StatusCode::ACCEPTED));
        assert_eq!(
            switcher.dispatch(request("/")).await.unwrap().status(),
            StatusCode::ACCEPTED
        );
    }

    #[tokio::test]
    async fn in_flight_request_keeps_old_handler() {
        let slow = handler_fn(|_req| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(http::Response::builder()
                .status(StatusCode::OK)
                .body(axum::body::Body::empty())
                .unwrap())
        });
        let switcher = Arc::new(HandlerSwitcher::new(slow));

        let in_flight = {
            let switcher = Arc::clone(&switcher);
            tokio::spawn(async move { switcher.dispatch(request("/")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        switcher.update(status_handler(StatusCode::IM_A_TEAPOT));

        assert_eq!(in_flight.await.unwrap().unwrap().status(), StatusCode::OK);
        assert_eq!(
            switcher.dispatch(request("/")).await.unwrap().status(),
            StatusCode::IM_A_TEAPOT
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reads_see_a_complete_handler() {
        let switcher = Arc::new(HandlerSwitcher::new(status_handler(StatusCode::OK)));

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let switcher = Arc::clone(&switcher);
                tokio::spawn(async move {
                    for _ in 0..200 {
                        let status = switcher.dispatch(request("/")).await.unwrap().status();
                        assert!(status == StatusCode::OK || status == StatusCode::CREATED);
                    }
                })
            })
            .collect();

        switcher.update(status_handler(StatusCode::CREATED));

        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(
            switcher.dispatch(request("/")).await.unwrap().status(),
            StatusCode::CREATED
        );
    }
}
