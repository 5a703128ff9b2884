//! Circuit breaker extension point.
//!
//! Accepts the `expression` setting so configurations stay loadable, but
//! never trips: every request goes straight to the next handler.

use async_trait::async_trait;

use super::{Handler, Request, Response, SharedHandler};
use crate::config::model::CircuitBreakerConfig;
use crate::error::HandlerError;

pub struct CircuitBreaker {
    next: SharedHandler,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(next: SharedHandler, cfg: &CircuitBreakerConfig) -> Self {
        if !cfg.expression.is_empty() {
            tracing::debug!(
                expression = %cfg.expression,
                "circuit breaker expression ignored, breaker is pass-through"
            );
        }
        Self { next }
    }
}

#[async_trait]
impl Handler for CircuitBreaker {
    async fn handle(&self, req: Request) -> Result<Response, HandlerError> {
        self.next.handle(req).await
    }
}
