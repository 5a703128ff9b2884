//! Prepends a fixed prefix to the request path.
//!
//! The prefix is added unconditionally: a path that already starts with it
//! gets it twice.

use async_trait::async_trait;

use super::path::{ensure_leading_slash, with_path};
use super::{Handler, Request, Response, SharedHandler};
use crate::config::model::AddPrefixConfig;
use crate::error::{ConfigError, HandlerError};

pub struct AddPrefix {
    next: SharedHandler,
    prefix: String,
}

impl AddPrefix {
    pub fn new(next: SharedHandler, cfg: &AddPrefixConfig) -> Result<Self, ConfigError> {
        if cfg.prefix.is_empty() {
            return Err(ConfigError::MissingField {
                middleware: "addPrefix",
                field: "prefix",
            });
        }
        Ok(Self {
            next,
            prefix: cfg.prefix.clone(),
        })
    }
}

#[async_trait]
impl Handler for AddPrefix {
    async fn handle(&self, mut req: Request) -> Result<Response, HandlerError> {
        let old = req.uri().path().to_string();
        let new = ensure_leading_slash(&format!("{}{old}", self.prefix));
        *req.uri_mut() =
            with_path(req.uri(), &new).map_err(|e| HandlerError::Internal(e.to_string()))?;
        tracing::debug!(path = %new, was = %old, "prefix added");
        self.next.handle(req).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::middleware::test_support::{echo, echoed_uri, request};

    fn add_prefix(prefix: &str, next: SharedHandler) -> SharedHandler {
        Arc::new(
            AddPrefix::new(
                next,
                &AddPrefixConfig {
                    prefix: prefix.into(),
                },
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn prepends_prefix() {
        let handler = add_prefix("/api", echo());
        let resp = handler.handle(request("/users?page=2")).await.unwrap();
        assert_eq!(echoed_uri(&resp), "/api/users?page=2");
    }

    #[tokio::test]
    async fn adds_missing_leading_slash() {
        let handler = add_prefix("api", echo());
        let resp = handler.handle(request("/users")).await.unwrap();
        assert_eq!(echoed_uri(&resp), "/api/users");
    }

    #[tokio::test]
    async fn applying_twice_double_prepends() {
        let handler = add_prefix("/api", add_prefix("/api", echo()));
        let resp = handler.handle(request("/users")).await.unwrap();
        assert_eq!(echoed_uri(&resp), "/api/api/users");
    }

    #[test]
    fn empty_prefix_is_rejected() {
        assert!(AddPrefix::new(echo(), &AddPrefixConfig::default()).is_err());
    }
}
