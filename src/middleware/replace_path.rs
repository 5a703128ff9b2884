//! Replaces the whole request path with a fixed value.

use async_trait::async_trait;
use http::{HeaderValue, StatusCode};

use super::path::{path_unescape, with_path, REPLACED_PATH_HEADER};
use super::{text_response, Handler, Request, Response, SharedHandler};
use crate::config::model::ReplacePathConfig;
use crate::error::HandlerError;

pub struct ReplacePath {
    next: SharedHandler,
    path: String,
}

impl ReplacePath {
    #[must_use]
    pub fn new(next: SharedHandler, cfg: &ReplacePathConfig) -> Self {
        Self {
            next,
            path: cfg.path.clone(),
        }
    }
}

#[async_trait]
impl Handler for ReplacePath {
    async fn handle(&self, mut req: Request) -> Result<Response, HandlerError> {
        let original = req.uri().path().to_string();
        if let Ok(value) = HeaderValue::from_str(&original) {
            req.headers_mut().append(REPLACED_PATH_HEADER, value);
        }

        if let Err(e) = path_unescape(&self.path) {
            tracing::error!(path = %self.path, error = %e, "cannot unescape replacement path");
            return Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
        }
        match with_path(req.uri(), &self.path) {
            Ok(uri) => *req.uri_mut() = uri,
            Err(e) => {
                tracing::error!(path = %self.path, error = %e, "cannot rewrite path");
                return Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
            }
        }

        self.next.handle(req).await
    }
}
