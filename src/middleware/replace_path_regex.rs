//! Rewrites the request path through a regular expression.
//!
//! Paths that do not match, and an empty replacement, leave the request
//! untouched.

use async_trait::async_trait;
use http::{HeaderValue, StatusCode};
use regex::Regex;

use super::path::{path_unescape, with_path, REPLACED_PATH_HEADER};
use super::{text_response, Handler, Request, Response, SharedHandler};
use crate::config::model::ReplacePathRegexConfig;
use crate::error::{ConfigError, HandlerError};

pub struct ReplacePathRegex {
    next: SharedHandler,
    regex: Regex,
    replacement: String,
}

impl ReplacePathRegex {
    pub fn new(next: SharedHandler, cfg: &ReplacePathRegexConfig) -> Result<Self, ConfigError> {
        let pattern = cfg.regex.trim();
        if pattern.is_empty() {
            return Err(ConfigError::MissingField {
                middleware: "replacePathRegex",
                field: "regex",
            });
        }
        let regex = Regex::new(pattern).map_err(|source| ConfigError::InvalidRegex {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            next,
            regex,
            replacement: cfg.replacement.trim().to_string(),
        })
    }
}

#[async_trait]
impl Handler for ReplacePathRegex {
    async fn handle(&self, mut req: Request) -> Result<Response, HandlerError> {
        let current = req.uri().path().to_string();
        if self.replacement.is_empty() || !self.regex.is_match(&current) {
            return self.next.handle(req).await;
        }

        if let Ok(value) = HeaderValue::from_str(&current) {
            req.headers_mut().append(REPLACED_PATH_HEADER, value);
        }
        let rewritten = self.regex.replace_all(&current, self.replacement.as_str());

        // the replacement may introduce escapes
        let uri = path_unescape(&rewritten).and_then(|_| with_path(req.uri(), &rewritten));
        match uri {
            Ok(uri) => *req.uri_mut() = uri,
            Err(e) => {
                tracing::error!(path = %rewritten, error = %e, "cannot rewrite path");
                return Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
            }
        }

        self.next.handle(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::test_support::{echo, echoed_uri, request};

    fn rewrite(regex: &str, replacement: &str) -> ReplacePathRegex {
        ReplacePathRegex::new(
            echo(),
            &ReplacePathRegexConfig {
                regex: regex.into(),
                replacement: replacement.into(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn rewrites_with_capture_groups() {
        let resp = rewrite("^/old/(.*)", "/new/$1")
            .handle(request("/old/42"))
            .await
            .unwrap();
        assert_eq!(echoed_uri(&resp), "/new/42");
        assert_eq!(resp.headers()["x-replaced-path"], "/old/42");
    }

    #[tokio::test]
    async fn no_match_is_a_no_op() {
        let resp = rewrite("^/old/(.*)", "/new/$1")
            .handle(request("/other/42"))
            .await
            .unwrap();
        assert_eq!(echoed_uri(&resp), "/other/42");
        assert!(resp.headers().get("x-replaced-path").is_none());
    }

    #[tokio::test]
    async fn empty_replacement_is_a_no_op() {
        let resp = rewrite("^/old", "  ").handle(request("/old/1")).await.unwrap();
        assert_eq!(echoed_uri(&resp), "/old/1");
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let err = ReplacePathRegex::new(
            echo(),
            &ReplacePathRegexConfig {
                regex: "([".into(),
                replacement: "/x".into(),
            },
        )
        .err()
        .unwrap();
        assert!(matches!(err, ConfigError::InvalidRegex { .. }));
    }
}
