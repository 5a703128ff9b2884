//! Points the request at a fixed backend by rewriting scheme and authority.
//!
//! The original host (authority of an absolute-form request, otherwise the
//! `Host` header) is recorded in `X-Replaced-Host` on the forwarded request
//! and on the response.

use async_trait::async_trait;
use http::uri::{Authority, Scheme, Uri};
use http::{header, HeaderValue};

use super::{Handler, Request, Response, SharedHandler};
use crate::config::model::ReplaceHostConfig;
use crate::error::{ConfigError, HandlerError};

pub const REPLACED_HOST_HEADER: &str = "x-replaced-host";

pub struct ReplaceHost {
    next: SharedHandler,
    scheme: Scheme,
    authority: Authority,
}

impl ReplaceHost {
    pub fn new(next: SharedHandler, cfg: &ReplaceHostConfig) -> Result<Self, ConfigError> {
        if cfg.host.is_empty() {
            return Err(ConfigError::MissingField {
                middleware: "replaceHost",
                field: "host",
            });
        }
        let scheme = match cfg.scheme.as_str() {
            "" | "http" => Scheme::HTTP,
            "https" => Scheme::HTTPS,
            other => {
                return Err(ConfigError::InvalidAddress {
                    address: format!("{other}://{}", cfg.host),
                    reason: format!("unsupported scheme '{other}'"),
                })
            }
        };
        let authority = cfg
            .host
            .parse::<Authority>()
            .map_err(|e| ConfigError::InvalidAddress {
                address: cfg.host.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            next,
            scheme,
            authority,
        })
    }
}

#[async_trait]
impl Handler for ReplaceHost {
    async fn handle(&self, mut req: Request) -> Result<Response, HandlerError> {
        let original: Option<HeaderValue> = req
            .uri()
            .authority()
            .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            .or_else(|| req.headers().get(header::HOST).cloned());

        let mut parts = req.uri().clone().into_parts();
        parts.scheme = Some(self.scheme.clone());
        parts.authority = Some(self.authority.clone());
        if parts.path_and_query.is_none() {
            parts.path_and_query = Some(http::uri::PathAndQuery::from_static("/"));
        }
        *req.uri_mut() = Uri::from_parts(parts).map_err(|e| HandlerError::Internal(e.to_string()))?;

        if let Some(ref value) = original {
            req.headers_mut().append(REPLACED_HOST_HEADER, value.clone());
        }

        let mut resp = self.next.handle(req).await?;
        if let Some(value) = original {
            resp.headers_mut().insert(REPLACED_HOST_HEADER, value);
        }
        Ok(resp)
    }
}
