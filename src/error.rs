//! Unified error types for Gatehouse.
//!
//! [`GatewayError`] is the top-level error returned by commands and the
//! lifecycle layer. [`ConfigError`] covers construction-time failures of
//! entry points and middleware, [`TransportError`] classifies per-request
//! backend failures, [`HandlerError`] is the failure channel of the handler
//! chain, and [`ValidationError`] is one finding of config-file validation.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub scope: String,
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "  {}: {}: {}", self.scope, self.field, self.message)?;
        if let Some(ref suggestion) = self.suggestion {
            write!(f, " ({suggestion})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

fn format_errors(errors: &[ValidationError]) -> String {
    use std::fmt::Write;
    let mut buf = String::new();
    for (i, e) in errors.iter().enumerate() {
        if i > 0 {
            buf.push('\n');
        }
        let _ = write!(buf, "{e}");
    }
    buf
}

/// Raised while turning configuration into live components. Prevents the
/// affected entry point (or the whole process) from starting.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("invalid protocol '{0}' (expected tcp or udp)")]
    InvalidProtocol(String),

    #[error("invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("{middleware}: {field} cannot be empty")]
    MissingField {
        middleware: &'static str,
        field: &'static str,
    },

    #[error("error compiling regular expression {pattern}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("retry: attempts must be greater than zero (got {0})")]
    InvalidAttempts(i64),

    #[error("ambiguous middleware configuration: {0}")]
    Ambiguous(String),

    #[error("invalid trusted IP '{0}'")]
    InvalidTrustedIp(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),
}

/// Failure of a single request/response exchange with a backend.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("backend connection closed unexpectedly")]
    UnexpectedEof,

    #[error("request cancelled by client")]
    Cancelled,

    #[error("backend timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("timed out connecting to backend")]
    ConnectTimeout,

    #[error("failed to connect to backend: {0}")]
    Connect(String),

    #[error("request has no upstream authority")]
    MissingAuthority,

    #[error("failed to read request body from client: {0}")]
    RequestBody(String),

    #[error("backend request failed: {0}")]
    Other(String),
}

impl TransportError {
    /// True when the backend never saw the request, so replaying it is safe.
    #[must_use]
    pub const fn is_connect(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::ConnectTimeout | Self::MissingAuthority
        )
    }
}

/// Explicit failure channel of the handler chain. Panics inside handlers are
/// turned into `Internal` by the recovery boundary.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HandlerError {
    /// The client went away; no response should be written.
    #[error("client closed the connection")]
    Aborted,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("Config file not found: {}", path.display())]
    ConfigFileNotFound { path: PathBuf },

    #[error("Config parse error in {path}:\n  {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Config validation failed:\n{}", format_errors(.errors))]
    ConfigValidation { errors: Vec<ValidationError> },

    #[error("Unsupported config format: '{0}'")]
    UnsupportedFormat(String),

    #[error("entry point '{entry_point}': {source}")]
    EntryPoint {
        entry_point: String,
        #[source]
        source: ConfigError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("round tripper not found: '{0}'")]
    NotFound(String),

    #[error("deadline exceeded while draining connections")]
    DeadlineExceeded,

    #[error("drain cancelled")]
    Cancelled,

    #[error("{0}")]
    Io(#[from] std::io::Error),
}
