//! Serde data structures for the Gatehouse configuration file.
//!
//! [`Config`] is the root. Entry points, servers transports and the
//! middleware block all use camelCase keys and `deny_unknown_fields` for
//! strict parsing. Durations go through [`super::duration`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::tls::{CertificateConfig, FileOrContent};
use crate::transport::DEFAULT_TRANSPORT;

pub const DEFAULT_GRACE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_RETRY_BODY_LIMIT: usize = 1_048_576;

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Config {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub entry_points: BTreeMap<String, EntryPointConfig>,

    /// Settings of the reserved default transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers_transport: Option<ServersTransportConfig>,

    /// Additional named transports, selected per entry point.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub servers_transports: BTreeMap<String, ServersTransportConfig>,

    #[serde(default, skip_serializing_if = "MiddlewareConfig::is_empty")]
    pub middleware: MiddlewareConfig,
}

impl Config {
    /// Every transport the round-tripper manager should hold, the default one
    /// included.
    #[must_use]
    pub fn transport_configs(&self) -> HashMap<String, ServersTransportConfig> {
        let mut map: HashMap<String, ServersTransportConfig> = self
            .servers_transports
            .iter()
            .map(|(name, cfg)| (name.clone(), cfg.clone()))
            .collect();
        map.insert(
            DEFAULT_TRANSPORT.to_string(),
            self.servers_transport.clone().unwrap_or_default(),
        );
        map
    }

    /// Middleware block in effect for one entry point.
    #[must_use]
    pub fn middleware_for<'a>(&'a self, entry_point: &'a EntryPointConfig) -> &'a MiddlewareConfig {
        entry_point.middleware.as_ref().unwrap_or(&self.middleware)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            _ => Err(ConfigError::InvalidProtocol(s.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct EntryPointConfig {
    /// `host:port` or `:port`, optionally suffixed with `/tcp` or `/udp`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Name of the transport used to reach backends. Empty means default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers_transport: Option<String>,

    #[serde(default)]
    pub transport: EntryPointTransport,

    #[serde(default)]
    pub forwarded_headers: ForwardedHeadersConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<EntryPointTls>,

    /// Overrides the global middleware block for this entry point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middleware: Option<MiddlewareConfig>,
}

impl EntryPointConfig {
    /// Resolve the socket address to bind and the protocol to speak.
    pub fn listen_address(&self) -> Result<(String, Protocol), ConfigError> {
        if let Some(ref address) = self.address {
            let (addr, proto) = match address.rsplit_once('/') {
                Some((addr, proto)) => (addr, proto),
                None => (address.as_str(), self.protocol.as_deref().unwrap_or("tcp")),
            };
            let protocol: Protocol = proto.parse()?;
            if addr.is_empty() {
                return Err(ConfigError::InvalidAddress {
                    address: address.clone(),
                    reason: "missing port".into(),
                });
            }
            let addr = if addr.starts_with(':') {
                format!("0.0.0.0{addr}")
            } else {
                addr.to_string()
            };
            return Ok((addr, protocol));
        }

        if let Some(port) = self.port {
            let protocol: Protocol = self.protocol.as_deref().unwrap_or("tcp").parse()?;
            return Ok((format!("0.0.0.0:{port}"), protocol));
        }

        Err(ConfigError::InvalidAddress {
            address: String::new(),
            reason: "either address or port must be set".into(),
        })
    }

    #[must_use]
    pub fn transport_name(&self) -> &str {
        self.servers_transport.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct EntryPointTransport {
    #[serde(default)]
    pub life_cycle: LifeCycle,

    #[serde(default)]
    pub responding_timeouts: RespondingTimeouts,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct LifeCycle {
    /// Time the listener keeps accepting after a stop was requested.
    #[serde(
        default,
        with = "super::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub request_accept_grace_timeout: Option<Duration>,

    #[serde(
        default,
        rename = "graceTimeOut",
        with = "super::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub grace_timeout: Option<Duration>,
}

impl LifeCycle {
    #[must_use]
    pub fn accept_grace(&self) -> Duration {
        self.request_accept_grace_timeout.unwrap_or_default()
    }

    #[must_use]
    pub fn grace(&self) -> Duration {
        self.grace_timeout.unwrap_or(DEFAULT_GRACE_TIMEOUT)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RespondingTimeouts {
    #[serde(
        default,
        with = "super::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub read_timeout: Option<Duration>,

    #[serde(
        default,
        with = "super::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub write_timeout: Option<Duration>,

    #[serde(
        default,
        with = "super::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub idle_timeout: Option<Duration>,
}

impl RespondingTimeouts {
    #[must_use]
    pub fn idle(&self) -> Duration {
        self.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ForwardedHeadersConfig {
    /// Trust forwarding headers from every client.
    #[serde(default, skip_serializing_if = "is_false")]
    pub insecure: bool,

    #[serde(default, rename = "trustedIPs", skip_serializing_if = "Vec::is_empty")]
    pub trusted_ips: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct EntryPointTls {
    #[serde(default)]
    pub certificates: Vec<CertificateConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ServersTransportConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub insecure_skip_verify: bool,

    #[serde(default, rename = "rootCAs", skip_serializing_if = "Vec::is_empty")]
    pub root_cas: Vec<FileOrContent>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub certificates: Vec<CertificateConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_conn_per_host: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarding_timeouts: Option<ForwardingTimeouts>,
}

impl ServersTransportConfig {
    /// Whether any setting asks for a non-default TLS client configuration.
    #[must_use]
    pub fn has_tls_override(&self) -> bool {
        self.insecure_skip_verify
            || !self.root_cas.is_empty()
            || self.server_name.as_deref().is_some_and(|s| !s.is_empty())
            || !self.certificates.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ForwardingTimeouts {
    #[serde(
        default,
        with = "super::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub dial_timeout: Option<Duration>,

    #[serde(
        default,
        with = "super::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub response_header_timeout: Option<Duration>,

    #[serde(
        default,
        with = "super::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub idle_conn_timeout: Option<Duration>,
}

/// One optional block per middleware kind. Converted into an ordered chain by
/// [`crate::middleware::resolve`].
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct MiddlewareConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_prefix: Option<AddPrefixConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_host: Option<ReplaceHostConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_path: Option<ReplacePathConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_path_regex: Option<ReplacePathRegexConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

impl MiddlewareConfig {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.add_prefix.is_none()
            && self.replace_host.is_none()
            && self.replace_path.is_none()
            && self.replace_path_regex.is_none()
            && self.rate_limit.is_none()
            && self.circuit_breaker.is_none()
            && self.retry.is_none()
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AddPrefixConfig {
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReplaceHostConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scheme: String,

    #[serde(default)]
    pub host: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReplacePathConfig {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReplacePathRegexConfig {
    #[serde(default)]
    pub regex: String,

    #[serde(default)]
    pub replacement: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Interval between two events. Zero means no limit on the rate.
    #[serde(default, with = "super::duration")]
    pub every: Duration,

    #[serde(default)]
    pub burst: i64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub expression: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default)]
    pub attempts: i64,

    #[serde(default, with = "super::duration")]
    pub initial_interval: Duration,

    /// Largest request body buffered for replay. Larger bodies are sent once.
    #[serde(default = "default_retry_body_limit")]
    pub max_body_bytes: usize,
}

const fn default_retry_body_limit() -> usize {
    DEFAULT_RETRY_BODY_LIMIT
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 0,
            initial_interval: Duration::ZERO,
            max_body_bytes: DEFAULT_RETRY_BODY_LIMIT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(address: Option<&str>, port: Option<u16>, protocol: Option<&str>) -> EntryPointConfig {
        EntryPointConfig {
            address: address.map(String::from),
            port,
            protocol: protocol.map(String::from),
            ..EntryPointConfig::default()
        }
    }

    #[test]
    fn address_with_protocol_suffix() {
        let (addr, proto) = entry(Some(":8080/UDP"), None, None).listen_address().unwrap();
        assert_eq!(addr, "0.0.0.0:8080");
        assert_eq!(proto, Protocol::Udp);
    }

    #[test]
    fn address_defaults_to_tcp() {
        let (addr, proto) = entry(Some("127.0.0.1:9000"), None, None)
            .listen_address()
            .unwrap();
        assert_eq!(addr, "127.0.0.1:9000");
        assert_eq!(proto, Protocol::Tcp);
    }

    #[test]
    fn port_and_protocol_are_case_insensitive() {
        let (addr, proto) = entry(None, Some(8085), Some("TCP")).listen_address().unwrap();
        assert_eq!(addr, "0.0.0.0:8085");
        assert_eq!(proto, Protocol::Tcp);
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let err = entry(Some(":80/sctp"), None, None).listen_address().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidProtocol(p) if p == "sctp"));
    }

    #[test]
    fn missing_address_and_port_is_rejected() {
        assert!(entry(None, None, None).listen_address().is_err());
    }

    #[test]
    fn lifecycle_defaults() {
        let t = EntryPointTransport::default();
        assert_eq!(t.life_cycle.grace(), Duration::from_secs(10));
        assert_eq!(t.life_cycle.accept_grace(), Duration::ZERO);
        assert_eq!(t.responding_timeouts.idle(), Duration::from_secs(180));
    }

    #[test]
    fn transport_configs_always_include_default() {
        let config = Config::default();
        let map = config.transport_configs();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key(DEFAULT_TRANSPORT));
    }

    #[test]
    fn plain_transport_has_no_tls_override() {
        assert!(!ServersTransportConfig::default().has_tls_override());
        let cfg = ServersTransportConfig {
            server_name: Some("backend.internal".into()),
            ..ServersTransportConfig::default()
        };
        assert!(cfg.has_tls_override());
    }
}
