//! Trust policy for client-supplied forwarding headers.
//!
//! Requests from peers that are neither covered by `insecure` nor listed in
//! `trustedIPs` lose every `X-Forwarded-*`, `X-Real-Ip` and `Forwarded`
//! header before the gateway sets its own values.

use std::net::IpAddr;

use async_trait::async_trait;
use http::{header, HeaderMap, HeaderName, HeaderValue};

use super::{ConnectionInfo, Handler, Request, Response, SharedHandler};
use crate::config::model::ForwardedHeadersConfig;
use crate::error::{ConfigError, HandlerError};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PORT: HeaderName = HeaderName::from_static("x-forwarded-port");
const X_FORWARDED_SERVER: HeaderName = HeaderName::from_static("x-forwarded-server");
const X_FORWARDED_URI: HeaderName = HeaderName::from_static("x-forwarded-uri");
const X_FORWARDED_METHOD: HeaderName = HeaderName::from_static("x-forwarded-method");
const X_FORWARDED_PREFIX: HeaderName = HeaderName::from_static("x-forwarded-prefix");
const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");

const UNTRUSTED: [HeaderName; 10] = [
    X_FORWARDED_FOR,
    X_FORWARDED_PROTO,
    X_FORWARDED_HOST,
    X_FORWARDED_PORT,
    X_FORWARDED_SERVER,
    X_FORWARDED_URI,
    X_FORWARDED_METHOD,
    X_FORWARDED_PREFIX,
    X_REAL_IP,
    header::FORWARDED,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

/// Addresses and CIDR ranges whose forwarding headers are kept.
#[derive(Debug, Clone, Default)]
pub struct TrustedIps(Vec<Cidr>);

impl TrustedIps {
    pub fn parse(entries: &[String]) -> Result<Self, ConfigError> {
        entries
            .iter()
            .map(|entry| parse_cidr(entry.trim()))
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.0.iter().any(|cidr| cidr.contains(ip))
    }
}

fn parse_cidr(entry: &str) -> Result<Cidr, ConfigError> {
    let invalid = || ConfigError::InvalidTrustedIp(entry.to_string());
    let (addr, prefix) = match entry.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (entry, None),
    };
    let network: IpAddr = addr.parse().map_err(|_| invalid())?;
    let network = network.to_canonical();
    let max = if network.is_ipv4() { 32 } else { 128 };
    let prefix = match prefix {
        Some(p) => p.parse::<u8>().map_err(|_| invalid())?,
        None => max,
    };
    if prefix > max {
        return Err(invalid());
    }
    Ok(Cidr { network, prefix })
}

pub struct ForwardedHeaders {
    next: SharedHandler,
    insecure: bool,
    trusted: TrustedIps,
}

impl ForwardedHeaders {
    pub fn new(next: SharedHandler, cfg: &ForwardedHeadersConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            next,
            insecure: cfg.insecure,
            trusted: TrustedIps::parse(&cfg.trusted_ips)?,
        })
    }

    fn is_trusted(&self, peer: Option<IpAddr>) -> bool {
        self.insecure || peer.is_some_and(|ip| self.trusted.contains(ip))
    }
}

fn set_if_absent(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if headers.contains_key(&name) {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Rewrite forwarding headers for one request. `peer` is absent only when the
/// request did not come through an entry point.
pub fn apply(headers: &mut HeaderMap, info: Option<ConnectionInfo>, trusted: bool) {
    if !trusted {
        for name in &UNTRUSTED {
            headers.remove(name);
        }
    }

    let tls = info.is_some_and(|i| i.tls);
    let proto = if tls { "https" } else { "http" };
    set_if_absent(headers, X_FORWARDED_PROTO, proto);

    if let Some(host) = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    {
        set_if_absent(headers, X_FORWARDED_HOST, &host);
        let port = host
            .rsplit_once(':')
            .filter(|(_, port)| port.parse::<u16>().is_ok())
            .map_or(if tls { "443" } else { "80" }, |(_, port)| port)
            .to_string();
        set_if_absent(headers, X_FORWARDED_PORT, &port);
    }

    let Some(info) = info else {
        return;
    };
    let client_ip = info.peer.ip().to_canonical().to_string();
    set_if_absent(headers, X_REAL_IP, &client_ip);

    let xff = headers
        .get(&X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .map_or_else(
            || client_ip.clone(),
            |existing| format!("{existing}, {client_ip}"),
        );
    if let Ok(value) = HeaderValue::from_str(&xff) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

#[async_trait]
impl Handler for ForwardedHeaders {
    async fn handle(&self, mut req: Request) -> Result<Response, HandlerError> {
        let info = req.extensions().get::<ConnectionInfo>().copied();
        let trusted = self.is_trusted(info.map(|i| i.peer.ip()));
        apply(req.headers_mut(), info, trusted);
        self.next.handle(req).await
    }
}
