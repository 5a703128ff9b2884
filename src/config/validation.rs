//! Configuration validation with detailed error reporting.
//!
//! The [`validate`] function checks a parsed [`Config`] for everything that
//! would otherwise fail when entry points and middleware are constructed:
//! bad addresses and protocols, unknown transports, unparsable trusted IPs,
//! missing required middleware fields, invalid regular expressions and
//! ambiguous middleware combinations. All findings are reported at once.

use std::fmt::Write;

use super::model::{Config, EntryPointConfig, MiddlewareConfig};
use crate::error::ValidationError;
use crate::middleware::forwarded_headers::TrustedIps;
use crate::transport::DEFAULT_TRANSPORT;

const ROOT: &str = "(root)";

fn push(
    errors: &mut Vec<ValidationError>,
    scope: &str,
    field: &str,
    message: impl Into<String>,
    suggestion: Option<String>,
) {
    errors.push(ValidationError {
        scope: scope.to_string(),
        field: field.to_string(),
        message: message.into(),
        suggestion,
    });
}

pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.entry_points.is_empty() {
        push(
            &mut errors,
            ROOT,
            "entryPoints",
            "at least one entry point must be defined",
            Some("add e.g. `entryPoints: { web: { address: \":8080\" } }`".into()),
        );
    }

    if config.servers_transports.contains_key(DEFAULT_TRANSPORT) {
        push(
            &mut errors,
            ROOT,
            "serversTransports",
            format!("'{DEFAULT_TRANSPORT}' is reserved"),
            Some("configure the default transport under `serversTransport`".into()),
        );
    }

    validate_middleware(ROOT, &config.middleware, &mut errors);

    for (name, entry_point) in &config.entry_points {
        validate_entry_point(config, name, entry_point, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_entry_point(
    config: &Config,
    name: &str,
    entry_point: &EntryPointConfig,
    errors: &mut Vec<ValidationError>,
) {
    let scope = format!("entryPoints.{name}");

    match entry_point.listen_address() {
        Ok((addr, _)) => {
            let valid_port = addr
                .rsplit_once(':')
                .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
            if !valid_port {
                push(errors, &scope, "address", format!("'{addr}' has no valid port"), None);
            }
        }
        Err(e) => push(errors, &scope, "address", e.to_string(), None),
    }

    let transport = entry_point.transport_name();
    if !transport.is_empty()
        && transport != DEFAULT_TRANSPORT
        && !config.servers_transports.contains_key(transport)
    {
        let known: Vec<&str> = config.servers_transports.keys().map(String::as_str).collect();
        push(
            errors,
            &scope,
            "serversTransport",
            format!("unknown servers transport '{transport}'"),
            (!known.is_empty()).then(|| format!("known transports: {}", known.join(", "))),
        );
    }

    if let Err(e) = TrustedIps::parse(&entry_point.forwarded_headers.trusted_ips) {
        push(errors, &scope, "forwardedHeaders.trustedIPs", e.to_string(), None);
    }

    if let Some(ref tls) = entry_point.tls {
        if tls.certificates.is_empty() {
            push(
                errors,
                &scope,
                "tls.certificates",
                "tls is enabled but no certificate is configured",
                None,
            );
        }
    }

    if let Some(ref middleware) = entry_point.middleware {
        validate_middleware(&scope, middleware, errors);
    }
}

fn validate_middleware(scope: &str, cfg: &MiddlewareConfig, errors: &mut Vec<ValidationError>) {
    if let Some(ref add_prefix) = cfg.add_prefix {
        if add_prefix.prefix.is_empty() {
            push(errors, scope, "middleware.addPrefix.prefix", "prefix cannot be empty", None);
        }
    }

    if let Some(ref replace_host) = cfg.replace_host {
        if replace_host.host.is_empty() {
            push(errors, scope, "middleware.replaceHost.host", "host cannot be empty", None);
        }
        if !matches!(replace_host.scheme.as_str(), "" | "http" | "https") {
            push(
                errors,
                scope,
                "middleware.replaceHost.scheme",
                format!("unsupported scheme '{}'", replace_host.scheme),
                Some("expected http or https".into()),
            );
        }
    }

    if let Some(ref regex) = cfg.replace_path_regex {
        let pattern = regex.regex.trim();
        if pattern.is_empty() {
            push(errors, scope, "middleware.replacePathRegex.regex", "regex cannot be empty", None);
        } else if let Err(e) = regex::Regex::new(pattern) {
            push(errors, scope, "middleware.replacePathRegex.regex", e.to_string(), None);
        }
    }

    if cfg.replace_path.is_some() && cfg.replace_path_regex.is_some() {
        push(
            errors,
            scope,
            "middleware",
            "replacePath and replacePathRegex cannot both be set",
            Some("keep only one path rewrite".into()),
        );
    }

    if let Some(ref retry) = cfg.retry {
        if retry.attempts <= 0 {
            push(
                errors,
                scope,
                "middleware.retry.attempts",
                format!("attempts must be greater than zero (got {})", retry.attempts),
                None,
            );
        }
    }
}

/// One-line summary printed by `gatehouse validate` on success.
#[must_use]
pub fn format_validation_report(path_display: &str, config: &Config) -> String {
    let transports = config.transport_configs().len();
    let mut report = format!(
        "{path_display} is valid ({} entry points, {transports} transports)\n",
        config.entry_points.len()
    );
    for (name, entry_point) in &config.entry_points {
        let address = entry_point
            .listen_address()
            .map_or_else(|_| "?".to_string(), |(addr, proto)| format!("{addr}/{proto}"));
        let tls = if entry_point.tls.is_some() { " +tls" } else { "" };
        let _ = writeln!(report, "  {name:<16} {address}{tls}");
    }
    report
}
