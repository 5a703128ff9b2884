//! `gatehouse validate`: check a configuration file without serving it.
//!
//! Besides the static checks of [`validation::validate`], the file is
//! dry-run through everything `run` would construct: each middleware chain,
//! each backend TLS client config and each entry point certificate. TLS
//! material that only fails once it is parsed is reported here as well.

use std::sync::Arc;

use crate::cli::{ValidateArgs, ValidateFormat};
use crate::config::model::Config;
use crate::config::sources::parse_config_str;
use crate::config::validation;
use crate::error::{GatewayError, ValidationError};
use crate::middleware::retry::{LogRetryListener, RetryListener};
use crate::server;
use crate::tls::{CertificateProvider, StaticCertificateProvider};
use crate::transport::manager::RoundTripperManager;

pub fn execute(args: &ValidateArgs) -> Result<(), GatewayError> {
    let path = &args.config;
    if !path.exists() {
        return Err(GatewayError::ConfigFileNotFound { path: path.clone() });
    }

    let content = std::fs::read_to_string(path)?;
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let display = path.display().to_string();
    let config = parse_config_str(ext, &content, &display)?;

    let errors = match validation::validate(&config) {
        Ok(()) => dry_run(&config),
        Err(errors) => errors,
    };

    if errors.is_empty() {
        match args.format {
            ValidateFormat::Text => {
                println!("\u{2713} {}", validation::format_validation_report(&display, &config));
            }
            ValidateFormat::Json => println!(
                "{}",
                serde_json::json!({
                    "valid": true,
                    "entryPoints": config.entry_points.len(),
                    "transports": config.transport_configs().len(),
                })
            ),
        }
        return Ok(());
    }

    match args.format {
        ValidateFormat::Text => {
            eprintln!("\u{2717} {display} has {} errors\n", errors.len());
            for error in &errors {
                eprintln!("{error}");
            }
        }
        ValidateFormat::Json => println!("{}", json_report(&errors)),
    }
    Err(GatewayError::ConfigValidation { errors })
}

/// Construct what `run` would construct, collecting every failure.
fn dry_run(config: &Config) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for (name, transport) in config.transport_configs() {
        if !transport.has_tls_override() {
            continue;
        }
        if let Err(e) = crate::transport::tls::client_config(&transport) {
            errors.push(finding(format!("serversTransports.{name}"), "tls", &e));
        }
    }

    for (name, entry_point) in &config.entry_points {
        if let Some(ref tls) = entry_point.tls {
            let provider = StaticCertificateProvider::new(tls.certificates.clone());
            if let Err(e) = provider.server_config() {
                errors.push(finding(format!("entryPoints.{name}"), "tls.certificates", &e));
            }
        }
    }

    let manager = Arc::new(RoundTripperManager::new());
    let listener: Arc<dyn RetryListener> = Arc::new(LogRetryListener);
    for (name, entry_point) in &config.entry_points {
        if let Err(e) = server::build_router(config, entry_point, &manager, &listener) {
            errors.push(finding(format!("entryPoints.{name}"), "middleware", &e));
        }
    }

    errors
}

fn finding(scope: String, field: &str, error: &dyn std::fmt::Display) -> ValidationError {
    ValidationError {
        scope,
        field: field.to_string(),
        message: error.to_string(),
        suggestion: None,
    }
}

fn json_report(errors: &[ValidationError]) -> serde_json::Value {
    let errors: Vec<serde_json::Value> = errors
        .iter()
        .map(|e| {
            serde_json::json!({
                "scope": e.scope,
                "field": e.field,
                "message": e.message,
                "suggestion": e.suggestion,
            })
        })
        .collect();
    serde_json::json!({ "valid": false, "errors": errors })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{EntryPointTls, ServersTransportConfig};
    use crate::tls::{CertificateConfig, FileOrContent};

    fn config(json: &str) -> Config {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn valid_config_dry_runs_clean() {
        let cfg = config(
            r#"{
                "entryPoints": {"web": {"address": ":8080"}},
                "middleware": {"replaceHost": {"host": "backend:80"}}
            }"#,
        );
        assert!(dry_run(&cfg).is_empty());
    }

    #[test]
    fn unparsable_certificates_are_reported() {
        let mut cfg = config(r#"{"entryPoints": {"web": {"address": ":8443"}}}"#);
        let broken = CertificateConfig {
            cert_file: FileOrContent::from("garbage"),
            key_file: FileOrContent::from("garbage"),
        };
        if let Some(web) = cfg.entry_points.get_mut("web") {
            web.tls = Some(EntryPointTls {
                certificates: vec![broken.clone()],
            });
        }
        cfg.servers_transports.insert(
            "mtls".into(),
            ServersTransportConfig {
                certificates: vec![broken],
                ..ServersTransportConfig::default()
            },
        );

        let errors = dry_run(&cfg);
        let scopes: Vec<&str> = errors.iter().map(|e| e.scope.as_str()).collect();
        assert!(scopes.contains(&"entryPoints.web"));
        assert!(scopes.contains(&"serversTransports.mtls"));
    }

    #[test]
    fn json_report_lists_findings() {
        let report = json_report(&[ValidationError {
            scope: "(root)".into(),
            field: "entryPoints".into(),
            message: "missing".into(),
            suggestion: Some("add one".into()),
        }]);
        assert_eq!(report["valid"], false);
        assert_eq!(report["errors"][0]["suggestion"], "add one");
    }
}
