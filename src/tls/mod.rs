//! TLS material shared by entry points and backend transports.
//!
//! [`FileOrContent`] holds either a path to a PEM file or the PEM text
//! itself. [`CertificateConfig`] pairs a certificate chain with its key.
//! Entry points obtain their rustls `ServerConfig` through a
//! [`CertificateProvider`]; [`StaticCertificateProvider`] serves configured
//! PEM material.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A path to a PEM file, or inline PEM content.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct FileOrContent(pub String);

impl FileOrContent {
    /// True when the value names something on disk. Such a value is always
    /// read as a file, even when reading it then fails.
    #[must_use]
    pub fn is_path(&self) -> bool {
        Path::new(&self.0).exists()
    }

    /// Bytes of the referenced file, or of the inline content.
    pub fn read(&self) -> std::io::Result<Vec<u8>> {
        if self.is_path() {
            std::fs::read(&self.0)
        } else {
            Ok(self.0.as_bytes().to_vec())
        }
    }
}

impl From<&str> for FileOrContent {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CertificateConfig {
    pub cert_file: FileOrContent,
    pub key_file: FileOrContent,
}

impl CertificateConfig {
    /// Parse the certificate chain and its private key.
    pub fn load(&self) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ConfigError> {
        let certs = parse_certs(&self.cert_file)?;
        if certs.is_empty() {
            return Err(ConfigError::Tls(format!(
                "no certificates found in {}",
                describe(&self.cert_file)
            )));
        }
        let key = parse_private_key(&self.key_file)?;
        Ok((certs, key))
    }
}

fn describe(source: &FileOrContent) -> String {
    if source.is_path() {
        source.0.clone()
    } else {
        "inline content".into()
    }
}

pub fn parse_certs(source: &FileOrContent) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let bytes = source
        .read()
        .map_err(|e| ConfigError::Tls(format!("failed to read {}: {e}", describe(source))))?;
    let mut reader = BufReader::new(bytes.as_slice());
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Tls(format!("failed to parse {}: {e}", describe(source))))
}

pub fn parse_private_key(source: &FileOrContent) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let bytes = source
        .read()
        .map_err(|e| ConfigError::Tls(format!("failed to read {}: {e}", describe(source))))?;
    let mut reader = BufReader::new(bytes.as_slice());
    let key = rustls_pemfile::read_all(&mut reader)
        .filter_map(Result::ok)
        .find_map(|item| match item {
            rustls_pemfile::Item::Pkcs1Key(key) => Some(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Pkcs8Key(key) => Some(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Sec1Key(key) => Some(PrivateKeyDer::Sec1(key)),
            _ => None,
        });
    key.ok_or_else(|| ConfigError::Tls(format!("no private key found in {}", describe(source))))
}

/// Supplies the server-side TLS configuration of an entry point.
pub trait CertificateProvider: Send + Sync {
    fn server_config(&self) -> Result<Arc<rustls::ServerConfig>, ConfigError>;
}

/// Serves the first configured certificate pair.
#[derive(Debug, Clone)]
pub struct StaticCertificateProvider {
    certificates: Vec<CertificateConfig>,
}

impl StaticCertificateProvider {
    #[must_use]
    pub const fn new(certificates: Vec<CertificateConfig>) -> Self {
        Self { certificates }
    }
}

impl CertificateProvider for StaticCertificateProvider {
    fn server_config(&self) -> Result<Arc<rustls::ServerConfig>, ConfigError> {
        let Some(first) = self.certificates.first() else {
            return Err(ConfigError::Tls("no certificates configured".into()));
        };
        if self.certificates.len() > 1 {
            tracing::warn!(
                configured = self.certificates.len(),
                "only the first certificate is served"
            );
        }

        let (certs, key) = first.load()?;
        install_crypto_provider();
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ConfigError::Tls(e.to_string()))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

/// Install `ring` as the process-wide rustls provider. Repeated calls are
/// harmless.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}


#[cfg(test)]
mod tests {
    use super::fixtures::{fixture_path, localhost, SERVER_KEY, SERVER_PEM};
    use super::*;

    #[test]
    fn inline_content_is_not_a_path() {
        let source = FileOrContent::from("-----BEGIN CERTIFICATE-----");
        assert!(!source.is_path());
        assert_eq!(source.read().unwrap(), b"-----BEGIN CERTIFICATE-----");
    }

    #[test]
    fn garbage_has_no_certificates() {
        let certs = parse_certs(&FileOrContent::from("not a pem")).unwrap();
        assert!(certs.is_empty());
    }

    #[test]
    fn missing_key_is_reported() {
        let err = parse_private_key(&FileOrContent::from("not a pem")).unwrap_err();
        assert!(err.to_string().contains("no private key"));
    }

    #[test]
    fn provider_without_certificates_fails() {
        let provider = StaticCertificateProvider::new(Vec::new());
        assert!(provider.server_config().is_err());
    }

    #[test]
    fn loads_inline_certificate_and_key() {
        let (certs, key) = localhost().load().unwrap();
        assert_eq!(certs.len(), 1);
        assert!(matches!(key, PrivateKeyDer::Pkcs8(_)));
    }

    #[test]
    fn loads_certificate_and_key_from_files() {
        let pair = CertificateConfig {
            cert_file: fixture_path("server.pem"),
            key_file: fixture_path("server.key"),
        };
        assert!(pair.cert_file.is_path());
        let (certs, _) = pair.load().unwrap();
        assert_eq!(certs, parse_certs(&FileOrContent::from(SERVER_PEM)).unwrap());
    }

    #[test]
    fn key_is_found_after_other_blocks() {
        let bundle = format!("{SERVER_PEM}{SERVER_KEY}");
        assert!(parse_private_key(&FileOrContent(bundle)).is_ok());
    }

    #[test]
    fn unreadable_path_is_an_error() {
        let dir = FileOrContent(env!("CARGO_MANIFEST_DIR").to_string());
        assert!(dir.is_path());
        let err = parse_certs(&dir).unwrap_err();
        assert!(err.to_string().contains("failed to read"), "{err}");
    }

    #[test]
    fn provider_builds_server_config() {
        let config = StaticCertificateProvider::new(vec![localhost()])
            .server_config()
            .unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
