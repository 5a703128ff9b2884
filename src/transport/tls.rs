//! rustls client configuration for backend transports.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::config::model::ServersTransportConfig;
use crate::error::ConfigError;
use crate::tls::{install_crypto_provider, parse_certs};

/// Build the client TLS settings of a transport.
///
/// Without `rootCAs` the bundled webpki roots are trusted. Root CA entries
/// that cannot be read or parsed are skipped with a warning; a broken client
/// certificate fails the whole build.
pub fn client_config(cfg: &ServersTransportConfig) -> Result<ClientConfig, ConfigError> {
    install_crypto_provider();

    let mut roots = RootCertStore::empty();
    if cfg.root_cas.is_empty() {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    } else {
        for ca in &cfg.root_cas {
            match parse_certs(ca) {
                Ok(certs) if certs.is_empty() => {
                    tracing::warn!("root CA entry contains no certificates, skipping");
                }
                Ok(certs) => {
                    let (added, ignored) = roots.add_parsable_certificates(certs);
                    if ignored > 0 {
                        tracing::warn!(added, ignored, "some root CA certificates were rejected");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to load root CA, skipping"),
            }
        }
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let mut config = match cfg.certificates.first() {
        Some(pair) => {
            if cfg.certificates.len() > 1 {
                tracing::warn!(
                    configured = cfg.certificates.len(),
                    "only the first client certificate is presented"
                );
            }
            let (certs, key) = pair.load()?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ConfigError::Tls(e.to_string()))?
        }
        None => builder.with_no_client_auth(),
    };

    if cfg.insecure_skip_verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier::new()));
    }

    Ok(config)
}

/// Accepts any server certificate. Signatures are still checked so the
/// handshake itself stays well-formed.
#[derive(Debug)]
struct NoVerifier {
    schemes: Vec<SignatureScheme>,
}

impl NoVerifier {
    fn new() -> Self {
        Self {
            schemes: rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}
