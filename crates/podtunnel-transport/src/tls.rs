//! TLS client configuration for the upgrade connection

use crate::{TransportError, TransportResult};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::sync::Arc;

/// TLS material used when the endpoint is `https`
#[derive(Clone, Default)]
pub struct TlsSettings {
    /// PEM bundle of trusted CAs; the webpki roots are used when empty
    pub ca_pem: Option<Vec<u8>>,

    /// PEM client certificate chain presented during the handshake
    pub client_cert_pem: Option<Vec<u8>>,

    /// PEM private key matching `client_cert_pem`
    pub client_key_pem: Option<Vec<u8>>,

    /// Disable server certificate verification (INSECURE)
    pub insecure_skip_verify: bool,

    /// Name to verify instead of the URL host
    pub server_name: Option<String>,
}

impl std::fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSettings")
            .field("ca_pem", &self.ca_pem.is_some())
            .field("client_cert_pem", &self.client_cert_pem.is_some())
            .field("client_key_pem", &self.client_key_pem.is_some())
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl TlsSettings {
    /// Build a rustls client configuration advertising the given ALPN protocols
    pub fn client_config(&self, alpn_protocols: &[&str]) -> TransportResult<rustls::ClientConfig> {
        ensure_crypto_provider();

        let builder = if self.insecure_skip_verify {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
        } else {
            let mut roots = rustls::RootCertStore::empty();
            match &self.ca_pem {
                Some(pem) => {
                    for cert in parse_certs(pem)? {
                        roots.add(cert).map_err(|e| {
                            TransportError::ConfigurationError(format!("Invalid root cert: {}", e))
                        })?;
                    }
                }
                None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
            }
            rustls::ClientConfig::builder().with_root_certificates(roots)
        };

        let mut client_crypto = match (&self.client_cert_pem, &self.client_key_pem) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(parse_certs(cert)?, parse_private_key(key)?)
                .map_err(|e| TransportError::TlsError(format!("Invalid client cert/key: {}", e)))?,
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(TransportError::ConfigurationError(
                    "Client certificate and key must be configured together".to_string(),
                ))
            }
        };

        client_crypto.alpn_protocols = alpn_protocols
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect();

        Ok(client_crypto)
    }

    /// Build a connector for the upgrade connection (HTTP/1.1 only)
    pub fn connector(&self) -> TransportResult<tokio_rustls::TlsConnector> {
        let config = self.client_config(&["http/1.1"])?;
        Ok(tokio_rustls::TlsConnector::from(Arc::new(config)))
    }

    /// Name to present via SNI and verify against
    pub fn server_name(&self, host: &str) -> TransportResult<ServerName<'static>> {
        let name = self.server_name.as_deref().unwrap_or(host);
        // IPv6 literals arrive bracketed from URLs
        let name = name.trim_start_matches('[').trim_end_matches(']');
        ServerName::try_from(name.to_string())
            .map_err(|e| TransportError::TlsError(format!("Invalid server name {}: {}", name, e)))
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn parse_certs(pem: &[u8]) -> TransportResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::TlsError(
            "No certificates found in PEM data".to_string(),
        ));
    }
    Ok(certs)
}

fn parse_private_key(pem: &[u8]) -> TransportResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_uses_webpki_roots() {
        let config = TlsSettings::default().client_config(&["http/1.1"]).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_insecure_config() {
        let settings = TlsSettings {
            insecure_skip_verify: true,
            ..Default::default()
        };
        assert!(settings.connector().is_ok());
    }

    #[test]
    fn test_invalid_ca_pem() {
        let settings = TlsSettings {
            ca_pem: Some(b"not a certificate".to_vec()),
            ..Default::default()
        };
        assert!(matches!(
            settings.client_config(&[]),
            Err(TransportError::TlsError(_))
        ));
    }

    #[test]
    fn test_cert_without_key() {
        let settings = TlsSettings {
            insecure_skip_verify: true,
            client_cert_pem: Some(Vec::new()),
            ..Default::default()
        };
        assert!(matches!(
            settings.client_config(&[]),
            Err(TransportError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_server_name_override() {
        let settings = TlsSettings {
            server_name: Some("kubernetes.default.svc".to_string()),
            ..Default::default()
        };
        let name = settings.server_name("10.0.0.1").unwrap();
        assert_eq!(name.to_str(), "kubernetes.default.svc");

        let name = TlsSettings::default().server_name("[::1]").unwrap();
        assert!(matches!(name, ServerName::IpAddress(_)));
    }
}
