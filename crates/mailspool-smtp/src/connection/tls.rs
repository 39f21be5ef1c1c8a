//! TLS configuration: trust anchors, connector and verification reporting.

use std::fmt;
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Certificates the server chain is verified against.
#[derive(Clone, Default)]
pub enum TrustAnchors {
    /// No peer verification. Insecure fallback used when no CA bundle is configured.
    #[default]
    None,
    /// The Mozilla root set shipped with `webpki-roots`.
    WebPki,
    /// Certificates parsed from a PEM bundle.
    Certificates(Vec<CertificateDer<'static>>),
}

impl TrustAnchors {
    /// Parses a PEM bundle. A blank bundle means no verification.
    ///
    /// # Errors
    ///
    /// Returns an error if the PEM text is malformed or holds no certificate.
    pub fn from_pem(pem: &str) -> Result<Self> {
        if pem.trim().is_empty() {
            return Ok(Self::None);
        }
        let certs = rustls_pemfile::certs(&mut pem.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Certificate(format!("parse CA certificates: {e}")))?;
        if certs.is_empty() {
            return Err(Error::Certificate(
                "no certificates found in CA bundle".into(),
            ));
        }
        Ok(Self::Certificates(certs))
    }

    /// Returns true if the server certificate will be verified.
    #[must_use]
    pub const fn verifies(&self) -> bool {
        !matches!(self, Self::None)
    }

    fn root_store(&self) -> Result<Option<RootCertStore>> {
        match self {
            Self::None => Ok(None),
            Self::WebPki => Ok(Some(RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            })),
            Self::Certificates(certs) => {
                let mut store = RootCertStore::empty();
                for cert in certs {
                    store
                        .add(cert.clone())
                        .map_err(|e| Error::Certificate(format!("add CA certificate: {e}")))?;
                }
                Ok(Some(store))
            }
        }
    }
}

impl fmt::Debug for TrustAnchors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::WebPki => f.write_str("WebPki"),
            Self::Certificates(certs) => write!(f, "Certificates({})", certs.len()),
        }
    }
}

/// Creates a TLS connector for the given trust anchors.
///
/// # Errors
///
/// Returns an error if the trust anchors cannot be turned into a verifier.
pub fn create_tls_connector(trust: &TrustAnchors) -> Result<TlsConnector> {
    let provider = CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

    let inner = match trust.root_store()? {
        Some(roots) => Some(
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()
                .map_err(|e| Error::Certificate(e.to_string()))?,
        ),
        None => {
            warn!("no CA certificates configured, server certificate will not be verified");
            None
        }
    };

    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(ReportingVerifier { inner, provider }))
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Logs the certificate verification outcome of every handshake.
///
/// With no inner verifier any certificate is accepted, but handshake
/// signatures are still checked with the provider's algorithms.
#[derive(Debug)]
struct ReportingVerifier {
    inner: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for ReportingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let Some(inner) = &self.inner else {
            debug!(server = ?server_name, "certificate verification skipped");
            return Ok(ServerCertVerified::assertion());
        };
        match inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(verified) => {
                debug!(server = ?server_name, "certificate verified");
                Ok(verified)
            }
            Err(e) => {
                warn!(server = ?server_name, "certificate verification failed: {e}");
                Err(e)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        match &self.inner {
            Some(inner) => inner.verify_tls12_signature(message, cert, dss),
            None => rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            ),
        }
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        match &self.inner {
            Some(inner) => inner.verify_tls13_signature(message, cert, dss),
            None => rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            ),
        }
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        match &self.inner {
            Some(inner) => inner.supported_verify_schemes(),
            None => self
                .provider
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_bundle_means_no_verification() {
        let trust = TrustAnchors::from_pem("  \n").unwrap();
        assert!(matches!(trust, TrustAnchors::None));
        assert!(!trust.verifies());
    }

    #[test]
    fn test_bundle_without_certificates_is_rejected() {
        let err = TrustAnchors::from_pem("not a certificate").unwrap_err();
        assert!(matches!(err, Error::Certificate(_)));
    }

    #[test]
    fn test_create_tls_connector_without_verification() {
        assert!(create_tls_connector(&TrustAnchors::None).is_ok());
    }

    #[test]
    fn test_create_tls_connector_with_webpki_roots() {
        assert!(TrustAnchors::WebPki.verifies());
        assert!(create_tls_connector(&TrustAnchors::WebPki).is_ok());
    }

    #[test]
    fn test_debug_shows_certificate_count() {
        let trust = TrustAnchors::Certificates(Vec::new());
        assert_eq!(format!("{trust:?}"), "Certificates(0)");
    }
}
