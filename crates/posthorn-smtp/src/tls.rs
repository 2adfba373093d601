//! TLS client-configuration assembly.
//!
//! Pure construction: turns the TLS-related connection options into a
//! ready-to-use `rustls::ClientConfig`. No state is kept here and a
//! caller-supplied configuration is never modified.

use std::io;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};

use crate::error::{Error, Result};

/// Builds the client TLS configuration for a connect attempt.
///
/// A pre-built `existing` configuration always wins and is returned
/// unchanged. Otherwise a client-purpose configuration is assembled:
/// certificate and hostname verification are enabled when `validate_certs`
/// is true and both disabled when false, `cert_bundle` adds trust anchors on
/// top of the webpki roots, and `client_cert`/`client_key` enable mutual TLS
/// (the key may live in the certificate file when no key path is given).
///
/// # Errors
///
/// Returns [`Error::Configuration`] if a PEM file cannot be read or contains
/// no usable material, or [`Error::Tls`] if rustls rejects it.
pub fn build_client_config(
    existing: Option<&Arc<ClientConfig>>,
    validate_certs: bool,
    cert_bundle: Option<&Path>,
    client_cert: Option<&Path>,
    client_key: Option<&Path>,
) -> Result<Arc<ClientConfig>> {
    if let Some(config) = existing {
        return Ok(Arc::clone(config));
    }

    let builder = if validate_certs {
        let mut roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        if let Some(bundle) = cert_bundle {
            for cert in load_certificates(bundle)? {
                roots.add(cert)?;
            }
        }
        ClientConfig::builder().with_root_certificates(roots)
    } else {
        // Explicit opt-out: skips both peer-certificate and hostname checks.
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerification))
    };

    let config = match client_cert {
        Some(cert_path) => {
            let certs = load_certificates(cert_path)?;
            let key = match client_key {
                Some(key_path) => load_private_key(key_path)?,
                None => load_private_key(cert_path)?,
            };
            builder.with_client_auth_cert(certs, key)?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let data = read_pem(path)?;
    let certs = rustls_pemfile::certs(&mut io::Cursor::new(data))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|err| {
            Error::configuration(format!("invalid PEM in {}: {err}", path.display()))
        })?;
    if certs.is_empty() {
        return Err(Error::configuration(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let data = read_pem(path)?;
    rustls_pemfile::private_key(&mut io::Cursor::new(data))
        .map_err(|err| Error::configuration(format!("invalid PEM in {}: {err}", path.display())))?
        .ok_or_else(|| {
            Error::configuration(format!("no private key found in {}", path.display()))
        })
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|err| Error::configuration(format!("failed to read {}: {err}", path.display())))
}

mod danger {
    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    /// Accepts any server certificate. Installed only when the caller has
    /// explicitly disabled certificate validation.
    #[derive(Debug)]
    pub struct NoVerification;

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::aws_lc_rs::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
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
    fn existing_config_is_returned_unchanged() {
        let existing = build_client_config(None, true, None, None, None).unwrap();
        let returned =
            build_client_config(Some(&existing), false, None, None, None).unwrap();
        assert!(Arc::ptr_eq(&existing, &returned));
    }

    #[test]
    fn builds_with_and_without_validation() {
        assert!(build_client_config(None, true, None, None, None).is_ok());
        assert!(build_client_config(None, false, None, None, None).is_ok());
    }

    #[test]
    fn missing_cert_bundle_is_a_configuration_error() {
        let err = build_client_config(
            None,
            true,
            Some(Path::new("/nonexistent/bundle.pem")),
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn missing_client_cert_is_a_configuration_error() {
        let err = build_client_config(
            None,
            true,
            None,
            Some(Path::new("/nonexistent/client.pem")),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn garbage_pem_is_rejected() {
        let dir = std::env::temp_dir();
        let path = dir.join("posthorn-smtp-not-a-cert.pem");
        std::fs::write(&path, b"this is not PEM data").unwrap();
        let err = build_client_config(None, true, Some(&path), None, None).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        let _ = std::fs::remove_file(&path);
    }
}
