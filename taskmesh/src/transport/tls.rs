//! TLS credentials for the transport layer.
//!
//! A URL scheme starting with `tls+` (or `wss`) activates TLS. Two
//! credential modes exist:
//!
//! - **Ephemeral**: the host generates a keypair and a self-signed
//!   certificate valid from the distant past to the far future. The
//!   certificate PEM is embedded in launch commands; the private key
//!   never leaves the host. Daemons pin the exact certificate.
//! - **CA-issued**: the host loads an existing `(cert, key)` pair;
//!   daemons receive the chain up to and including the root, plus an
//!   empty second element as the private-key placeholder.

use std::sync::Arc;
use tokio_rustls::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
};

/// Errors building or applying TLS credentials.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("tls configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("invalid PEM material: {0}")]
    Pem(#[from] std::io::Error),

    #[error("no certificates found in PEM material")]
    NoCertificates,

    #[error("no private key found in PEM material")]
    MissingKey,

    #[error("invalid server name {0:?}")]
    InvalidServerName(String),
}

/// Host-side TLS credentials for a profile's listeners.
#[derive(Clone)]
pub enum TlsMaterial {
    /// Self-signed certificate generated by the host.
    Ephemeral { cert_pem: String, key_pem: String },

    /// Certificate chain (leaf first, root last) plus its private key.
    CaIssued { chain_pem: String, key_pem: String },
}

impl TlsMaterial {
    /// Generates an ephemeral self-signed certificate for the given
    /// subject-alternative names, valid 1975-01-01 through 4096-01-01.
    pub fn generate_ephemeral(hosts: &[String]) -> Result<Self, TlsError> {
        let key = rcgen::KeyPair::generate()?;
        let mut params = rcgen::CertificateParams::new(hosts.to_vec())?;
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, "taskmesh host");
        params.distinguished_name = dn;
        params.not_before = rcgen::date_time_ymd(1975, 1, 1);
        params.not_after = rcgen::date_time_ymd(4096, 1, 1);
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key)?;

        Ok(TlsMaterial::Ephemeral {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    /// Wraps an existing CA-issued chain and key (both PEM).
    pub fn ca_issued(chain_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        TlsMaterial::CaIssued {
            chain_pem: chain_pem.into(),
            key_pem: key_pem.into(),
        }
    }

    /// The certificate material daemons need to verify the host.
    pub fn certificate_pem(&self) -> &str {
        match self {
            TlsMaterial::Ephemeral { cert_pem, .. } => cert_pem,
            TlsMaterial::CaIssued { chain_pem, .. } => chain_pem,
        }
    }

    /// The two-element client bundle shipped to daemons: the certificate
    /// chain, and an empty placeholder where a client key would go.
    pub fn client_material(&self) -> [String; 2] {
        [self.certificate_pem().to_string(), String::new()]
    }

    fn key_pem(&self) -> &str {
        match self {
            TlsMaterial::Ephemeral { key_pem, .. } => key_pem,
            TlsMaterial::CaIssued { key_pem, .. } => key_pem,
        }
    }

    /// Builds the rustls server configuration for listeners.
    pub(crate) fn server_config(&self) -> Result<Arc<ServerConfig>, TlsError> {
        let certs = parse_certs(self.certificate_pem())?;
        let key: PrivateKeyDer<'static> =
            rustls_pemfile::private_key(&mut self.key_pem().as_bytes())?
                .ok_or(TlsError::MissingKey)?;
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Arc::new(config))
    }
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        match self {
            TlsMaterial::Ephemeral { .. } => f.write_str("TlsMaterial::Ephemeral"),
            TlsMaterial::CaIssued { .. } => f.write_str("TlsMaterial::CaIssued"),
        }
    }
}

/// Daemon-side TLS credentials: the certificate PEM received at launch.
///
/// A single certificate is pinned byte-for-byte (the ephemeral mode); a
/// multi-certificate chain is verified against its root.
#[derive(Debug, Clone)]
pub struct TlsClientMaterial {
    certs_pem: String,
}

impl TlsClientMaterial {
    pub fn new(certs_pem: impl Into<String>) -> Self {
        Self {
            certs_pem: certs_pem.into(),
        }
    }

    /// Builds the rustls client configuration for dialing the host.
    pub(crate) fn client_config(&self) -> Result<Arc<ClientConfig>, TlsError> {
        let certs = parse_certs(&self.certs_pem)?;
        if certs.len() == 1 {
            let verifier = PinnedCertVerifier::new(certs.into_iter().next().expect("one cert"));
            let config = ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(verifier))
                .with_no_client_auth();
            return Ok(Arc::new(config));
        }

        let mut roots = RootCertStore::empty();
        for cert in certs {
            roots.add(cert)?;
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

/// Converts a URL host into a rustls server name.
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(host.to_string()).map_err(|_| TlsError::InvalidServerName(host.to_string()))
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut pem.as_bytes()).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates);
    }
    Ok(certs)
}

/// Verifier that accepts exactly the certificate embedded at launch.
#[derive(Debug)]
struct PinnedCertVerifier {
    pinned: CertificateDer<'static>,
    provider: Arc<CryptoProvider>,
}

impl PinnedCertVerifier {
    fn new(pinned: CertificateDer<'static>) -> Self {
        Self {
            pinned,
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        }
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.pinned.as_ref() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::UnknownIssuer,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_material_contains_pem_blocks() {
        let material =
            TlsMaterial::generate_ephemeral(&["localhost".to_string(), "127.0.0.1".to_string()])
                .unwrap();
        let pem = material.certificate_pem();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
        match &material {
            TlsMaterial::Ephemeral { key_pem, .. } => {
                assert!(key_pem.contains("PRIVATE KEY"));
            }
            _ => panic!("expected ephemeral material"),
        }
    }

    #[test]
    fn test_client_material_has_empty_key_placeholder() {
        let material = TlsMaterial::generate_ephemeral(&["localhost".to_string()]).unwrap();
        let bundle = material.client_material();
        assert!(bundle[0].starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(bundle[1].is_empty());
    }

    #[test]
    fn test_server_config_builds_from_ephemeral_material() {
        let material = TlsMaterial::generate_ephemeral(&["localhost".to_string()]).unwrap();
        assert!(material.server_config().is_ok());
    }

    #[test]
    fn test_client_config_pins_single_certificate() {
        let material = TlsMaterial::generate_ephemeral(&["localhost".to_string()]).unwrap();
        let client = TlsClientMaterial::new(material.certificate_pem());
        assert!(client.client_config().is_ok());
    }

    #[test]
    fn test_empty_pem_is_rejected() {
        let client = TlsClientMaterial::new("");
        assert!(matches!(
            client.client_config(),
            Err(TlsError::NoCertificates)
        ));
    }

    #[test]
    fn test_server_name_accepts_hostname_and_ip() {
        assert!(server_name("localhost").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("::1").is_ok());
    }
}
