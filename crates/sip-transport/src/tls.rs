//! TLS setup for the TLS and WSS protocols.
//!
//! Certificates and keys are PEM files. Client configs trust the
//! `webpki-roots` bundle plus an optional CA file; certificate checks can be
//! switched off with [`CertVerification::Insecure`] for test setups.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::warn;

use crate::config::{CertVerification, TlsClientConfig, TlsServerConfig};
use crate::error::{Error, Result};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::tls(format!("open {}: {}", path.display(), e)))
}

/// Reads every certificate of a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::tls(format!("read certificates from {}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(Error::tls(format!("no certificate found in {}", path.display())));
    }
    Ok(certs)
}

/// Reads the first PKCS#1, PKCS#8 or SEC1 private key of a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::tls(format!("read private key from {}: {}", path.display(), e)))?
        .ok_or_else(|| Error::tls(format!("no private key found in {}", path.display())))
}

pub fn server_config(config: &TlsServerConfig) -> Result<ServerConfig> {
    let certs = load_certs(&config.cert_path)?;
    let key = load_private_key(&config.key_path)?;

    ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(Error::tls)?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(Error::tls)
}

pub fn client_config(config: &TlsClientConfig) -> Result<ClientConfig> {
    let provider = provider();

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(path) = &config.ca_path {
        for cert in load_certs(path)? {
            roots.add(cert).map_err(Error::tls)?;
        }
    }

    let mut client = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(Error::tls)?
        .with_root_certificates(roots)
        .with_no_client_auth();

    if config.verification == CertVerification::Insecure {
        warn!("TLS server certificate verification is disabled");
        client
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }));
    }

    Ok(client)
}

pub fn acceptor(config: &TlsServerConfig) -> Result<TlsAcceptor> {
    Ok(TlsAcceptor::from(Arc::new(server_config(config)?)))
}

pub fn connector(config: &TlsClientConfig) -> Result<TlsConnector> {
    Ok(TlsConnector::from(Arc::new(client_config(config)?)))
}

/// SNI name for a host name or IP literal.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host)
        .map(|name| name.to_owned())
        .map_err(|e| Error::tls(format!("invalid server name {}: {}", host, e)))
}

/// Verifier that accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_self_signed(name: &str) -> (PathBuf, PathBuf) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = std::env::temp_dir().join(format!("sipflow-tls-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
        std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn test_server_config_from_pem_files() {
        let (cert_path, key_path) = write_self_signed("server");
        assert_eq!(load_certs(&cert_path).unwrap().len(), 1);
        assert!(server_config(&TlsServerConfig::new(&cert_path, &key_path)).is_ok());

        // a certificate file holds no key
        assert!(load_private_key(&cert_path).is_err());
    }

    #[test]
    fn test_missing_files() {
        let err = load_certs(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
        assert!(acceptor(&TlsServerConfig::new("/nonexistent/a", "/nonexistent/b")).is_err());
    }

    #[test]
    fn test_client_config_with_custom_ca() {
        let (cert_path, _) = write_self_signed("ca");
        assert!(client_config(&TlsClientConfig::default().with_ca_path(&cert_path)).is_ok());
        assert!(client_config(&TlsClientConfig::insecure()).is_ok());
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("not a host").is_err());
    }
}
