//! TCP and TLS transports to the IRC server.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;

use crate::config::BotConfig;
use crate::connection::{ConnectFuture, Connector, Transport};
use crate::error::{BotError, Result};

/// Opens a fresh TCP (and usually TLS) stream on every call.
#[derive(Clone)]
pub struct ServerConnector {
    server: String,
    addr: String,
    tls: Option<TlsConnector>,
}

impl std::fmt::Debug for ServerConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnector")
            .field("addr", &self.addr)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl ServerConnector {
    /// Build the connector, loading the trust store up front so that a bad
    /// CA bundle is reported before the first connect.
    pub fn new(config: &BotConfig) -> Result<Self> {
        let tls = if config.tls {
            Some(TlsConnector::from(Arc::new(client_config(config)?)))
        } else {
            tracing::warn!("TLS disabled, connecting in plaintext");
            None
        };
        Ok(Self {
            server: config.server.clone(),
            addr: config.server_addr(),
            tls,
        })
    }

    async fn open(&self) -> Result<Transport> {
        tracing::debug!("Resolving {}...", self.addr);
        let tcp = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| BotError::Connect {
                addr: self.addr.clone(),
                source,
            })?;
        tracing::debug!("TCP connected to {}", self.addr);

        let Some(ref connector) = self.tls else {
            return Ok(Box::new(tcp));
        };
        let dns_name = rustls::pki_types::ServerName::try_from(self.server.clone())
            .map_err(|e| BotError::Tls(format!("invalid server name {}: {e}", self.server)))?;
        let stream = connector
            .connect(dns_name, tcp)
            .await
            .map_err(|e| BotError::Tls(format!("handshake with {} failed: {e}", self.addr)))?;
        tracing::debug!("TLS handshake complete");
        Ok(Box::new(stream))
    }
}

impl Connector for ServerConnector {
    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(self.open())
    }
}

fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// TLS settings for `config`.
///
/// Without a `ca_file` the bundled web roots are trusted. A `ca_file` that
/// cannot be loaded is fatal unless `tls_insecure_fallback` is set, in which
/// case certificate verification is switched off.
pub fn client_config(config: &BotConfig) -> Result<rustls::ClientConfig> {
    install_crypto_provider();

    let Some(ref path) = config.ca_file else {
        return Ok(default_config());
    };
    match load_root_store(path) {
        Ok(roots) => {
            tracing::info!(path = %path.display(), certs = roots.len(), "Loaded trust store");
            Ok(rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth())
        }
        Err(e) if config.tls_insecure_fallback => {
            tracing::warn!(
                error = %e,
                "TRUST STORE UNAVAILABLE: certificate and hostname verification are DISABLED \
                 (tls_insecure_fallback = true). The connection is open to interception."
            );
            Ok(insecure_config())
        }
        Err(e) => Err(e),
    }
}

pub fn load_root_store(path: &Path) -> Result<rustls::RootCertStore> {
    let trust_error = |source: std::io::Error| BotError::TrustStore {
        path: path.to_path_buf(),
        source,
    };
    let invalid = |msg: String| std::io::Error::new(std::io::ErrorKind::InvalidData, msg);

    let mut reader = BufReader::new(File::open(path).map_err(trust_error)?);
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(trust_error)?;
        roots
            .add(cert)
            .map_err(|e| trust_error(invalid(e.to_string())))?;
    }
    if roots.is_empty() {
        return Err(trust_error(invalid("no certificates found".into())));
    }
    Ok(roots)
}

fn default_config() -> rustls::ClientConfig {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

fn insecure_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
        .with_no_client_auth()
}

#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::CryptoProvider::get_default()
            .map(|p| p.signature_verification_algorithms.supported_schemes())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config_with_ca(path: PathBuf, fallback: bool) -> BotConfig {
        let mut config = BotConfig::new("irc.example.org", "bot", &["#a"]);
        config.ca_file = Some(path);
        config.tls_insecure_fallback = fallback;
        config
    }

    #[test]
    fn default_roots_without_ca_file() {
        let config = BotConfig::new("irc.example.org", "bot", &["#a"]);
        assert!(client_config(&config).is_ok());
    }

    #[test]
    fn missing_ca_file_is_fatal_without_opt_in() {
        let config = config_with_ca(PathBuf::from("/nonexistent/ca.pem"), false);
        assert!(matches!(
            client_config(&config),
            Err(BotError::TrustStore { .. })
        ));
    }

    #[test]
    fn missing_ca_file_falls_back_when_opted_in() {
        let config = config_with_ca(PathBuf::from("/nonexistent/ca.pem"), true);
        assert!(client_config(&config).is_ok());
    }

    #[test]
    fn ca_file_without_certificates_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "not a certificate\n").unwrap();
        assert!(matches!(
            load_root_store(&path),
            Err(BotError::TrustStore { .. })
        ));
    }

    #[test]
    fn plaintext_connector_needs_no_trust_store() {
        let mut config = config_with_ca(PathBuf::from("/nonexistent/ca.pem"), false);
        config.tls = false;
        let connector = ServerConnector::new(&config).unwrap();
        assert!(connector.tls.is_none());
        assert_eq!(connector.addr, "irc.example.org:6697");
    }
}
