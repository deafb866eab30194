/// TLS client context for the stream transport
use crate::config::TlsSettings;
use crate::infrastructure::protocols::sip::transport::TransportError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

/// Connector plus the name presented for SNI and certificate checks
#[derive(Clone)]
pub struct TlsClientContext {
    pub connector: TlsConnector,
    pub server_name: ServerName<'static>,
}

impl std::fmt::Debug for TlsClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsClientContext")
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl TlsClientContext {
    /// Build the client context for `host`
    pub fn new(settings: &TlsSettings, host: &str) -> Result<Self, TransportError> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

        let roots = match &settings.ca_bundle_path {
            Some(path) => load_ca_bundle(path)?,
            None => {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                roots
            }
        };

        let mut config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::TlsInit(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        if settings.accept_invalid_certs {
            warn!("TLS certificate verification disabled for {}", host);
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)));
        }

        let name = settings.server_name.as_deref().unwrap_or(host).to_string();
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| TransportError::TlsInit(format!("Invalid server name: {}", name)))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }
}

fn load_ca_bundle(path: &Path) -> Result<RootCertStore, TransportError> {
    let file = File::open(path).map_err(|e| {
        TransportError::TlsInit(format!("Cannot open CA bundle {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| TransportError::TlsInit(e.to_string()))?;
        roots
            .add(cert)
            .map_err(|e| TransportError::TlsInit(e.to_string()))?;
    }
    if roots.is_empty() {
        return Err(TransportError::TlsInit(format!(
            "No certificates in CA bundle {}",
            path.display()
        )));
    }
    info!("Loaded {} CA certificates from {}", roots.len(), path.display());
    Ok(roots)
}

/// Accepts any server certificate; signatures are still checked
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
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
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
