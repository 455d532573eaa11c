// src/security/provider.rs

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme};

use crate::config::EncryptionConfig;
use crate::error::{Result, TransportError};
use crate::events::{emit_system_event, LogLevel};
use crate::security::engine::TlsEngine;
use crate::security::locator::{ResourceLocator, SearchPathLocator};
use crate::security::trust::{
    load_certificates, load_private_key, load_trusted_certificates, spki_fingerprint,
};

/// Builds pre-configured TLS engines and exposes the trust material behind them.
pub trait CertificateProvider: Send + Sync {
    fn server_engine(&self) -> Result<TlsEngine>;
    fn client_engine(&self, server_name: &str) -> Result<TlsEngine>;
    fn trusted_certificates(&self) -> Vec<CertificateDer<'static>>;
    fn description(&self) -> String {
        "certificate provider".to_string()
    }
}

/// Use the supplied certificate service when there is one, else the local keystore.
pub fn resolve_provider(
    service: Option<Arc<dyn CertificateProvider>>,
    cfg: &EncryptionConfig,
) -> Result<Arc<dyn CertificateProvider>> {
    match service {
        Some(s) => Ok(s),
        None => Ok(Arc::new(KeystoreProvider::from_config(cfg)?)),
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Identity and trust material loaded from PEM files (or generated on the fly).
///
/// With no trusted certificates at all, both directions accept any peer
/// certificate. Handshake signatures are still checked, so the peer must hold
/// the key it presents, but its identity is not authenticated.
pub struct KeystoreProvider {
    server: Arc<rustls::ServerConfig>,
    client: Arc<rustls::ClientConfig>,
    trusted: Vec<CertificateDer<'static>>,
    fingerprint: Option<String>,
    description: String,
}

impl std::fmt::Debug for KeystoreProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystoreProvider")
            .field("description", &self.description)
            .field("trusted", &self.trusted.len())
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl KeystoreProvider {
    pub fn from_config(cfg: &EncryptionConfig) -> Result<Self> {
        Self::with_locator(cfg, &SearchPathLocator::from_config(cfg))
    }

    pub fn with_locator(cfg: &EncryptionConfig, locator: &dyn ResourceLocator) -> Result<Self> {
        let paths = cfg.paths.clone().unwrap_or_default();
        let trusted = match paths
            .trusted_cert_dir
            .as_deref()
            .and_then(|d| locator.locate(d))
        {
            Some(dir) => load_trusted_certificates(dir)?,
            None => Vec::new(),
        };
        let cert = paths
            .own_certificate
            .as_deref()
            .and_then(|n| locator.locate(n));
        let key = paths
            .own_private_key
            .as_deref()
            .and_then(|n| locator.locate(n));
        match (cert, key) {
            (Some(cert), Some(key)) => {
                let mut provider =
                    Self::from_parts(load_certificates(&cert)?, load_private_key(&key)?, trusted)?;
                provider.description = format!("keystore {}", cert.display());
                Ok(provider)
            }
            _ if cfg.ephemeral_identity.unwrap_or(true) => {
                let names = cfg
                    .ephemeral_names
                    .clone()
                    .unwrap_or_else(|| vec!["localhost".to_string()]);
                emit_system_event(
                    "security",
                    LogLevel::Warn,
                    "ephemeral_identity",
                    Some(format!("no keystore found, generated identity for {:?}", names)),
                );
                Self::ephemeral(&names, trusted)
            }
            _ => Err(TransportError::certificate(
                "no keystore certificate/key found and ephemeral identity disabled",
            )),
        }
    }

    /// Generate a throwaway self-signed identity for `names`.
    pub fn ephemeral<S: AsRef<str>>(
        names: &[S],
        trusted: Vec<CertificateDer<'static>>,
    ) -> Result<Self> {
        let names: Vec<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
        let generated = rcgen::generate_simple_self_signed(names)
            .map_err(|e| TransportError::certificate(format!("identity generation: {}", e)))?;
        let chain = vec![generated.cert.der().clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            generated.key_pair.serialize_der(),
        ));
        let mut provider = Self::from_parts(chain, key, trusted)?;
        provider.description = "ephemeral identity".to_string();
        Ok(provider)
    }

    pub fn from_parts(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        trusted: Vec<CertificateDer<'static>>,
    ) -> Result<Self> {
        if chain.is_empty() {
            return Err(TransportError::certificate("empty certificate chain"));
        }
        let crypto = crypto_provider();
        if trusted.is_empty() {
            emit_system_event(
                "security",
                LogLevel::Warn,
                "trust_any_peer",
                Some("no trusted certificates configured; any peer certificate is accepted".into()),
            );
        }
        let fingerprint = chain.first().and_then(spki_fingerprint);
        let server = server_config(&crypto, chain.clone(), key.clone_key(), &trusted)?;
        let client = client_config(&crypto, chain, key, &trusted)?;
        Ok(Self {
            server,
            client,
            trusted,
            fingerprint,
            description: "keystore".to_string(),
        })
    }

    /// SPKI fingerprint of the local leaf certificate.
    pub fn local_fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    /// True when peers are accepted without trust material.
    pub fn is_permissive(&self) -> bool {
        self.trusted.is_empty()
    }
}

impl CertificateProvider for KeystoreProvider {
    fn server_engine(&self) -> Result<TlsEngine> {
        TlsEngine::server(self.server.clone())
    }

    fn client_engine(&self, server_name: &str) -> Result<TlsEngine> {
        TlsEngine::client(self.client.clone(), server_name)
    }

    fn trusted_certificates(&self) -> Vec<CertificateDer<'static>> {
        self.trusted.clone()
    }

    fn description(&self) -> String {
        self.description.clone()
    }
}

fn root_store(trusted: &[CertificateDer<'static>]) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in trusted {
        roots
            .add(cert.clone())
            .map_err(|e| TransportError::certificate(format!("unusable trust anchor: {}", e)))?;
    }
    Ok(roots)
}

fn server_config(
    crypto: &Arc<CryptoProvider>,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    trusted: &[CertificateDer<'static>],
) -> Result<Arc<rustls::ServerConfig>> {
    let builder = rustls::ServerConfig::builder_with_provider(crypto.clone())
        .with_safe_default_protocol_versions()?;
    let builder = if trusted.is_empty() {
        builder.with_client_cert_verifier(Arc::new(AnyClientCert::new(crypto)))
    } else {
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(root_store(trusted)?), crypto.clone())
                .build()
                .map_err(|e| TransportError::certificate(e.to_string()))?;
        builder.with_client_cert_verifier(verifier)
    };
    let mut cfg = builder.with_single_cert(chain, key)?;
    // Tickets would arrive as unframed records after the handshake.
    cfg.send_tls13_tickets = 0;
    Ok(Arc::new(cfg))
}

fn client_config(
    crypto: &Arc<CryptoProvider>,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    trusted: &[CertificateDer<'static>],
) -> Result<Arc<rustls::ClientConfig>> {
    let builder = rustls::ClientConfig::builder_with_provider(crypto.clone())
        .with_safe_default_protocol_versions()?;
    let builder = if trusted.is_empty() {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AnyServerCert::new(crypto)))
    } else {
        builder.with_root_certificates(root_store(trusted)?)
    };
    Ok(Arc::new(builder.with_client_auth_cert(chain, key)?))
}

/// Accepts any server certificate; signatures are still verified.
#[derive(Debug)]
struct AnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AnyServerCert {
    fn new(crypto: &CryptoProvider) -> Self {
        Self {
            algorithms: crypto.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AnyServerCert {
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
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Requires a client certificate but accepts any; signatures are still verified.
#[derive(Debug)]
struct AnyClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AnyClientCert {
    fn new(crypto: &CryptoProvider) -> Self {
        Self {
            algorithms: crypto.signature_verification_algorithms,
        }
    }
}

impl ClientCertVerifier for AnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
