//! TLS engines, handshake driving and the keystore / trust collaborators.

pub mod engine;
pub mod handshake;
pub mod locator;
pub mod provider;
pub mod trust;

pub use engine::{CipherStatus, SessionCipher, TlsEngine};
pub use handshake::HandshakeDriver;
pub use locator::{ResourceLocator, SearchPathLocator};
pub use provider::{resolve_provider, CertificateProvider, KeystoreProvider};
