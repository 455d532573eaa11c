// src/security/trust.rs

use anyhow::{anyhow, Context};
use base16ct::lower::encode_string;
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};
use rustls_pemfile::{certs, ec_private_keys, pkcs8_private_keys, rsa_private_keys};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Cursor;
use std::path::Path;

use crate::error::{Result, TransportError};

/// SHA-256 over the certificate's SubjectPublicKeyInfo, lower-case hex.
pub fn spki_fingerprint(cert: &CertificateDer<'_>) -> Option<String> {
    let der = cert.as_ref();
    match x509_parser::parse_x509_certificate(der) {
        Ok((_, parsed)) => {
            let spki = parsed.tbs_certificate.subject_pki.raw;
            let mut h = Sha256::new();
            h.update(spki);
            Some(encode_string(&h.finalize()))
        }
        Err(_) => {
            // Fallback: hash full DER so we still have a stable identifier
            let mut h = Sha256::new();
            h.update(der);
            Some(encode_string(&h.finalize()))
        }
    }
}

/// Compute SPKI fingerprint from PEM-encoded certificate bytes.
pub fn spki_fingerprint_from_pem_bytes(pem_bytes: &[u8]) -> anyhow::Result<String> {
    let mut cursor = Cursor::new(pem_bytes);
    let certificates = certs(&mut cursor).context("failed to parse certificate PEM")?;
    let first = certificates
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no certificate entries found"))?;
    let cert = CertificateDer::from(first);
    spki_fingerprint(&cert).ok_or_else(|| anyhow!("unable to compute SPKI fingerprint"))
}

/// Parse every certificate in a PEM buffer.
pub fn parse_certificates(pem_bytes: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut cursor = Cursor::new(pem_bytes);
    let list = certs(&mut cursor)
        .map_err(|e| TransportError::certificate(format!("invalid certificate PEM: {}", e)))?;
    Ok(list.into_iter().map(CertificateDer::from).collect())
}

/// Load a PEM certificate chain (leaf first).
pub fn load_certificates<P: AsRef<Path>>(path: P) -> Result<Vec<CertificateDer<'static>>> {
    let path = path.as_ref();
    let data = fs::read(path).map_err(|e| {
        TransportError::certificate(format!("cannot read {}: {}", path.display(), e))
    })?;
    let chain = parse_certificates(&data)?;
    if chain.is_empty() {
        return Err(TransportError::certificate(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(chain)
}

/// Parse the first private key in a PEM buffer. PKCS#8 is tried first,
/// then PKCS#1 (RSA) and SEC1 (EC).
pub fn parse_private_key(pem_bytes: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let bad = |e: std::io::Error| TransportError::certificate(format!("invalid key PEM: {}", e));
    if let Some(key) = pkcs8_private_keys(&mut Cursor::new(pem_bytes))
        .map_err(bad)?
        .into_iter()
        .next()
    {
        return Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key)));
    }
    if let Some(key) = rsa_private_keys(&mut Cursor::new(pem_bytes))
        .map_err(bad)?
        .into_iter()
        .next()
    {
        return Ok(PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(key)));
    }
    if let Some(key) = ec_private_keys(&mut Cursor::new(pem_bytes))
        .map_err(bad)?
        .into_iter()
        .next()
    {
        return Ok(PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(key)));
    }
    Err(TransportError::certificate("no private key found"))
}

pub fn load_private_key<P: AsRef<Path>>(path: P) -> Result<PrivateKeyDer<'static>> {
    let path = path.as_ref();
    let data = fs::read(path).map_err(|e| {
        TransportError::certificate(format!("cannot read {}: {}", path.display(), e))
    })?;
    parse_private_key(&data)
}

fn is_certificate_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("pem") || e.eq_ignore_ascii_case("crt"))
        .unwrap_or(false)
}

/// Load every certificate from the `.pem`/`.crt` files of a directory.
/// A missing directory yields an empty list. A file that cannot be read or
/// holds no parsable certificate is an error: trust material that exists
/// must never degrade into trusting any peer.
pub fn load_trusted_certificates<P: AsRef<Path>>(dir: P) -> Result<Vec<CertificateDer<'static>>> {
    let dir = dir.as_ref();
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    let entries = fs::read_dir(dir).map_err(|e| {
        TransportError::certificate(format!("cannot list {}: {}", dir.display(), e))
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            TransportError::certificate(format!("cannot list {}: {}", dir.display(), e))
        })?;
        let path = entry.path();
        if is_certificate_file(&path) {
            files.push(path);
        }
    }
    files.sort();
    for p in files {
        out.extend(load_certificates(&p)?);
    }
    Ok(out)
}
