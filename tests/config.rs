// tests/config.rs
// TOML configuration, resolved reactor settings and keystore lookup.

mod common;

use std::fs;
use std::time::Duration;

use agentlink::config::{Config, EncryptionConfig, EncryptionPaths, ReactorSettings};
use agentlink::constants::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_WORKERS, HANDSHAKE_TIMEOUT};
use agentlink::events::LogLevel;
use agentlink::security::trust::{
    load_certificates, load_private_key, load_trusted_certificates, spki_fingerprint,
    spki_fingerprint_from_pem_bytes,
};
use agentlink::security::{CertificateProvider, KeystoreProvider, ResourceLocator, SearchPathLocator};
use agentlink::TransportError;
use common::{scratch, Pki};
use std::str::FromStr;

const FULL: &str = r#"
[reactor]
workers = 3
select_timeout_ms = 20
handshake_timeout_ms = 2500
max_message_size = 1048576
worker_keep_alive_secs = 5
max_handshake_threads = 8

[server]
bind = "127.0.0.1:9443"

[client]
host = "agent.local"
port = 9443
server_name = "mgmt"
connect_timeout_ms = 750

[encryption]
search_paths = ["/etc/agentlink", "pki"]
ephemeral_identity = false
  [encryption.paths]
  own_certificate = "own/cert.pem"
  own_private_key = "own/key.pem"
  trusted_cert_dir = "trusted/certs"

[logging]
json_path = "logs/test.jsonl"
console_level = "warn"
"#;

#[test]
fn full_configuration_parses_and_resolves() {
    let cfg = Config::from_toml_str(FULL).expect("parse");
    let settings = ReactorSettings::from_config(&cfg);
    assert_eq!(settings.workers, 3);
    assert_eq!(settings.select_timeout, Duration::from_millis(20));
    assert_eq!(settings.handshake_timeout, Duration::from_millis(2500));
    assert_eq!(settings.max_message_size, 1_048_576);
    assert_eq!(settings.worker_keep_alive, Duration::from_secs(5));
    assert_eq!(settings.max_handshake_threads, 8);
    assert_eq!(settings.connect_timeout, Duration::from_millis(750));

    assert_eq!(cfg.server_bind_addr().unwrap().port(), 9443);
    let client = cfg.client.as_ref().unwrap();
    assert_eq!(client.host, "agent.local");
    assert_eq!(client.server_name.as_deref(), Some("mgmt"));

    let enc = cfg.encryption_or_default();
    assert_eq!(enc.ephemeral_identity, Some(false));
    assert_eq!(
        enc.paths.unwrap().trusted_cert_dir.as_deref(),
        Some("trusted/certs")
    );
    let logging = cfg.logging.unwrap();
    assert_eq!(
        logging.console_level.as_deref().map(LogLevel::from_str),
        Some(Ok(LogLevel::Warn))
    );
}

#[test]
fn empty_configuration_uses_defaults() {
    let cfg = Config::from_toml_str("").unwrap();
    let settings = ReactorSettings::from_config(&cfg);
    assert_eq!(settings.workers, DEFAULT_WORKERS);
    assert_eq!(settings.handshake_timeout, HANDSHAKE_TIMEOUT);
    assert_eq!(settings.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
    assert_eq!(settings.select_timeout, Duration::from_millis(50));
    assert_eq!(cfg.server_bind_addr().unwrap().to_string(), "0.0.0.0:8250");

    let enc = cfg.encryption_or_default();
    assert_eq!(enc.ephemeral_identity, Some(true));
    assert_eq!(enc.search_paths, Some(vec!["pki".to_string()]));
}

#[test]
fn zero_workers_fall_back_to_default() {
    let cfg = Config::from_toml_str("[reactor]\nworkers = 0\n").unwrap();
    assert_eq!(ReactorSettings::from_config(&cfg).workers, DEFAULT_WORKERS);
    assert_eq!(ReactorSettings::default().with_workers(0).workers, 1);
}

#[test]
fn zero_select_timeout_is_clamped() {
    let cfg = Config::from_toml_str("[reactor]\nselect_timeout_ms = 0\n").unwrap();
    assert_eq!(
        ReactorSettings::from_config(&cfg).select_timeout,
        Duration::from_millis(1)
    );
}

#[test]
fn invalid_inputs_are_reported() {
    assert!(Config::from_toml_str("[reactor\nworkers = 1").is_err());
    let cfg = Config::from_toml_str("[server]\nbind = \"not-an-address\"\n").unwrap();
    assert!(cfg.server_bind_addr().is_err());
}

#[test]
fn missing_file_loads_defaults_but_broken_file_fails() {
    let dir = scratch("config-files");
    let absent = dir.join("absent.toml");
    assert!(Config::load(&absent).is_err());
    assert!(Config::load_or_default(&absent).unwrap().server.is_none());

    let broken = dir.join("broken.toml");
    fs::write(&broken, "[server]\nbind = 7\n").unwrap();
    assert!(Config::load_or_default(&broken).is_err());

    let good = dir.join("good.toml");
    fs::write(&good, FULL).unwrap();
    assert_eq!(Config::load(&good).unwrap().client.unwrap().port, 9443);
}

#[test]
fn locator_searches_paths_in_order() {
    let dir = scratch("locator");
    let first = dir.join("first");
    let second = dir.join("second");
    fs::create_dir_all(first.join("own")).unwrap();
    fs::create_dir_all(second.join("own")).unwrap();
    fs::write(second.join("own/cert.pem"), "second").unwrap();
    fs::write(second.join("own/key.pem"), "second").unwrap();
    fs::write(first.join("own/key.pem"), "first").unwrap();

    let locator = SearchPathLocator::new([&first, &second]);
    assert_eq!(locator.search_paths().len(), 2);
    assert_eq!(locator.locate("own/cert.pem"), Some(second.join("own/cert.pem")));
    assert_eq!(locator.locate("own/key.pem"), Some(first.join("own/key.pem")));
    assert_eq!(locator.locate("own/missing.pem"), None);
    assert_eq!(locator.locate(""), None);

    let absolute = second.join("own/cert.pem");
    let found = locator.locate(absolute.to_str().unwrap());
    assert_eq!(found, Some(absolute));
    assert_eq!(locator.locate(dir.join("nope.pem").to_str().unwrap()), None);
}

/// Lay out a keystore below `dir` the way the configuration expects it.
fn write_keystore(dir: &std::path::Path, pki: &Pki) -> String {
    let leaf = pki.issue(&["localhost"]);
    fs::create_dir_all(dir.join("own")).unwrap();
    fs::create_dir_all(dir.join("trusted/certs")).unwrap();
    fs::write(dir.join("own/cert.pem"), &leaf.cert_pem).unwrap();
    fs::write(dir.join("own/key.pem"), &leaf.key_pem).unwrap();
    fs::write(dir.join("trusted/certs/ca.pem"), pki.ca_pem()).unwrap();
    fs::write(dir.join("trusted/certs/README.txt"), "ignored").unwrap();
    leaf.cert_pem
}

fn keystore_config(dir: &std::path::Path, ephemeral: bool) -> EncryptionConfig {
    EncryptionConfig {
        search_paths: Some(vec![dir.to_string_lossy().into_owned()]),
        paths: Some(EncryptionPaths {
            own_certificate: Some("own/cert.pem".into()),
            own_private_key: Some("own/key.pem".into()),
            trusted_cert_dir: Some("trusted/certs".into()),
        }),
        ephemeral_identity: Some(ephemeral),
        ephemeral_names: None,
    }
}

#[test]
fn keystore_loads_through_search_paths() {
    let dir = scratch("keystore");
    let pki = Pki::new("keystore ca");
    let cert_pem = write_keystore(&dir, &pki);

    let provider = KeystoreProvider::from_config(&keystore_config(&dir, false)).expect("keystore");
    assert!(!provider.is_permissive());
    assert_eq!(provider.trusted_certificates(), vec![pki.ca_der()]);
    assert!(provider.description().starts_with("keystore"));
    assert_eq!(
        provider.local_fingerprint().map(str::to_string),
        Some(spki_fingerprint_from_pem_bytes(cert_pem.as_bytes()).unwrap())
    );
    assert!(provider.server_engine().is_ok());
    assert!(provider.client_engine("localhost").is_ok());
}

#[test]
fn missing_keystore_without_ephemeral_fallback_fails() {
    let dir = scratch("keystore-missing");
    match KeystoreProvider::from_config(&keystore_config(&dir, false)) {
        Err(TransportError::Certificate(_)) => {}
        other => panic!("expected certificate error, got {:?}", other.map(|_| ())),
    }

    let fallback = KeystoreProvider::from_config(&keystore_config(&dir, true)).unwrap();
    assert!(fallback.is_permissive());
    assert_eq!(fallback.description(), "ephemeral identity");
}

#[test]
fn pem_helpers_read_what_was_written() {
    let dir = scratch("pem");
    let pki = Pki::new("pem ca");
    write_keystore(&dir, &pki);

    let chain = load_certificates(dir.join("own/cert.pem")).unwrap();
    assert_eq!(chain.len(), 1);
    assert!(spki_fingerprint(&chain[0]).is_some());
    assert!(load_private_key(dir.join("own/key.pem")).is_ok());
    assert_eq!(load_trusted_certificates(dir.join("trusted/certs")).unwrap().len(), 1);
    assert!(load_trusted_certificates(dir.join("no-such-dir")).unwrap().is_empty());
    assert!(matches!(
        load_private_key(dir.join("own/cert.pem")),
        Err(TransportError::Certificate(_))
    ));
}

#[test]
fn damaged_trust_anchor_refuses_to_build_a_provider() {
    let dir = scratch("keystore-damaged-trust");
    let pki = Pki::new("damaged ca");
    write_keystore(&dir, &pki);
    fs::write(
        dir.join("trusted/certs/ca.pem"),
        "-----BEGIN CERTIFICATE-----\n!!!not base64!!!\n-----END CERTIFICATE-----\n",
    )
    .unwrap();

    for ephemeral in [false, true] {
        match KeystoreProvider::from_config(&keystore_config(&dir, ephemeral)) {
            Err(TransportError::Certificate(_)) => {}
            other => panic!(
                "expected certificate error, got permissive={:?}",
                other.map(|p| p.is_permissive())
            ),
        }
    }
    assert!(matches!(
        load_trusted_certificates(dir.join("trusted/certs")),
        Err(TransportError::Certificate(_))
    ));
}

#[test]
fn trust_file_without_certificates_is_rejected() {
    let dir = scratch("trust-empty-file");
    fs::write(dir.join("empty.crt"), "").unwrap();
    assert!(matches!(
        load_trusted_certificates(&dir),
        Err(TransportError::Certificate(_))
    ));
}
