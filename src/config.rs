use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::constants::{
    CONNECT_TIMEOUT, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_WORKERS, HANDSHAKE_TIMEOUT,
    MAX_HANDSHAKE_THREADS, SELECT_TIMEOUT, WORKER_KEEP_ALIVE,
};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EncryptionPaths {
    /// PEM certificate chain presented to peers (leaf first)
    pub own_certificate: Option<String>,
    /// PEM private key (PKCS#8, PKCS#1 or SEC1)
    pub own_private_key: Option<String>,
    /// Directory of PEM certificates trusted to sign peer certificates
    pub trusted_cert_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncryptionConfig {
    /// Directories searched for relative keystore paths (in order)
    pub search_paths: Option<Vec<String>>,
    pub paths: Option<EncryptionPaths>,
    /// Generate a throwaway self-signed identity when no keystore is configured
    pub ephemeral_identity: Option<bool>,
    /// Extra DNS names / IPs placed in an ephemeral identity's SAN list
    pub ephemeral_names: Option<Vec<String>>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            search_paths: Some(vec!["pki".to_string()]),
            paths: Some(EncryptionPaths::default()),
            ephemeral_identity: Some(true),
            ephemeral_names: Some(vec!["localhost".to_string()]),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ReactorConfig {
    /// Base worker count; the pool may grow to 5x under load
    pub workers: Option<usize>,
    pub select_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    /// Cap on a reassembled logical message in bytes
    pub max_message_size: Option<usize>,
    pub worker_keep_alive_secs: Option<u64>,
    pub max_handshake_threads: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address (host:port)
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8250".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Name checked against the server certificate when trust material is configured
    pub server_name: Option<String>,
    pub connect_timeout_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8250,
            server_name: Some("localhost".to_string()),
            connect_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Path to JSON line event log (rotated). If unset, defaults to logs/agentlink.jsonl
    pub json_path: Option<String>,
    /// Max size in bytes before rotation (default 5MB)
    pub json_max_bytes: Option<usize>,
    /// Number of rotated files to retain (default 3)
    pub json_rotate: Option<u32>,
    /// Disable console sink (default false)
    pub disable_console: Option<bool>,
    /// Minimum level printed on the console: trace | debug | info | warn | error
    pub console_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    pub reactor: Option<ReactorConfig>,
    pub server: Option<ServerConfig>,
    pub client: Option<ClientConfig>,
    pub encryption: Option<EncryptionConfig>,
    /// Logging / events configuration
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        toml::from_str::<Config>(content).context("failed to parse configuration")
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Load `path` if it exists, otherwise fall back to defaults. A file that
    /// exists but does not parse is still an error.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn encryption_or_default(&self) -> EncryptionConfig {
        self.encryption.clone().unwrap_or_default()
    }

    pub fn server_bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let bind = self.server.clone().unwrap_or_default().bind;
        bind.parse::<SocketAddr>()
            .with_context(|| format!("invalid server.bind address '{}'", bind))
    }
}

/// Reactor tuning with every default resolved.
#[derive(Debug, Clone)]
pub struct ReactorSettings {
    pub workers: usize,
    pub select_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_message_size: usize,
    pub worker_keep_alive: Duration,
    pub max_handshake_threads: usize,
    pub connect_timeout: Duration,
}

impl Default for ReactorSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            select_timeout: SELECT_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            worker_keep_alive: WORKER_KEEP_ALIVE,
            max_handshake_threads: MAX_HANDSHAKE_THREADS,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl ReactorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        let d = Self::default();
        let r = cfg.reactor.clone().unwrap_or_default();
        let connect_timeout = cfg
            .client
            .as_ref()
            .and_then(|c| c.connect_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(d.connect_timeout);
        Self {
            workers: r.workers.filter(|w| *w > 0).unwrap_or(d.workers),
            select_timeout: r
                .select_timeout_ms
                .map(|ms| Duration::from_millis(ms.max(1)))
                .unwrap_or(d.select_timeout),
            handshake_timeout: r
                .handshake_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(d.handshake_timeout),
            max_message_size: r.max_message_size.unwrap_or(d.max_message_size),
            worker_keep_alive: r
                .worker_keep_alive_secs
                .map(Duration::from_secs)
                .unwrap_or(d.worker_keep_alive),
            max_handshake_threads: r
                .max_handshake_threads
                .filter(|n| *n > 0)
                .unwrap_or(d.max_handshake_threads),
            connect_timeout,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}
