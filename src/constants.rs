//! Central place for wire constants, timeouts and pool sizing defaults.

use std::time::Duration;

/// Application name used in logs and generated certificates
pub const DEFAULT_APP_NAME: &str = "agentlink";

/// Application / crate version (populated from Cargo.toml via env! macro)
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Size of the chunk header preceding every ciphertext chunk on the wire.
pub const CHUNK_HEADER_LEN: usize = 4;

/// Header bit signalling that more chunks follow for the current logical message.
pub const CONTINUATION_FLAG: u32 = 0x1_0000;

/// Mask selecting the ciphertext length from a chunk header.
pub const CHUNK_LENGTH_MASK: u32 = 0xFFFF;

/// Largest ciphertext length a chunk header may declare.
pub const MAX_CHUNK_SIZE: usize = 18_000;

/// Plaintext accepted by one wrap call. One full TLS record plus overhead stays
/// below `MAX_CHUNK_SIZE`.
pub const MAX_PLAINTEXT_PER_WRAP: usize = 16_384;

/// Size of the length prefix carried inside every logical message's plaintext.
pub const MESSAGE_HEADER_LEN: usize = 4;

/// Default cap on a reassembled logical message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// TLS record header (content type, version, length).
pub const TLS_RECORD_HEADER_LEN: usize = 5;

/// Largest TLS ciphertext record body allowed by RFC 8446 / RFC 5246.
pub const MAX_TLS_RECORD_BODY: usize = 16_384 + 2_048;

/// Reactor readiness wait; bounds reaction time to queued changes and shutdown.
pub const SELECT_TIMEOUT: Duration = Duration::from_millis(50);

/// Wall-clock budget for a TLS handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Default TCP connect timeout for the client variant.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default base number of worker threads.
pub const DEFAULT_WORKERS: usize = 5;

/// The worker pool may grow to `workers * WORKER_GROWTH_FACTOR` threads.
pub const WORKER_GROWTH_FACTOR: usize = 5;

/// Idle worker threads are reaped after this long.
pub const WORKER_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Upper bound on concurrent server-side handshakes.
pub const MAX_HANDSHAKE_THREADS: usize = 256;

/// Readiness events fetched per reactor iteration.
pub const EVENTS_CAPACITY: usize = 256;

/// Human friendly composite version string used in logs.
pub fn full_version() -> String {
    format!(
        "v{} (chunk_max={} continuation=0x{:x})",
        APP_VERSION, MAX_CHUNK_SIZE, CONTINUATION_FLAG
    )
}
