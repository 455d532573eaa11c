//! Error types for the transport layer

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by framing, TLS processing and engine lifecycle.
///
/// Per-connection variants (everything except the lifecycle ones) are handled
/// inside the reactor and surface to consumers only as a Disconnect task.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The connection has no live registration (not yet registered, or terminated)
    #[error("channel closed")]
    ChannelClosed,

    /// The peer closed the stream
    #[error("peer closed the connection")]
    PeerClosed,

    /// A chunk header used bits outside the length and continuation fields
    #[error("malformed chunk header 0x{0:08x}")]
    MalformedHeader(u32),

    /// A chunk header declared more ciphertext than a chunk may carry
    #[error("chunk of {len} bytes exceeds maximum of {max}")]
    ChunkTooLarge { len: usize, max: usize },

    /// Reassembly exceeded the configured logical message cap
    #[error("message exceeds maximum of {max} bytes")]
    MessageTooLarge { max: usize },

    /// The reassembled plaintext does not match its own length prefix
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// rustls rejected a record or handshake message
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// The TLS engine reported a non-nominal status
    #[error("tls engine error: {0}")]
    Engine(String),

    /// The handshake did not complete within its wall-clock budget
    #[error("tls handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The listening socket could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The client could not reach its peer
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A host name did not resolve to any address
    #[error("cannot resolve {0}")]
    Resolve(String),

    /// Certificate or key material could not be loaded or used
    #[error("certificate error: {0}")]
    Certificate(String),

    /// No registered connection exists for the peer address
    #[error("no connection registered for {0}")]
    UnknownPeer(SocketAddr),

    /// The engine is not started
    #[error("engine not running")]
    NotRunning,

    /// `start()` was called twice
    #[error("engine already running")]
    AlreadyRunning,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Create an engine error with the given message
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    /// Create a certificate error with the given message
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate(msg.into())
    }

    /// Create a malformed message error with the given message
    pub fn malformed_message(msg: impl Into<String>) -> Self {
        Self::MalformedMessage(msg.into())
    }

    /// Whether this error stems from the peer going away rather than a protocol fault.
    pub fn is_peer_gone(&self) -> bool {
        match self {
            Self::PeerClosed => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type Result<T, E = TransportError> = std::result::Result<T, E>;
