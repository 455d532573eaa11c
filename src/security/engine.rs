//! Protocol-only TLS engine driven over caller-owned buffers.

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::ServerName;

use crate::constants::MAX_PLAINTEXT_PER_WRAP;
use crate::error::{Result, TransportError};
use crate::events::ConnectionRole;
use crate::security::trust::spki_fingerprint;

/// Result of feeding ciphertext to a [`SessionCipher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherStatus {
    Open,
    /// The peer sent close_notify; no further plaintext will arrive.
    Closed,
}

/// Record protection used by the framing layer.
///
/// `wrap` consumes a bounded prefix of `plaintext` and appends the resulting
/// ciphertext to `out`, returning how many plaintext bytes were taken.
/// `unwrap` consumes all of `ciphertext` and appends whatever plaintext it
/// yields, which may be nothing when a record is still incomplete.
pub trait SessionCipher {
    fn wrap(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<usize>;
    fn unwrap(&mut self, ciphertext: &[u8], plaintext: &mut Vec<u8>) -> Result<CipherStatus>;
}

/// A rustls session (client or server side) that never touches a socket.
pub struct TlsEngine {
    conn: rustls::Connection,
}

impl std::fmt::Debug for TlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsEngine")
            .field("role", &self.role())
            .field("handshaking", &self.is_handshaking())
            .finish()
    }
}

impl TlsEngine {
    pub fn server(config: Arc<rustls::ServerConfig>) -> Result<Self> {
        let conn = rustls::ServerConnection::new(config)?;
        Ok(Self { conn: conn.into() })
    }

    pub fn client(config: Arc<rustls::ClientConfig>, server_name: &str) -> Result<Self> {
        let name = ServerName::try_from(server_name)
            .map_err(|e| {
                TransportError::certificate(format!("invalid server name '{}': {}", server_name, e))
            })?
            .to_owned();
        let conn = rustls::ClientConnection::new(config, name)?;
        Ok(Self { conn: conn.into() })
    }

    pub fn role(&self) -> ConnectionRole {
        match self.conn {
            rustls::Connection::Client(_) => ConnectionRole::Outbound,
            rustls::Connection::Server(_) => ConnectionRole::Inbound,
        }
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    pub fn wants_read(&self) -> bool {
        self.conn.wants_read()
    }

    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Feed ciphertext from `rd` without processing it.
    pub fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        self.conn.read_tls(rd)
    }

    /// Move pending ciphertext into `wr`.
    pub fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        self.conn.write_tls(wr)
    }

    /// Run the crypto step over everything fed so far.
    pub fn process(&mut self) -> Result<rustls::IoState> {
        Ok(self.conn.process_new_packets()?)
    }

    pub fn send_close_notify(&mut self) {
        self.conn.send_close_notify();
    }

    pub fn peer_fingerprint(&self) -> Option<String> {
        self.conn
            .peer_certificates()
            .and_then(|chain| chain.first())
            .and_then(spki_fingerprint)
    }

    pub fn protocol(&self) -> Option<String> {
        self.conn.protocol_version().map(|v| format!("{:?}", v))
    }

    fn drain_plaintext(&mut self, pending: usize, plaintext: &mut Vec<u8>) -> Result<()> {
        if pending == 0 {
            return Ok(());
        }
        let start = plaintext.len();
        plaintext.resize(start + pending, 0);
        self.conn.reader().read_exact(&mut plaintext[start..])?;
        Ok(())
    }
}

impl SessionCipher for TlsEngine {
    fn wrap(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        let take = plaintext.len().min(MAX_PLAINTEXT_PER_WRAP);
        let consumed = if take > 0 {
            self.conn.writer().write(&plaintext[..take])?
        } else {
            0
        };
        if take > 0 && consumed == 0 {
            return Err(TransportError::engine("tls engine accepted no plaintext"));
        }
        while self.conn.wants_write() {
            self.conn.write_tls(out)?;
        }
        Ok(consumed)
    }

    fn unwrap(&mut self, ciphertext: &[u8], plaintext: &mut Vec<u8>) -> Result<CipherStatus> {
        let mut rd = ciphertext;
        let mut status = CipherStatus::Open;
        while !rd.is_empty() {
            if self.conn.read_tls(&mut rd)? == 0 {
                break;
            }
            let state = self.process()?;
            self.drain_plaintext(state.plaintext_bytes_to_read(), plaintext)?;
            if state.peer_has_closed() {
                status = CipherStatus::Closed;
            }
        }
        Ok(status)
    }
}
