//! Drives a [`TlsEngine`] handshake over a non-blocking socket.
//!
//! The driver owns a private `mio::Poll` for the duration of the handshake, so
//! it can run on any thread without touching the reactor. It reads exactly one
//! TLS record at a time: whatever follows the final handshake record belongs to
//! the framing layer and must stay in the socket.

use std::io::{self, Read};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

use crate::config::ReactorSettings;
use crate::constants::{MAX_TLS_RECORD_BODY, TLS_RECORD_HEADER_LEN};
use crate::error::{Result, TransportError};
use crate::events::LogLevel;
use crate::network::events::emit_network_event;
use crate::security::engine::TlsEngine;

const HANDSHAKE_TOKEN: Token = Token(0);

#[derive(Debug, Clone)]
pub struct HandshakeDriver {
    timeout: Duration,
    poll_slice: Duration,
}

impl HandshakeDriver {
    pub fn new(timeout: Duration, poll_slice: Duration) -> Self {
        Self {
            timeout,
            poll_slice: poll_slice.max(Duration::from_millis(1)),
        }
    }

    pub fn from_settings(settings: &ReactorSettings) -> Self {
        Self::new(settings.handshake_timeout, settings.select_timeout)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the handshake to completion. The stream is deregistered from the
    /// private poll before returning, whatever the outcome.
    pub fn run(&self, stream: &mut TcpStream, engine: &mut TlsEngine) -> Result<()> {
        let mut poll = Poll::new()?;
        poll.registry().register(
            stream,
            HANDSHAKE_TOKEN,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        let outcome = self.drive(&mut poll, stream, engine);
        if let Err(e) = poll.registry().deregister(stream) {
            emit_network_event(
                "handshake",
                LogLevel::Debug,
                "deregister_failed",
                stream.peer_addr().ok().map(|a| a.to_string()),
                Some(e.to_string()),
            );
        }
        outcome
    }

    fn drive(&self, poll: &mut Poll, stream: &mut TcpStream, engine: &mut TlsEngine) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut events = Events::with_capacity(8);
        let mut records = RecordReader::default();
        loop {
            let flushed = flush(stream, engine)?;
            if !engine.is_handshaking() && flushed {
                return Ok(());
            }
            if engine.is_handshaking() && engine.wants_read() {
                match records.poll_record(stream) {
                    Ok(Some(record)) => {
                        unwrap_record(stream, engine, &record)?;
                        continue;
                    }
                    Ok(None) => {}
                    Err(TransportError::PeerClosed) => {
                        engine.send_close_notify();
                        let _ = flush(stream, engine);
                        return Err(TransportError::PeerClosed);
                    }
                    Err(e) => return Err(e),
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::HandshakeTimeout(self.timeout));
            }
            match poll.poll(&mut events, Some(remaining.min(self.poll_slice))) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Push pending engine output to the socket. `Ok(false)` means the socket
/// would block with output still queued.
fn flush(stream: &mut TcpStream, engine: &mut TlsEngine) -> Result<bool> {
    while engine.wants_write() {
        match engine.write_tls(stream) {
            Ok(0) => return Err(TransportError::PeerClosed),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

fn unwrap_record(stream: &mut TcpStream, engine: &mut TlsEngine, record: &[u8]) -> Result<()> {
    let mut rd = record;
    while !rd.is_empty() {
        if engine.read_tls(&mut rd)? == 0 {
            break;
        }
    }
    match engine.process() {
        Ok(state) if state.peer_has_closed() => {
            engine.send_close_notify();
            let _ = flush(stream, engine);
            Err(TransportError::PeerClosed)
        }
        Ok(_) => Ok(()),
        Err(e) => {
            // Best effort: let the peer see the alert.
            let _ = flush(stream, engine);
            Err(e)
        }
    }
}

/// Accumulates one TLS record (header plus body) across partial reads.
#[derive(Default)]
struct RecordReader {
    buf: Vec<u8>,
    filled: usize,
}

impl RecordReader {
    fn poll_record<R: Read>(&mut self, src: &mut R) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < TLS_RECORD_HEADER_LEN {
            self.buf.resize(TLS_RECORD_HEADER_LEN, 0);
        }
        if !self.fill(src, TLS_RECORD_HEADER_LEN)? {
            return Ok(None);
        }
        // Content types 20 (change_cipher_spec) to 24 (heartbeat).
        if !(20..=24).contains(&self.buf[0]) {
            return Err(TransportError::engine(format!(
                "content type {} is not a tls record",
                self.buf[0]
            )));
        }
        let body = usize::from(u16::from_be_bytes([self.buf[3], self.buf[4]]));
        if body > MAX_TLS_RECORD_BODY {
            return Err(TransportError::engine(format!(
                "tls record of {} bytes during handshake",
                body
            )));
        }
        let total = TLS_RECORD_HEADER_LEN + body;
        if self.buf.len() < total {
            self.buf.resize(total, 0);
        }
        if !self.fill(src, total)? {
            return Ok(None);
        }
        self.filled = 0;
        Ok(Some(self.buf[..total].to_vec()))
    }

    fn fill<R: Read>(&mut self, src: &mut R, want: usize) -> Result<bool> {
        while self.filled < want {
            match src.read(&mut self.buf[self.filled..want]) {
                Ok(0) => return Err(TransportError::PeerClosed),
                Ok(n) => self.filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

