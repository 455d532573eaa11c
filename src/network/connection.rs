// src/network/connection.rs

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use mio::net::TcpStream;
use mio::{Interest, Token};
use parking_lot::Mutex;

use crate::constants::MAX_CHUNK_SIZE;
use crate::error::{Result, TransportError};
use crate::events::{ConnectionRole, LogLevel};
use crate::network::events::emit_network_event;
use crate::network::frame::{seal_message, write_chunks, FrameReader};
use crate::network::reactor::{PendingChange, ReactorShared};
use crate::network::task::Task;
use crate::security::engine::TlsEngine;

/// Entry of a connection's outbound queue.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// A sealed logical message (length prefix included).
    Message(Vec<u8>),
    /// Stop draining here and close once everything before it is written.
    Close,
}

const PENDING: u8 = 0;
const REGISTERED: u8 = 1;
const CLOSING: u8 = 2;
const TERMINATED: u8 = 3;

/// Shared handle to one secure connection.
///
/// Any thread may send, close or schedule work through it. Socket, TLS and
/// framing state live in the reactor and are only reached through queued
/// changes.
pub struct Connection {
    peer: SocketAddr,
    token: Token,
    role: ConnectionRole,
    fingerprint: Option<String>,
    state: AtomicU8,
    outbound: Mutex<VecDeque<Outbound>>,
    attachment: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    reactor: Arc<ReactorShared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("token", &self.token)
            .field("role", &self.role)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        peer: SocketAddr,
        token: Token,
        role: ConnectionRole,
        fingerprint: Option<String>,
        reactor: Arc<ReactorShared>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            token,
            role,
            fingerprint,
            state: AtomicU8::new(PENDING),
            outbound: Mutex::new(VecDeque::new()),
            attachment: Mutex::new(None),
            reactor,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    /// SPKI fingerprint of the certificate the peer presented.
    pub fn peer_fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    /// Registered with the reactor and not closing.
    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == REGISTERED
    }

    pub fn pending_messages(&self) -> usize {
        self.outbound
            .lock()
            .iter()
            .filter(|o| matches!(o, Outbound::Message(_)))
            .count()
    }

    /// Queue `bytes` as one logical message; with `close`, the connection is
    /// closed once it has been written. No I/O happens on the calling thread.
    pub fn send(&self, bytes: &[u8], close: bool) -> Result<()> {
        self.send_parts(&[bytes], close)
    }

    /// Queue the concatenation of `parts` as one logical message.
    pub fn send_parts(&self, parts: &[&[u8]], close: bool) -> Result<()> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        let max = self.reactor.settings().max_message_size;
        if parts.iter().map(|p| p.len()).sum::<usize>() > max {
            return Err(TransportError::MessageTooLarge { max });
        }
        let message = seal_message(parts)?;
        {
            // State is re-checked under the queue lock so nothing lands
            // behind a close marker or in a queue that was already cleared.
            let mut queue = self.outbound.lock();
            if !self.is_open() {
                return Err(TransportError::ChannelClosed);
            }
            queue.push_back(Outbound::Message(message));
            if close {
                queue.push_back(Outbound::Close);
                self.begin_close();
            }
        }
        self.request_write();
        Ok(())
    }

    /// Close after every message queued so far has been written.
    pub fn close(&self) -> Result<()> {
        {
            let mut queue = self.outbound.lock();
            if !self.is_open() {
                return Err(TransportError::ChannelClosed);
            }
            queue.push_back(Outbound::Close);
            self.begin_close();
        }
        self.request_write();
        Ok(())
    }

    /// Tear the connection down without flushing queued messages.
    pub fn abort(&self) {
        if self.state.load(Ordering::Acquire) != TERMINATED {
            self.reactor
                .submit(PendingChange::Close { token: self.token });
        }
    }

    /// Dispatch a connection-scoped task to the worker pool.
    pub fn schedule(&self, task: Task) {
        self.reactor.dispatch(task);
    }

    pub fn attach<T: Any + Send + Sync>(&self, value: T) {
        *self.attachment.lock() = Some(Arc::new(value));
    }

    pub fn attachment<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.attachment
            .lock()
            .clone()
            .and_then(|a| a.downcast::<T>().ok())
    }

    pub fn detach(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.attachment.lock().take()
    }

    /// Caller holds the outbound lock.
    fn begin_close(&self) {
        let _ = self
            .state
            .compare_exchange(REGISTERED, CLOSING, Ordering::AcqRel, Ordering::Acquire);
    }

    fn request_write(&self) {
        self.reactor.submit(PendingChange::Interest {
            token: self.token,
            interest: Interest::READABLE | Interest::WRITABLE,
        });
    }

    pub(crate) fn mark_registered(&self) {
        let _ = self
            .state
            .compare_exchange(PENDING, REGISTERED, Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn mark_terminated(&self) {
        let mut queue = self.outbound.lock();
        self.state.store(TERMINATED, Ordering::Release);
        queue.clear();
    }

    fn next_outbound(&self) -> Option<Outbound> {
        self.outbound.lock().pop_front()
    }
}

/// Outcome of draining a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteState {
    /// Queue empty and all bytes written; write interest can be dropped.
    Drained,
    /// The socket would block with bytes still pending.
    Blocked,
    /// A close marker was reached after everything before it was written.
    Close,
}

/// Reactor-owned half of a connection: socket, TLS engine and framing state.
pub(crate) struct ConnectionIo {
    pub(crate) handle: Arc<Connection>,
    pub(crate) stream: TcpStream,
    engine: TlsEngine,
    reader: FrameReader,
    wire: Vec<u8>,
    written: usize,
}

impl ConnectionIo {
    pub(crate) fn new(
        handle: Arc<Connection>,
        stream: TcpStream,
        engine: TlsEngine,
        max_message: usize,
    ) -> Self {
        Self {
            handle,
            stream,
            engine,
            reader: FrameReader::new(max_message),
            wire: Vec::new(),
            written: 0,
        }
    }

    pub(crate) fn token(&self) -> Token {
        self.handle.token()
    }

    /// Read every complete message currently available.
    pub(crate) fn read_ready<F: FnMut(Vec<u8>)>(&mut self, mut deliver: F) -> Result<()> {
        while let Some(message) = self.reader.read_from(&mut self.stream, &mut self.engine)? {
            deliver(message);
        }
        Ok(())
    }

    /// Write pending bytes, then encode and write queued messages in order.
    pub(crate) fn write_ready(&mut self) -> Result<WriteState> {
        loop {
            while self.written < self.wire.len() {
                match self.stream.write(&self.wire[self.written..]) {
                    Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                    Ok(n) => self.written += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(WriteState::Blocked)
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e.into()),
                }
            }
            self.wire.clear();
            self.written = 0;
            match self.handle.next_outbound() {
                None => return Ok(WriteState::Drained),
                Some(Outbound::Close) => return Ok(WriteState::Close),
                Some(Outbound::Message(message)) => {
                    write_chunks(&mut self.engine, &message, MAX_CHUNK_SIZE, &mut self.wire)?;
                }
            }
        }
    }

    /// Best-effort close_notify in its own chunk, then shut the socket down.
    pub(crate) fn shutdown(&mut self) {
        let peer = self.handle.peer_addr();
        if self.written == self.wire.len() {
            self.engine.send_close_notify();
            let mut goodbye = Vec::new();
            if write_chunks(&mut self.engine, &[], MAX_CHUNK_SIZE, &mut goodbye).is_ok() {
                if let Err(e) = self.stream.write(&goodbye) {
                    emit_network_event(
                        "connection",
                        LogLevel::Debug,
                        "close_notify_failed",
                        Some(peer.to_string()),
                        Some(e.to_string()),
                    );
                }
            }
        }
        shutdown_stream(&self.stream, peer, "connection");
    }
}

/// Shut both directions down; `NotConnected` means the peer is already gone
/// and is not logged.
pub(crate) fn shutdown_stream(stream: &TcpStream, peer: SocketAddr, component: &'static str) {
    if let Err(e) = stream.shutdown(Shutdown::Both) {
        if e.kind() != io::ErrorKind::NotConnected {
            emit_network_event(
                component,
                LogLevel::Debug,
                "shutdown_failed",
                Some(peer.to_string()),
                Some(e.to_string()),
            );
        }
    }
}
