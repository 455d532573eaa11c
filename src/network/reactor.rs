//! Single-threaded readiness loop.
//!
//! The reactor thread is the only one that touches the `mio` registry and the
//! per-connection I/O state. Other threads talk to it through
//! [`PendingChange`]s, which are applied after each round of readiness events.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;

use crate::config::ReactorSettings;
use crate::constants::EVENTS_CAPACITY;
use crate::error::{Result, TransportError};
use crate::events::LogLevel;
use crate::network::connection::{ConnectionIo, WriteState};
use crate::network::events::emit_network_event;
use crate::network::registry::ConnectionRegistry;
use crate::network::task::{HandlerFactory, Task, WorkerPool};

pub(crate) const WAKE_TOKEN: Token = Token(0);
pub(crate) const LISTENER_TOKEN: Token = Token(1);
const FIRST_CONNECTION_TOKEN: usize = 16;

/// Registration change requested from outside the reactor thread.
pub(crate) enum PendingChange {
    /// Register a connection whose handshake has completed.
    Register(Box<ConnectionIo>),
    /// Replace the interest set of a registered connection.
    Interest { token: Token, interest: Interest },
    /// Terminate immediately.
    Close { token: Token },
}

#[derive(Default)]
struct ChangeQueue {
    items: Vec<PendingChange>,
    /// Set once the loop has taken its final batch; later changes are refused.
    sealed: bool,
}

/// State shared between the reactor thread, connection handles and workers.
pub(crate) struct ReactorShared {
    changes: Mutex<ChangeQueue>,
    waker: Waker,
    running: AtomicBool,
    next_token: AtomicUsize,
    factory: Arc<dyn HandlerFactory>,
    workers: WorkerPool,
    settings: ReactorSettings,
}

impl ReactorShared {
    pub(crate) fn submit(&self, change: PendingChange) {
        let refused = {
            let mut queue = self.changes.lock();
            if queue.sealed {
                Some(change)
            } else {
                queue.items.push(change);
                None
            }
        };
        match refused {
            None => self.wake(),
            Some(PendingChange::Register(mut io)) => {
                io.handle.mark_terminated();
                io.shutdown();
                emit_network_event(
                    "reactor",
                    LogLevel::Debug,
                    "register_refused",
                    Some(io.handle.peer_addr().to_string()),
                    Some("reactor stopped".into()),
                );
            }
            Some(_) => {}
        }
    }

    pub(crate) fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            emit_network_event(
                "reactor",
                LogLevel::Error,
                "wake_failed",
                None,
                Some(e.to_string()),
            );
        }
    }

    pub(crate) fn dispatch(&self, task: Task) {
        self.workers.execute(self.factory.as_ref(), task);
    }

    pub(crate) fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn settings(&self) -> &ReactorSettings {
        &self.settings
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    fn take_changes(&self) -> Vec<PendingChange> {
        std::mem::take(&mut self.changes.lock().items)
    }

    /// Take the last batch and refuse everything submitted afterwards.
    fn seal_changes(&self) -> Vec<PendingChange> {
        let mut queue = self.changes.lock();
        queue.sealed = true;
        std::mem::take(&mut queue.items)
    }
}

/// Receives sockets accepted by the reactor's listener.
pub(crate) trait Acceptor: Send {
    fn accept(&mut self, stream: TcpStream, peer: SocketAddr);
}

pub(crate) struct Reactor {
    poll: Poll,
    events: Events,
    shared: Arc<ReactorShared>,
    connections: HashMap<Token, ConnectionIo>,
    listener: Option<(TcpListener, Box<dyn Acceptor>)>,
    registry: Option<Arc<ConnectionRegistry>>,
}

impl Reactor {
    pub(crate) fn new(factory: Arc<dyn HandlerFactory>, settings: ReactorSettings) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let workers = WorkerPool::new(
            "agentlink-worker",
            settings.workers,
            settings.worker_keep_alive,
        )?;
        let shared = Arc::new(ReactorShared {
            changes: Mutex::new(ChangeQueue::default()),
            waker,
            running: AtomicBool::new(false),
            next_token: AtomicUsize::new(FIRST_CONNECTION_TOKEN),
            factory,
            workers,
            settings,
        });
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            shared,
            connections: HashMap::new(),
            listener: None,
            registry: None,
        })
    }

    pub(crate) fn shared(&self) -> &Arc<ReactorShared> {
        &self.shared
    }

    pub(crate) fn set_registry(&mut self, registry: Arc<ConnectionRegistry>) {
        self.registry = Some(registry);
    }

    pub(crate) fn listen(&mut self, mut listener: TcpListener, acceptor: Box<dyn Acceptor>) -> Result<()> {
        self.poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        self.listener = Some((listener, acceptor));
        Ok(())
    }

    /// Register a connection directly, from the thread that owns the reactor
    /// before it is started.
    pub(crate) fn adopt(&mut self, io: ConnectionIo) -> Result<()> {
        self.register(io)
    }

    /// Start the loop on its own thread.
    pub(crate) fn spawn(self, name: &str) -> Result<ReactorThread> {
        let shared = self.shared.clone();
        shared.running.store(true, Ordering::Release);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || self.run())
            .map_err(|e| {
                shared.running.store(false, Ordering::Release);
                TransportError::Io(e)
            })?;
        Ok(ReactorThread {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn run(mut self) {
        let timeout = self.shared.settings.select_timeout.max(Duration::from_millis(1));
        while self.shared.is_running() {
            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                emit_network_event(
                    "reactor",
                    LogLevel::Error,
                    "poll_failed",
                    None,
                    Some(e.to_string()),
                );
                break;
            }
            let ready: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .map(|ev| {
                    (
                        ev.token(),
                        ev.is_readable() || ev.is_read_closed() || ev.is_error(),
                        ev.is_writable(),
                    )
                })
                .collect();
            for (token, readable, writable) in ready {
                match token {
                    WAKE_TOKEN => {}
                    LISTENER_TOKEN => self.accept_ready(),
                    _ => self.connection_ready(token, readable, writable),
                }
            }
            let changes = self.shared.take_changes();
            self.apply_changes(changes);
        }
        self.shared.running.store(false, Ordering::Release);
        // Changes queued during shutdown still get to register, so every
        // connection that ever received a Connect also gets a Disconnect.
        let last = self.shared.seal_changes();
        self.apply_changes(last);
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.terminate(token, "reactor stopped");
        }
    }

    fn accept_ready(&mut self) {
        let Some((listener, acceptor)) = self.listener.as_mut() else {
            return;
        };
        loop {
            match listener.accept() {
                Ok((stream, peer)) => acceptor.accept(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    emit_network_event(
                        "reactor",
                        LogLevel::Warn,
                        "accept_failed",
                        None,
                        Some(e.to_string()),
                    );
                    break;
                }
            }
        }
    }

    fn connection_ready(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(io) = self.connections.get_mut(&token) else {
            return;
        };
        let mut failure: Option<TransportError> = None;
        let mut close = false;
        if readable {
            let shared = &self.shared;
            let handle = io.handle.clone();
            if let Err(e) = io.read_ready(|payload| shared.dispatch(Task::data(handle.clone(), payload))) {
                failure = Some(e);
            }
        }
        if failure.is_none() && writable {
            match io.write_ready() {
                Ok(WriteState::Drained) => {
                    if let Err(e) =
                        self.poll
                            .registry()
                            .reregister(&mut io.stream, token, Interest::READABLE)
                    {
                        failure = Some(e.into());
                    }
                }
                Ok(WriteState::Blocked) => {}
                Ok(WriteState::Close) => close = true,
                Err(e) => failure = Some(e),
            }
        }
        if let Some(e) = failure {
            let reason = if e.is_peer_gone() {
                "peer closed".to_string()
            } else {
                e.to_string()
            };
            self.terminate(token, &reason);
        } else if close {
            self.terminate(token, "closed");
        }
    }

    fn apply_changes(&mut self, changes: Vec<PendingChange>) {
        for change in changes {
            match change {
                PendingChange::Register(io) => {
                    if let Err(e) = self.register(*io) {
                        emit_network_event(
                            "reactor",
                            LogLevel::Warn,
                            "register_failed",
                            None,
                            Some(e.to_string()),
                        );
                    }
                }
                PendingChange::Interest { token, interest } => {
                    let outcome = match self.connections.get_mut(&token) {
                        Some(io) => self
                            .poll
                            .registry()
                            .reregister(&mut io.stream, token, interest),
                        None => {
                            emit_network_event(
                                "reactor",
                                LogLevel::Debug,
                                "stale_change",
                                None,
                                Some(format!("no registration for token {}", token.0)),
                            );
                            Ok(())
                        }
                    };
                    if let Err(e) = outcome {
                        emit_network_event(
                            "reactor",
                            LogLevel::Warn,
                            "stale_change",
                            None,
                            Some(e.to_string()),
                        );
                        self.terminate(token, "registration lost");
                    }
                }
                PendingChange::Close { token } => self.terminate(token, "aborted"),
            }
        }
    }

    fn register(&mut self, mut io: ConnectionIo) -> Result<()> {
        let token = io.token();
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut io.stream, token, Interest::READABLE)
        {
            io.handle.mark_terminated();
            io.shutdown();
            return Err(e.into());
        }
        let handle = io.handle.clone();
        handle.mark_registered();
        self.connections.insert(token, io);
        if let Some(registry) = &self.registry {
            registry.insert(handle.clone());
        }
        emit_network_event(
            "reactor",
            LogLevel::Info,
            "connection_registered",
            Some(handle.peer_addr().to_string()),
            handle.peer_fingerprint().map(|fp| format!("fingerprint={}", fp)),
        );
        self.shared.dispatch(Task::connect(handle));
        Ok(())
    }

    fn terminate(&mut self, token: Token, reason: &str) {
        let Some(mut io) = self.connections.remove(&token) else {
            return;
        };
        if let Err(e) = self.poll.registry().deregister(&mut io.stream) {
            emit_network_event(
                "reactor",
                LogLevel::Debug,
                "deregister_failed",
                Some(io.handle.peer_addr().to_string()),
                Some(e.to_string()),
            );
        }
        io.shutdown();
        let handle = io.handle.clone();
        handle.mark_terminated();
        if let Some(registry) = &self.registry {
            registry.remove(handle.peer_addr(), token);
        }
        emit_network_event(
            "reactor",
            LogLevel::Info,
            "connection_terminated",
            Some(handle.peer_addr().to_string()),
            Some(reason.to_string()),
        );
        self.shared.dispatch(Task::disconnect(handle));
    }
}

/// Handle to a running reactor thread.
pub(crate) struct ReactorThread {
    shared: Arc<ReactorShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReactorThread {
    pub(crate) fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Stop the loop, wait for it to terminate every connection, then shut
    /// the worker pool down.
    pub(crate) fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake();
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != std::thread::current().id() {
                if handle.join().is_err() {
                    emit_network_event(
                        "reactor",
                        LogLevel::Error,
                        "reactor_panicked",
                        None,
                        None,
                    );
                }
            }
        }
        self.shared.workers.shutdown();
    }
}
