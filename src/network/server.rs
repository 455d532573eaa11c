// src/network/server.rs

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use mio::net::{TcpListener, TcpStream};
use parking_lot::Mutex;

use crate::config::{Config, ReactorSettings};
use crate::error::{Result, TransportError};
use crate::events::{ConnectionRole, LogLevel};
use crate::network::connection::{shutdown_stream, Connection, ConnectionIo};
use crate::network::events::{emit_handshake_event, emit_network_event, HandshakeReport};
use crate::network::reactor::{Acceptor, PendingChange, Reactor, ReactorShared, ReactorThread};
use crate::network::registry::ConnectionRegistry;
use crate::network::task::{HandlerFactory, WorkerPool};
use crate::security::engine::TlsEngine;
use crate::security::handshake::HandshakeDriver;
use crate::security::provider::{resolve_provider, CertificateProvider};

fn log_network_event(level: LogLevel, action: &str, addr: Option<String>, detail: Option<String>) {
    emit_network_event("server", level, action, addr, detail);
}

/// Passive-accept engine: handshakes run on a cached pool, established
/// connections are registered with the reactor and kept in a registry.
pub struct Server {
    bind: SocketAddr,
    provider: Arc<dyn CertificateProvider>,
    factory: Arc<dyn HandlerFactory>,
    settings: ReactorSettings,
    registry: Arc<ConnectionRegistry>,
    running: Mutex<Option<Running>>,
}

struct Running {
    reactor: ReactorThread,
    handshakes: Arc<WorkerPool>,
    local_addr: SocketAddr,
}

impl Server {
    pub fn new(
        bind: SocketAddr,
        provider: Arc<dyn CertificateProvider>,
        factory: Arc<dyn HandlerFactory>,
        settings: ReactorSettings,
    ) -> Self {
        Self {
            bind,
            provider,
            factory,
            settings,
            registry: Arc::new(ConnectionRegistry::new()),
            running: Mutex::new(None),
        }
    }

    /// Build from configuration. `service` takes precedence over the keystore.
    pub fn from_config(
        cfg: &Config,
        service: Option<Arc<dyn CertificateProvider>>,
        factory: Arc<dyn HandlerFactory>,
    ) -> Result<Self> {
        let bind = cfg
            .server_bind_addr()
            .map_err(|e| TransportError::Resolve(format!("{:#}", e)))?;
        let provider = resolve_provider(service, &cfg.encryption_or_default())?;
        Ok(Self::new(
            bind,
            provider,
            factory,
            ReactorSettings::from_config(cfg),
        ))
    }

    /// Bind the listener and start the reactor. Returns the bound address.
    pub fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(TransportError::AlreadyRunning);
        }
        let listener = TcpListener::bind(self.bind).map_err(|source| TransportError::Bind {
            addr: self.bind,
            source,
        })?;
        let local_addr = listener.local_addr()?;

        let mut reactor = Reactor::new(self.factory.clone(), self.settings.clone())?;
        reactor.set_registry(self.registry.clone());
        let handshakes = Arc::new(WorkerPool::cached(
            "agentlink-handshake",
            self.settings.max_handshake_threads,
            self.settings.worker_keep_alive,
        )?);
        let acceptor = HandshakeAcceptor {
            provider: self.provider.clone(),
            pool: handshakes.clone(),
            shared: reactor.shared().clone(),
            driver: HandshakeDriver::from_settings(&self.settings),
        };
        reactor.listen(listener, Box::new(acceptor))?;
        let reactor = reactor.spawn("agentlink-reactor")?;
        log_network_event(
            LogLevel::Info,
            "listener_bind",
            Some(local_addr.to_string()),
            Some(self.provider.description()),
        );
        *running = Some(Running {
            reactor,
            handshakes,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Stop accepting, terminate every connection and release the pools.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.reactor.stop();
        running.handshakes.shutdown_now();
        log_network_event(
            LogLevel::Info,
            "listener_closed",
            Some(running.local_addr.to_string()),
            None,
        );
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.reactor.is_running())
            .unwrap_or(false)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn connected_peers(&self) -> Vec<SocketAddr> {
        self.registry.peers()
    }

    /// Push a message to an already connected peer.
    pub fn send_to(&self, peer: SocketAddr, bytes: &[u8]) -> Result<()> {
        if !self.is_running() {
            return Err(TransportError::NotRunning);
        }
        self.registry.send_to(peer, bytes)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

struct HandshakeAcceptor {
    provider: Arc<dyn CertificateProvider>,
    pool: Arc<WorkerPool>,
    shared: Arc<ReactorShared>,
    driver: HandshakeDriver,
}

impl Acceptor for HandshakeAcceptor {
    fn accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        log_network_event(
            LogLevel::Info,
            "incoming_connection",
            Some(peer.to_string()),
            None,
        );
        if let Err(e) = stream.set_nodelay(true) {
            log_network_event(
                LogLevel::Debug,
                "nodelay_failed",
                Some(peer.to_string()),
                Some(e.to_string()),
            );
        }
        let engine = match self.provider.server_engine() {
            Ok(engine) => engine,
            Err(e) => {
                log_network_event(
                    LogLevel::Error,
                    "handshake_failed",
                    Some(peer.to_string()),
                    Some(e.to_string()),
                );
                return;
            }
        };
        let shared = self.shared.clone();
        let driver = self.driver.clone();
        if !self
            .pool
            .spawn(move || complete_handshake(shared, driver, stream, peer, engine))
        {
            log_network_event(
                LogLevel::Warn,
                "handshake_rejected",
                Some(peer.to_string()),
                Some("handshake pool is shut down".into()),
            );
        }
    }
}

/// Runs on the handshake pool. Success queues a registration; failure drops
/// the socket without any task reaching the consumer.
fn complete_handshake(
    shared: Arc<ReactorShared>,
    driver: HandshakeDriver,
    mut stream: TcpStream,
    peer: SocketAddr,
    mut engine: TlsEngine,
) {
    let started = Instant::now();
    match driver.run(&mut stream, &mut engine) {
        Ok(()) => {
            let fingerprint = engine.peer_fingerprint();
            emit_handshake_event(HandshakeReport {
                role: ConnectionRole::Inbound,
                peer,
                fingerprint: fingerprint.clone(),
                protocol: engine.protocol(),
                elapsed: started.elapsed(),
                failure: None,
            });
            if !shared.is_running() {
                shutdown_stream(&stream, peer, "server");
                return;
            }
            let handle = Connection::new(
                peer,
                shared.next_token(),
                ConnectionRole::Inbound,
                fingerprint,
                shared.clone(),
            );
            let io = ConnectionIo::new(handle, stream, engine, shared.settings().max_message_size);
            shared.submit(PendingChange::Register(Box::new(io)));
        }
        Err(e) => {
            let reason = e.to_string();
            emit_handshake_event(HandshakeReport {
                role: ConnectionRole::Inbound,
                peer,
                fingerprint: None,
                protocol: None,
                elapsed: started.elapsed(),
                failure: Some(&reason),
            });
            log_network_event(
                LogLevel::Warn,
                "handshake_failed",
                Some(peer.to_string()),
                Some(reason),
            );
            shutdown_stream(&stream, peer, "server");
        }
    }
}
