// src/network/client.rs

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Instant;

use mio::net::TcpStream;
use parking_lot::Mutex;

use crate::config::{Config, ReactorSettings};
use crate::error::{Result, TransportError};
use crate::events::{ConnectionRole, LogLevel};
use crate::network::connection::{Connection, ConnectionIo};
use crate::network::events::{emit_handshake_event, emit_network_event, HandshakeReport};
use crate::network::reactor::{Reactor, ReactorShared, ReactorThread};
use crate::network::task::{HandlerFactory, Task, TaskType};
use crate::security::engine::TlsEngine;
use crate::security::handshake::HandshakeDriver;
use crate::security::provider::{resolve_provider, CertificateProvider};

/// Active-connect engine for a single fixed peer. The handshake runs on the
/// caller's thread before the connection is ever registered.
pub struct Client {
    host: String,
    port: u16,
    server_name: String,
    provider: Arc<dyn CertificateProvider>,
    factory: Arc<dyn HandlerFactory>,
    settings: ReactorSettings,
    running: Mutex<Option<Running>>,
}

struct Running {
    reactor: ReactorThread,
    connection: Arc<Connection>,
}

impl Client {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        provider: Arc<dyn CertificateProvider>,
        factory: Arc<dyn HandlerFactory>,
        settings: ReactorSettings,
    ) -> Self {
        let host = host.into();
        Self {
            server_name: host.clone(),
            host,
            port,
            provider,
            factory,
            settings,
            running: Mutex::new(None),
        }
    }

    /// Name the server certificate must carry when trust material is configured.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn from_config(
        cfg: &Config,
        service: Option<Arc<dyn CertificateProvider>>,
        factory: Arc<dyn HandlerFactory>,
    ) -> Result<Self> {
        let client = cfg.client.clone().unwrap_or_default();
        let provider = resolve_provider(service, &cfg.encryption_or_default())?;
        let server_name = client
            .server_name
            .clone()
            .unwrap_or_else(|| client.host.clone());
        Ok(Self::new(
            client.host,
            client.port,
            provider,
            factory,
            ReactorSettings::from_config(cfg),
        )
        .with_server_name(server_name))
    }

    /// Connect, handshake and start the reactor. On failure a ConnectFailed
    /// task is dispatched and the error is returned.
    pub fn start(&self) -> Result<Arc<Connection>> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(TransportError::AlreadyRunning);
        }
        let mut reactor = Reactor::new(self.factory.clone(), self.settings.clone())?;
        let shared = reactor.shared().clone();

        let unresolved = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port);
        let addr = match self.resolve() {
            Ok(addr) => addr,
            Err(e) => return Err(self.connect_failed(&shared, unresolved, e)),
        };
        let started = Instant::now();
        let (stream, engine) = match self.establish(addr) {
            Ok(established) => established,
            Err(e) => {
                emit_handshake_event(HandshakeReport {
                    role: ConnectionRole::Outbound,
                    peer: addr,
                    fingerprint: None,
                    protocol: None,
                    elapsed: started.elapsed(),
                    failure: Some(&e.to_string()),
                });
                return Err(self.connect_failed(&shared, addr, e));
            }
        };
        let fingerprint = engine.peer_fingerprint();
        emit_handshake_event(HandshakeReport {
            role: ConnectionRole::Outbound,
            peer: addr,
            fingerprint: fingerprint.clone(),
            protocol: engine.protocol(),
            elapsed: started.elapsed(),
            failure: None,
        });

        let connection = Connection::new(
            addr,
            shared.next_token(),
            ConnectionRole::Outbound,
            fingerprint,
            shared.clone(),
        );
        let io = ConnectionIo::new(
            connection.clone(),
            stream,
            engine,
            self.settings.max_message_size,
        );
        if let Err(e) = reactor.adopt(io) {
            return Err(self.connect_failed(&shared, addr, e));
        }
        let reactor = reactor.spawn("agentlink-client")?;
        *running = Some(Running {
            reactor,
            connection: connection.clone(),
        });
        Ok(connection)
    }

    fn resolve(&self) -> Result<SocketAddr> {
        let target = format!("{}:{}", self.host, self.port);
        target
            .to_socket_addrs()
            .map_err(|e| TransportError::Resolve(format!("{}: {}", target, e)))?
            .next()
            .ok_or(TransportError::Resolve(target))
    }

    fn establish(&self, addr: SocketAddr) -> Result<(TcpStream, TlsEngine)> {
        let std_stream = std::net::TcpStream::connect_timeout(&addr, self.settings.connect_timeout)
            .map_err(|source| TransportError::Connect { addr, source })?;
        std_stream.set_nodelay(true)?;
        std_stream.set_nonblocking(true)?;
        let mut stream = TcpStream::from_std(std_stream);
        let mut engine = self.provider.client_engine(&self.server_name)?;
        HandshakeDriver::from_settings(&self.settings).run(&mut stream, &mut engine)?;
        Ok((stream, engine))
    }

    fn connect_failed(
        &self,
        shared: &Arc<ReactorShared>,
        addr: SocketAddr,
        error: TransportError,
    ) -> TransportError {
        emit_network_event(
            "client",
            LogLevel::Warn,
            "connect_failed",
            Some(addr.to_string()),
            Some(error.to_string()),
        );
        let handle = Connection::new(
            addr,
            shared.next_token(),
            ConnectionRole::Outbound,
            None,
            shared.clone(),
        );
        shared.dispatch(Task::new(TaskType::ConnectFailed, handle, None));
        shared.workers().shutdown();
        error
    }

    /// The live connection, if started.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.running.lock().as_ref().map(|r| r.connection.clone())
    }

    pub fn send(&self, bytes: &[u8], close: bool) -> Result<()> {
        self.connection()
            .ok_or(TransportError::NotRunning)?
            .send(bytes, close)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.reactor.is_running())
            .unwrap_or(false)
    }

    /// Terminate the connection and stop the reactor.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            running.reactor.stop();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
    }
}
