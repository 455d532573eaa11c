// src/network/registry.rs

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use mio::Token;
use parking_lot::RwLock;

use crate::error::{Result, TransportError};
use crate::network::connection::Connection;

/// Peer address -> live connection, for pushes to already connected peers.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<SocketAddr, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, connection: Arc<Connection>) {
        self.connections
            .write()
            .insert(connection.peer_addr(), connection);
    }

    /// Remove the entry for `addr`, but only if it still belongs to `token`.
    pub(crate) fn remove(&self, addr: SocketAddr, token: Token) -> bool {
        let mut map = self.connections.write();
        match map.get(&addr) {
            Some(existing) if existing.token() == token => {
                map.remove(&addr);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<Connection>> {
        self.connections.read().get(addr).cloned()
    }

    /// Returns a list of currently connected peer addresses
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.connections.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Queue `bytes` for the peer at `addr`.
    pub fn send_to(&self, addr: SocketAddr, bytes: &[u8]) -> Result<()> {
        let connection = self.get(&addr).ok_or(TransportError::UnknownPeer(addr))?;
        connection.send(bytes, false)
    }
}
