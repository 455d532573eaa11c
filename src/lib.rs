//! # agentlink
//!
//! Mutually-authenticated TLS transport for management-to-agent links.
//!
//! A single reactor thread multiplexes non-blocking sockets with `mio`, every
//! byte rides inside a `rustls` session driven without owning the socket, and
//! a chunked framing layer lets logical messages of any size cross TLS records
//! of bounded size. Complete messages are handed to a worker pool as tasks.
//!
//! ## Key Modules
//! * `network` – reactor, framed connections, tasks, client and server variants.
//! * `security` – TLS engines, handshake driver, keystore / trust collaborators.
//! * `config` – TOML configuration and resolved reactor settings.
//! * `events` – Structured logging/events dispatcher.
//! * `error` – `TransportError`.
//!
//! ## Wire format
//! Each chunk is a 4-byte big-endian header followed by ciphertext. Bits 0-15
//! of the header hold the ciphertext length, bit 16 marks that more chunks
//! follow for the same logical message.

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod network;
pub mod security;

pub use error::{Result, TransportError};
pub use network::{
    handler_fn, Client, Connection, ConnectionRegistry, HandlerFactory, Server, Task, TaskHandler,
    TaskType,
};
pub use security::{CertificateProvider, KeystoreProvider, ResourceLocator, SearchPathLocator};
