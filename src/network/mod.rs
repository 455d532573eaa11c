//! Reactor, framed connections, task dispatch and the client/server variants.

pub mod client;
pub mod connection;
pub(crate) mod events;
pub mod frame;
pub(crate) mod reactor;
pub mod registry;
pub mod server;
pub mod task;

pub use client::Client;
pub use connection::Connection;
pub use frame::{open_message, seal_message, write_chunks, ChunkHeader, FrameReader};
pub use registry::ConnectionRegistry;
pub use server::Server;
pub use task::{handler_fn, HandlerFactory, Task, TaskHandler, TaskType, WorkerPool};
