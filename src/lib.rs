//! chat-echo: a concurrent TCP echo server
//!
//! Each client connection runs its own read/write cycle:
//! - Read up to the read buffer capacity
//! - Echo the bytes back followed by `\n`
//! - Drop messages that do not fit in the write buffer, keep the connection
//!
//! Connections are isolated from each other and from the accept loop; a
//! failure on one never affects the others.

pub mod config;
pub mod connection;
pub mod protocol;
pub mod registry;
pub mod server;

pub use config::{Config, ConfigError};
pub use connection::{ConnState, Connection, ConnectionSettings, Disconnect};
pub use protocol::{BufferLimits, MessageTooLarge};
pub use registry::{ConnectionInfo, ConnectionRegistry};
pub use server::{Acceptor, Server, ServerError, ShutdownHandle};
