//! A general-purpose TCP/TLS socket server framework built on tokio.
//!
//! Applications embed a [`Server`]: they supply a [`ServerConfig`] with a
//! [`Handler`] factory, and the framework owns everything between the
//! listen socket and the handler callbacks: bind, a pool of concurrent
//! acceptors, one worker task per connection, per-read timeouts, TLS
//! handshakes, and a graceful drain that refuses new connections
//! immediately while giving in-flight ones a bounded budget to finish.
//!
//! The framework is payload-agnostic: it implements no protocol of its
//! own and is intended as the substrate protocol libraries build on.

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod server;
pub mod telemetry;

mod acceptor;
mod shutdown;
mod transport;
mod worker;

pub use config::{ServerConfig, ServerConfigBuilder};
pub use connection::Connection;
pub use error::{Error, ErrorKind, Result};
pub use handler::{ConnectionHandle, ConnectionMeta, Directive, Handler, MakeHandler, Message};
pub use server::{ListenerInfo, Server};
pub use telemetry::{CloseReason, TelemetryEvent, TelemetryHook};
pub use transport::{TlsConfig, Transport};

/// Default TCP port a server binds when none is configured.
pub const DEFAULT_PORT: u16 = 4000;

/// Default bind address.
pub const DEFAULT_HOST: &str = "0.0.0.0";
