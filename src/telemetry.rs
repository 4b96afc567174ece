//! Lifecycle telemetry.
//!
//! The server emits a small set of named events as it moves through its
//! lifecycle. Every event is logged through [`tracing`] under the
//! `berth::telemetry` target; applications that want the events as values
//! (metrics pipelines, tests) install a hook via
//! [`ServerConfigBuilder::telemetry_hook`].
//!
//! [`ServerConfigBuilder::telemetry_hook`]: crate::config::ServerConfigBuilder::telemetry_hook

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Why a connection terminated, carried on
/// [`TelemetryEvent::ConnectionClose`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly close: the peer hung up or the handler asked to close.
    Normal,
    /// The connection terminated abnormally; `handle_error` ran.
    Error,
    /// The connection closed as part of the server drain.
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Normal => "normal",
            CloseReason::Error => "error",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// A fire-and-forget lifecycle notification.
///
/// Event names are contractual; payload fields carry the measurements and
/// metadata listed per variant.
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// `listener.start`: emitted once, when the listen socket is bound.
    ListenerStart {
        port: u16,
        local_addr: SocketAddr,
        transport: &'static str,
    },
    /// `listener.shutdown`: emitted once, when the listen socket has
    /// closed during drain.
    ListenerShutdown,
    /// `acceptor.start`: emitted by each acceptor task as it begins.
    AcceptorStart { transport: &'static str },
    /// `acceptor.error`: a transient accept failure; the acceptor retries.
    AcceptorError { error: String },
    /// `connection.start`: a connection was accepted and handed to a
    /// worker.
    ConnectionStart {
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
    },
    /// `connection.ready`: transport setup (TLS handshake, if any)
    /// completed; the handler is about to run.
    ConnectionReady { handshake_time: Duration },
    /// `connection.close`: the worker terminated.
    ConnectionClose {
        duration: Duration,
        bytes_in: u64,
        bytes_out: u64,
        reason: CloseReason,
    },
}

impl TelemetryEvent {
    /// The contractual event name.
    pub fn name(&self) -> &'static str {
        match self {
            TelemetryEvent::ListenerStart { .. } => "listener.start",
            TelemetryEvent::ListenerShutdown => "listener.shutdown",
            TelemetryEvent::AcceptorStart { .. } => "acceptor.start",
            TelemetryEvent::AcceptorError { .. } => "acceptor.error",
            TelemetryEvent::ConnectionStart { .. } => "connection.start",
            TelemetryEvent::ConnectionReady { .. } => "connection.ready",
            TelemetryEvent::ConnectionClose { .. } => "connection.close",
        }
    }
}

/// Observer callback for [`TelemetryEvent`]s.
pub type TelemetryHook = Arc<dyn Fn(&TelemetryEvent) + Send + Sync>;

/// Emitter shared by all server entities.
#[derive(Clone, Default)]
pub(crate) struct Telemetry {
    hook: Option<TelemetryHook>,
}

impl Telemetry {
    pub(crate) fn new(hook: Option<TelemetryHook>) -> Telemetry {
        Telemetry { hook }
    }

    pub(crate) fn emit(&self, event: TelemetryEvent) {
        match &event {
            TelemetryEvent::ListenerStart {
                port,
                local_addr,
                transport,
            } => {
                info!(target: "berth::telemetry", event = event.name(), port, %local_addr, transport);
            }
            TelemetryEvent::ListenerShutdown => {
                info!(target: "berth::telemetry", event = event.name());
            }
            TelemetryEvent::AcceptorStart { transport } => {
                debug!(target: "berth::telemetry", event = event.name(), transport);
            }
            TelemetryEvent::AcceptorError { error } => {
                warn!(target: "berth::telemetry", event = event.name(), error = %error);
            }
            TelemetryEvent::ConnectionStart {
                remote_addr,
                local_addr,
            } => {
                debug!(target: "berth::telemetry", event = event.name(), %remote_addr, %local_addr);
            }
            TelemetryEvent::ConnectionReady { handshake_time } => {
                debug!(target: "berth::telemetry", event = event.name(), ?handshake_time);
            }
            TelemetryEvent::ConnectionClose {
                duration,
                bytes_in,
                bytes_out,
                reason,
            } => {
                debug!(
                    target: "berth::telemetry",
                    event = event.name(),
                    ?duration,
                    bytes_in,
                    bytes_out,
                    reason = reason.as_str(),
                );
            }
        }

        if let Some(hook) = &self.hook {
            hook(&event);
        }
    }
}
