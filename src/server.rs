//! Server lifecycle: bind, steady-state acceptance, graceful drain.
//!
//! Startup order is strict: the listen socket is bound first, then the
//! acceptor pool spins up around it, then the shutdown listener is armed.
//! Shutdown runs the same order in reverse: close the listener so no new
//! connection can be established, then give in-flight connections a
//! bounded budget to finish, then abort whatever is left.

use crate::acceptor::AcceptorPool;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::handler::MakeHandler;
use crate::shutdown::{Shutdown, ShutdownSignal};
use crate::telemetry::{Telemetry, TelemetryEvent};
use crate::transport::{Binding, ListenerHandle};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Server state shared by every group and worker.
pub(crate) struct Shared {
    pub(crate) factory: Arc<dyn MakeHandler>,
    pub(crate) read_timeout: Duration,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) drain_override: OnceLock<Duration>,
    pub(crate) telemetry: Telemetry,
    pub(crate) signal: ShutdownSignal,
}

impl Shared {
    /// The drain budget in effect: a `stop_with_timeout` override, or the
    /// configured default.
    pub(crate) fn drain_budget(&self) -> Duration {
        self.drain_override
            .get()
            .copied()
            .unwrap_or(self.shutdown_timeout)
    }
}

/// Facts about the bound listener. With `port = 0` in the configuration,
/// this is where the actual ephemeral port is read from.
#[derive(Debug, Clone, Copy)]
pub struct ListenerInfo {
    pub local_addr: SocketAddr,
    pub port: u16,
    pub transport: &'static str,
}

/// Raises the shutdown signal on the first of: an explicit stop request,
/// or an escalation from a group whose acceptor kept crashing. The signal
/// is raised once and stays raised.
struct ShutdownListener {
    shutdown: Shutdown,
    escalations: mpsc::Receiver<usize>,
    signal: ShutdownSignal,
}

impl ShutdownListener {
    async fn run(mut self) {
        tokio::select! {
            _ = self.shutdown.recv() => {}
            Some(group) = self.escalations.recv() => {
                error!(group, "acceptor group escalated, stopping server");
                self.signal.raise();
            }
        }
    }
}

/// A running socket server.
///
/// Start one with [`Server::start`]; stop it with [`Server::stop`], which
/// runs the drain protocol. Multiple servers may run in one process, each
/// on its own port, with no shared state. Dropping the handle without
/// calling `stop` leaves the server running detached.
pub struct Server {
    local_addr: SocketAddr,
    transport: &'static str,
    signal: ShutdownSignal,
    shared: Arc<Shared>,
    pool: AcceptorPool,
    listener_closed: mpsc::Receiver<()>,
    shutdown_listener: JoinHandle<()>,
}

impl Server {
    /// Bind the listen socket and start accepting connections.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unusable configuration (including
    /// unreadable or malformed TLS material) and [`Error::Bind`] when the
    /// OS refuses the listen. Both surface synchronously; once `start`
    /// returns the server is accepting.
    pub async fn start(config: ServerConfig) -> Result<Server> {
        let ServerConfig {
            host,
            port,
            transport,
            factory,
            num_acceptors,
            read_timeout,
            shutdown_timeout,
            telemetry_hook,
        } = config;

        let transport_kind = transport.kind();
        let binding = Binding::from_transport(&transport)?;
        let listener = binding.bind(SocketAddr::new(host, port)).await?;
        let local_addr = listener.local_addr().map_err(Error::Bind)?;

        let telemetry = Telemetry::new(telemetry_hook);
        telemetry.emit(TelemetryEvent::ListenerStart {
            port: local_addr.port(),
            local_addr,
            transport: transport_kind,
        });
        info!(%local_addr, transport = transport_kind, "accepting inbound connections");

        let signal = ShutdownSignal::new();
        let shared = Arc::new(Shared {
            factory,
            read_timeout,
            shutdown_timeout,
            drain_override: OnceLock::new(),
            telemetry: telemetry.clone(),
            signal: signal.clone(),
        });

        let (listener_handle, listener_closed) = ListenerHandle::new(listener);
        let (escalate_tx, escalate_rx) = mpsc::channel(num_acceptors.max(1));
        let pool = AcceptorPool::start(
            num_acceptors,
            &listener_handle,
            local_addr,
            &shared,
            escalate_tx,
        );
        // Only acceptor tasks and their groups hold the socket from here,
        // so their exit during drain is what closes it.
        drop(listener_handle);

        let shutdown_listener = tokio::spawn(
            ShutdownListener {
                shutdown: signal.subscribe(),
                escalations: escalate_rx,
                signal: signal.clone(),
            }
            .run(),
        );

        Ok(Server {
            local_addr,
            transport: transport_kind,
            signal,
            shared,
            pool,
            listener_closed,
            shutdown_listener,
        })
    }

    /// The bound listener: actual port, address, transport kind.
    pub fn listener_info(&self) -> ListenerInfo {
        ListenerInfo {
            local_addr: self.local_addr,
            port: self.local_addr.port(),
            transport: self.transport,
        }
    }

    /// Gracefully stop the server with the configured `shutdown_timeout`
    /// as the drain budget.
    pub async fn stop(self) {
        self.shutdown(None).await;
    }

    /// Gracefully stop the server, overriding the drain budget.
    pub async fn stop_with_timeout(self, budget: Duration) {
        self.shutdown(Some(budget)).await;
    }

    /// The drain protocol. Refuse new connections first, then wait for
    /// in-flight ones within the budget, then force the stragglers.
    /// Returns only after every subordinate task has terminated.
    async fn shutdown(mut self, budget: Option<Duration>) {
        if let Some(budget) = budget {
            // First stop's budget wins.
            let _ = self.shared.drain_override.set(budget);
        }

        info!("shutting down");
        self.signal.raise();

        // Acceptors exit on the signal and the last listener handle drops
        // with them: the OS socket closes, and new connection attempts are
        // refused from here on.
        let _ = self.listener_closed.recv().await;
        self.shared.telemetry.emit(TelemetryEvent::ListenerShutdown);
        info!("listener closed, draining connections");

        // Each group gives its workers the drain budget to finish
        // naturally, then aborts what is left.
        self.pool.join().await;
        let _ = self.shutdown_listener.await;

        info!("shutdown complete");
    }
}
