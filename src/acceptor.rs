//! Parallel accept: acceptor tasks, their supervising groups, and the
//! fixed pool of groups.
//!
//! Acceptance is spread across `num_acceptors` independent groups to
//! remove the single-acceptor bottleneck. Each group runs one acceptor
//! task and owns the set of workers that acceptor produced; acceptors
//! compete for incoming connections and the OS decides who wins a given
//! accept race. Keeping the worker sets per-group bounds the blast radius
//! of any one group's failure and avoids contention on a single shared
//! connection set.

use crate::server::Shared;
use crate::shutdown::Shutdown;
use crate::telemetry::{Telemetry, TelemetryEvent};
use crate::transport::{Accepted, ListenerHandle};
use crate::worker;
use futures::future::OptionFuture;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time;
use tracing::{error, warn};

/// Delay before retrying `accept` after a transient failure, so a
/// persistent condition (fd exhaustion, say) does not become a hot loop.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// A crashed acceptor is restarted at most this many times...
const MAX_ACCEPTOR_RESTARTS: usize = 3;

/// ...within this window; beyond that the group escalates to the server.
const ACCEPTOR_RESTART_WINDOW: Duration = Duration::from_secs(5);

/// The accept loop. Holds no connection state between iterations: its only
/// live references are the listener handle and its group's spawn channel.
async fn run_acceptor(
    group: usize,
    listener: ListenerHandle,
    local_addr: SocketAddr,
    accepted_tx: mpsc::Sender<Accepted>,
    mut shutdown: Shutdown,
    telemetry: Telemetry,
) {
    telemetry.emit(TelemetryEvent::AcceptorStart {
        transport: listener.kind(),
    });

    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.recv() => return,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(err) => {
                    // The listen socket cannot close while this task holds
                    // it, so an error here is transient (resource
                    // exhaustion and the like): note it, back off, retry.
                    telemetry.emit(TelemetryEvent::AcceptorError {
                        error: err.to_string(),
                    });
                    warn!(group, cause = %err, "accept failed, retrying");
                    time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            },
        };

        telemetry.emit(TelemetryEvent::ConnectionStart {
            remote_addr: accepted.peer_addr(),
            local_addr,
        });

        // Hand the socket to the group, which owns the worker set. A send
        // failure means the group is gone, i.e. we are shutting down.
        if accepted_tx.send(accepted).await.is_err() {
            return;
        }
    }
}

/// Supervises one acceptor task plus the workers it spawned.
///
/// Restart policy: a crashed acceptor is restarted within a bounded
/// intensity window; a crashed worker is never restarted (connections are
/// disposable, and the worker's own error path has already invoked
/// `handle_error`).
pub(crate) struct AcceptorGroup {
    id: usize,
    listener: ListenerHandle,
    local_addr: SocketAddr,
    accepted_tx: mpsc::Sender<Accepted>,
    accepted_rx: mpsc::Receiver<Accepted>,
    acceptor: Option<JoinHandle<()>>,
    workers: JoinSet<()>,
    shutdown: Shutdown,
    shared: Arc<Shared>,
    escalate_tx: mpsc::Sender<usize>,
    restarts: VecDeque<Instant>,
}

impl AcceptorGroup {
    fn new(
        id: usize,
        listener: ListenerHandle,
        local_addr: SocketAddr,
        shared: Arc<Shared>,
        escalate_tx: mpsc::Sender<usize>,
    ) -> AcceptorGroup {
        let (accepted_tx, accepted_rx) = mpsc::channel(1);

        let acceptor = tokio::spawn(run_acceptor(
            id,
            listener.clone(),
            local_addr,
            accepted_tx.clone(),
            shared.signal.subscribe(),
            shared.telemetry.clone(),
        ));

        AcceptorGroup {
            id,
            listener,
            local_addr,
            accepted_tx,
            accepted_rx,
            acceptor: Some(acceptor),
            workers: JoinSet::new(),
            shutdown: shared.signal.subscribe(),
            shared,
            escalate_tx,
            restarts: VecDeque::new(),
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.recv() => break,
                Some(res) = OptionFuture::from(self.acceptor.as_mut()) => {
                    self.acceptor = None;
                    if !self.acceptor_exited(res) {
                        break;
                    }
                }
                maybe = self.accepted_rx.recv() => match maybe {
                    Some(accepted) => self.spawn_worker(accepted),
                    // We hold a sender ourselves, so the channel cannot
                    // close while we run.
                    None => break,
                },
                Some(res) = self.workers.join_next() => reap_worker(res),
            }
        }

        self.drain().await;
    }

    /// Decide what to do about a finished acceptor task. Returns `false`
    /// when the group should move to drain.
    fn acceptor_exited(&mut self, res: Result<(), JoinError>) -> bool {
        if self.shared.signal.is_raised() {
            // Normal exit on shutdown; drain follows.
            return false;
        }

        match res {
            Ok(()) => {
                // A clean return only happens on shutdown or when this
                // group is gone, and neither holds here.
                warn!(group = self.id, "acceptor exited unexpectedly");
            }
            Err(err) => {
                error!(group = self.id, cause = ?err, "acceptor crashed");
            }
        }

        let now = Instant::now();
        while let Some(oldest) = self.restarts.front() {
            if now.duration_since(*oldest) > ACCEPTOR_RESTART_WINDOW {
                self.restarts.pop_front();
            } else {
                break;
            }
        }

        if self.restarts.len() >= MAX_ACCEPTOR_RESTARTS {
            error!(group = self.id, "acceptor restart budget exhausted, escalating");
            let _ = self.escalate_tx.try_send(self.id);
            return false;
        }

        self.restarts.push_back(now);
        warn!(group = self.id, "restarting acceptor");
        self.acceptor = Some(tokio::spawn(run_acceptor(
            self.id,
            self.listener.clone(),
            self.local_addr,
            self.accepted_tx.clone(),
            self.shared.signal.subscribe(),
            self.shared.telemetry.clone(),
        )));

        true
    }

    fn spawn_worker(&mut self, accepted: Accepted) {
        let handler = self.shared.factory.make();
        let shutdown = self.shared.signal.subscribe();

        self.workers.spawn(worker::run(
            accepted,
            handler,
            shutdown,
            self.shared.read_timeout,
            self.shared.telemetry.clone(),
        ));
    }

    /// The group's part of the drain protocol: release the listener, give
    /// workers the drain budget to finish naturally, then abort the rest.
    async fn drain(mut self) {
        // The acceptor observes the same signal; wait it out so its
        // listener handle is released before ours.
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.await;
        }

        // The acceptor may have fully accepted a connection (and emitted
        // its start event) in the same poll that the shutdown branch won.
        // Anything already queued still gets a worker, so its handler and
        // close event run like any other connection's.
        while let Ok(accepted) = self.accepted_rx.try_recv() {
            self.spawn_worker(accepted);
        }

        drop(self.listener);
        drop(self.accepted_tx);
        drop(self.accepted_rx);

        let deadline = time::Instant::now() + self.shared.drain_budget();

        loop {
            match time::timeout_at(deadline, self.workers.join_next()).await {
                Ok(Some(res)) => reap_worker(res),
                Ok(None) => break,
                Err(_elapsed) => {
                    warn!(
                        group = self.id,
                        remaining = self.workers.len(),
                        "drain budget expired, aborting connections"
                    );
                    self.workers.abort_all();
                    while let Some(res) = self.workers.join_next().await {
                        if let Err(err) = &res {
                            if err.is_cancelled() {
                                continue;
                            }
                        }
                        reap_worker(res);
                    }
                    break;
                }
            }
        }
    }
}

fn reap_worker(res: Result<(), JoinError>) {
    if let Err(err) = res {
        if err.is_panic() {
            // Handler callbacks are panic-guarded inside the worker, so
            // this is framework glue; the connection is gone either way,
            // and the failure stays isolated to it.
            error!(cause = ?err, "connection task panicked");
        }
    }
}

/// The fixed-size set of acceptor groups, created at startup. Cardinality
/// is a static configuration choice; the pool is never resized.
pub(crate) struct AcceptorPool {
    groups: Vec<JoinHandle<()>>,
}

impl AcceptorPool {
    pub(crate) fn start(
        num_acceptors: usize,
        listener: &ListenerHandle,
        local_addr: SocketAddr,
        shared: &Arc<Shared>,
        escalate_tx: mpsc::Sender<usize>,
    ) -> AcceptorPool {
        let groups = (0..num_acceptors)
            .map(|id| {
                let group = AcceptorGroup::new(
                    id,
                    listener.clone(),
                    local_addr,
                    Arc::clone(shared),
                    escalate_tx.clone(),
                );
                tokio::spawn(group.run())
            })
            .collect();

        AcceptorPool { groups }
    }

    /// Wait for every group, and with it every worker, to terminate.
    pub(crate) async fn join(self) {
        for group in self.groups {
            let _ = group.await;
        }
    }
}
