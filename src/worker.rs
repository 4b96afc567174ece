//! The per-connection worker: drives one handler over one socket.
//!
//! One worker exists per accepted connection. It owns the socket from the
//! moment the acceptor hands it over, completes transport setup, and then
//! runs the handler's receive loop until the connection terminates. All
//! handler callbacks for a connection run inside its worker, one at a
//! time: reads, mailbox messages, timeouts, and the shutdown notice are
//! drawn from a single `select!` so no two callbacks ever overlap.

use crate::connection::Connection;
use crate::error::Error;
use crate::handler::{self, Directive, Handler, Message};
use crate::shutdown::Shutdown;
use crate::telemetry::{CloseReason, Telemetry, TelemetryEvent};
use crate::transport::{Accepted, Recv, Stream};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How a connection's receive loop ended.
enum Outcome {
    /// The peer performed an orderly close; `handle_close` applies.
    PeerClosed,
    /// The handler asked to close; no close callback applies.
    Closed,
    /// Abnormal termination; `handle_error` applies.
    Errored(Error),
}

/// Run one connection to completion.
///
/// The `Accepted` socket is moved in: ownership is transferred to this
/// task before the first read ever happens.
#[tracing::instrument(skip_all, fields(peer = %accepted.peer_addr()))]
pub(crate) async fn run(
    accepted: Accepted,
    mut handler: Box<dyn Handler>,
    shutdown: Shutdown,
    read_timeout: Duration,
    telemetry: Telemetry,
) {
    let started = Instant::now();
    let peer_addr = accepted.peer_addr();
    let local_addr = match accepted.local_addr() {
        Ok(addr) => addr,
        Err(err) => {
            // The socket died between accept and hand-off; nothing ever
            // reached the application, so no callback applies.
            debug!(cause = %err, "connection lost before setup");
            return;
        }
    };
    let (handle, mailbox) = handler::mailbox();

    let stream = match accepted.handshake().await {
        Ok(stream) => stream,
        Err(err) => {
            // The handler never sees a live socket, but the error contract
            // still applies: exactly one `handle_error`, then terminate.
            let mut conn = Connection::new(Stream::Dead, peer_addr, local_addr, handle);
            debug!(cause = %err, "transport setup failed");
            if let Err(panic) = guarded(handler.handle_error(&err, &mut conn)).await {
                warn!(cause = %panic, "handle_error panicked");
            }
            telemetry.emit(TelemetryEvent::ConnectionClose {
                duration: started.elapsed(),
                bytes_in: 0,
                bytes_out: 0,
                reason: CloseReason::Error,
            });
            return;
        }
    };

    telemetry.emit(TelemetryEvent::ConnectionReady {
        handshake_time: started.elapsed(),
    });

    let mut conn = Connection::new(stream, peer_addr, local_addr, handle);
    let mut shutdown = shutdown;
    let draining = shutdown.is_shutdown();

    let outcome = drive(&mut handler, &mut conn, mailbox, &mut shutdown, read_timeout).await;

    let reason = match &outcome {
        Outcome::Errored(_) => CloseReason::Error,
        _ if shutdown.is_shutdown() && !draining => CloseReason::Shutdown,
        _ => CloseReason::Normal,
    };

    match outcome {
        Outcome::PeerClosed => {
            // The peer half-closed; our write side is still usable, so the
            // handler gets a chance at a final reply before we close.
            if let Err(panic) = guarded(handler.handle_close(&mut conn)).await {
                warn!(cause = %panic, "handle_close panicked");
            }
            let _ = conn.shutdown_write().await;
        }
        Outcome::Closed => {
            let _ = conn.shutdown_write().await;
        }
        Outcome::Errored(err) => {
            debug!(cause = %err, "connection errored");
            if let Err(panic) = guarded(handler.handle_error(&err, &mut conn)).await {
                warn!(cause = %panic, "handle_error panicked");
            }
        }
    }

    telemetry.emit(TelemetryEvent::ConnectionClose {
        duration: started.elapsed(),
        bytes_in: conn.bytes_in(),
        bytes_out: conn.bytes_out(),
        reason,
    });
}

/// One cycle of the receive loop pulled something off the logical queue.
enum Event {
    Shutdown,
    Message(Option<Message>),
    Io(io::Result<Recv>),
}

/// The receive loop: apply a directive, then pull the next event.
///
/// The `biased` ordering realises the one-logical-queue rule: the shutdown
/// notice preempts pending work, mailbox messages are delivered in FIFO
/// order ahead of socket data, and a fresh read (with its own timeout)
/// only starts once the previous callback has returned.
async fn drive(
    handler: &mut Box<dyn Handler>,
    conn: &mut Connection,
    mut mailbox: mpsc::Receiver<Message>,
    shutdown: &mut Shutdown,
    read_timeout: Duration,
) -> Outcome {
    let mut next_timeout = read_timeout;
    let mut goodbye_said = false;

    let mut directive = match guarded(handler.start(conn)).await {
        Ok(directive) => directive,
        Err(panic) => return Outcome::Errored(panic),
    };

    loop {
        match directive {
            Directive::Continue => next_timeout = read_timeout,
            Directive::ContinueFor(timeout) => next_timeout = timeout,
            Directive::Switch(new_handler) => {
                *handler = new_handler;
                next_timeout = read_timeout;
            }
            Directive::Close => return Outcome::Closed,
            Directive::Error(err) => return Outcome::Errored(err),
        }

        let event = tokio::select! {
            biased;
            _ = shutdown.recv(), if !goodbye_said => Event::Shutdown,
            msg = mailbox.recv() => Event::Message(msg),
            res = conn.read_event(0, next_timeout) => Event::Io(res),
        };

        directive = match event {
            Event::Shutdown => {
                goodbye_said = true;
                match guarded(handler.handle_shutdown(conn)).await {
                    Ok(directive) => directive,
                    Err(panic) => return Outcome::Errored(panic),
                }
            }
            Event::Message(Some(msg)) => match guarded(handler.handle_message(msg, conn)).await {
                Ok(directive) => directive,
                Err(panic) => return Outcome::Errored(panic),
            },
            Event::Message(None) => {
                // Unreachable in practice: `conn` itself holds a mailbox
                // sender, so the channel cannot close while we run.
                Directive::Continue
            }
            Event::Io(Ok(Recv::Data(data))) => {
                match guarded(handler.handle_data(data, conn)).await {
                    Ok(directive) => directive,
                    Err(panic) => return Outcome::Errored(panic),
                }
            }
            Event::Io(Ok(Recv::TimedOut)) => match guarded(handler.handle_timeout(conn)).await {
                Ok(directive) => directive,
                Err(panic) => return Outcome::Errored(panic),
            },
            Event::Io(Ok(Recv::Closed)) => return Outcome::PeerClosed,
            Event::Io(Err(err)) => return Outcome::Errored(Error::Transport(err)),
        };
    }
}

/// Run a handler callback, converting a panic into a `HandlerPanic` error
/// so that one misbehaving connection never takes anything else with it.
async fn guarded<T, F>(fut: F) -> Result<T, Error>
where
    F: Future<Output = T>,
{
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|panic| Error::HandlerPanic(panic_message(&panic)))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_string()
    }
}
