//! The application-facing connection handler contract.
//!
//! A [`Handler`] is the set of callbacks that defines per-connection
//! behaviour; the framework owns everything else. Handlers are created per
//! connection by a [`MakeHandler`] factory, so per-connection state is
//! simply the fields of the handler value, and options a handler needs are
//! the captured state of the factory.
//!
//! Every steering callback returns a [`Directive`] telling the worker what
//! to do next. Callbacks on one connection are invoked strictly serially;
//! no two callbacks ever overlap.

use crate::connection::Connection;
use crate::error::Error;
use async_trait::async_trait;
use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;

/// An out-of-band message delivered to a connection's mailbox.
pub type Message = Box<dyn Any + Send>;

/// Mailbox depth per connection. Senders back off once it is full.
const MAILBOX_CAPACITY: usize = 32;

/// What the worker should do next, returned from every steering callback.
pub enum Directive {
    /// Remain in the receive loop; the next read uses the configured
    /// `read_timeout`.
    Continue,
    /// Remain in the receive loop, overriding the next read's timeout.
    ContinueFor(Duration),
    /// Hand this connection off to a different handler (protocol
    /// upgrades). The new handler's `start` is not re-invoked; whatever
    /// state it needs travels inside the new handler value.
    Switch(Box<dyn Handler>),
    /// Perform an orderly close.
    Close,
    /// Terminate abnormally; `handle_error` will be invoked with this
    /// error.
    Error(Error),
}

impl fmt::Debug for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::Continue => f.write_str("Continue"),
            Directive::ContinueFor(timeout) => f.debug_tuple("ContinueFor").field(timeout).finish(),
            Directive::Switch(_) => f.write_str("Switch(..)"),
            Directive::Close => f.write_str("Close"),
            Directive::Error(err) => f.debug_tuple("Error").field(err).finish(),
        }
    }
}

/// Per-connection behaviour, supplied by the application.
///
/// All callbacks have defaults, so a handler implements only what it needs:
/// a request/response protocol typically implements `handle_data` alone.
/// The worker guarantees that `handle_close` and `handle_error` are
/// mutually exclusive and invoked at most once per connection.
#[async_trait]
pub trait Handler: Send {
    /// Invoked once, after the worker owns the socket and any TLS
    /// handshake has completed, before the first read.
    async fn start(&mut self, _conn: &mut Connection) -> Directive {
        Directive::Continue
    }

    /// Invoked for each non-empty read.
    async fn handle_data(&mut self, _data: Bytes, _conn: &mut Connection) -> Directive {
        Directive::Continue
    }

    /// Invoked when a read times out.
    async fn handle_timeout(&mut self, _conn: &mut Connection) -> Directive {
        Directive::Close
    }

    /// Invoked for each message delivered to the connection's mailbox (see
    /// [`ConnectionHandle`]). Messages and socket reads are drawn from one
    /// logical queue, so this never interleaves with an in-flight read
    /// callback.
    async fn handle_message(&mut self, _msg: Message, _conn: &mut Connection) -> Directive {
        Directive::Continue
    }

    /// Invoked once when the server starts draining while this connection
    /// is still alive: one opportunity to say goodbye. The default keeps
    /// the connection running until it finishes naturally or the drain
    /// budget expires and it is forcibly closed.
    async fn handle_shutdown(&mut self, _conn: &mut Connection) -> Directive {
        Directive::Continue
    }

    /// Invoked on orderly close by the peer, exactly once. The write side
    /// is still open at this point, so a final reply is possible.
    async fn handle_close(&mut self, _conn: &mut Connection) {}

    /// Invoked on abnormal termination, exactly once: transport errors,
    /// TLS handshake failures, handler panics, and `Directive::Error`.
    async fn handle_error(&mut self, _error: &Error, _conn: &mut Connection) {}
}

/// Factory producing one [`Handler`] per accepted connection.
///
/// Implemented for free by closures:
///
/// ```ignore
/// config.handler(|| Box::new(Echo) as Box<dyn Handler>)
/// ```
pub trait MakeHandler: Send + Sync {
    fn make(&self) -> Box<dyn Handler>;
}

impl<F> MakeHandler for F
where
    F: Fn() -> Box<dyn Handler> + Send + Sync,
{
    fn make(&self) -> Box<dyn Handler> {
        self()
    }
}

/// Address pair and mailbox handle for one connection.
///
/// A cheap, detachable snapshot of [`Connection`] identity, suitable for
/// registries that route out-of-band messages to live connections.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    handle: ConnectionHandle,
}

impl ConnectionMeta {
    pub(crate) fn new(
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        handle: ConnectionHandle,
    ) -> ConnectionMeta {
        ConnectionMeta {
            peer_addr,
            local_addr,
            handle,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }
}

/// Sends out-of-band messages into a live connection's mailbox.
///
/// Cloneable and usable from any task. Delivery failure (the connection is
/// gone) hands the message back to the caller.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<Message>,
}

impl ConnectionHandle {
    /// Deliver a message, waiting for mailbox capacity if necessary.
    pub async fn send(&self, msg: Message) -> Result<(), Message> {
        self.tx.send(msg).await.map_err(|err| err.0)
    }

    /// Deliver a message without waiting. Fails if the mailbox is full or
    /// the connection is gone.
    pub fn try_send(&self, msg: Message) -> Result<(), Message> {
        self.tx.try_send(msg).map_err(|err| match err {
            mpsc::error::TrySendError::Full(msg) => msg,
            mpsc::error::TrySendError::Closed(msg) => msg,
        })
    }
}

/// Create the mailbox pair for a new connection.
pub(crate) fn mailbox() -> (ConnectionHandle, mpsc::Receiver<Message>) {
    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    (ConnectionHandle { tx }, rx)
}
