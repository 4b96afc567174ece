//! The per-connection socket wrapper handed to handler callbacks.

use crate::error::{Error, Result};
use crate::handler::{ConnectionHandle, ConnectionMeta};
use crate::transport::{Recv, Stream};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// A live accepted connection.
///
/// Owned exclusively by the worker task driving the handler; callbacks
/// borrow it to reply, half-close, or look up the address pair. No other
/// task ever reads, writes, or closes the underlying socket.
///
/// The `bytes_in` / `bytes_out` counters track payload bytes and feed the
/// `connection.close` telemetry event.
#[derive(Debug)]
pub struct Connection {
    stream: Stream,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    handle: ConnectionHandle,
    bytes_in: u64,
    bytes_out: u64,
}

impl Connection {
    pub(crate) fn new(
        stream: Stream,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        handle: ConnectionHandle,
    ) -> Connection {
        Connection {
            stream,
            peer_addr,
            local_addr,
            handle,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    /// Remote address of the peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Local address of the accepted socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Mailbox sender for this connection, usable from other tasks to
    /// deliver out-of-band messages (see
    /// [`Handler::handle_message`](crate::Handler::handle_message)).
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Detachable identity snapshot: address pair plus mailbox handle.
    pub fn meta(&self) -> ConnectionMeta {
        ConnectionMeta::new(self.peer_addr, self.local_addr, self.handle())
    }

    /// Payload bytes received so far.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Payload bytes sent so far.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    /// Send payload to the peer.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.stream.send(data).await?;
        self.bytes_out += data.len() as u64;
        Ok(())
    }

    /// Half-close the connection: further sends fail, the peer's reads
    /// drain normally. For TLS this sends the close_notify alert.
    pub async fn shutdown_write(&mut self) -> Result<()> {
        self.stream.shutdown_write().await?;
        Ok(())
    }

    /// One read of at most `max_bytes` (`0` means whatever is available in
    /// one read), waiting no longer than `timeout`.
    ///
    /// Returns `Ok(None)` on orderly peer close. A timeout surfaces as a
    /// `Transport` error with [`io::ErrorKind::TimedOut`]. Intended for
    /// handlers that drive a synchronous exchange inside one callback;
    /// the worker's own read loop is what feeds `handle_data`.
    pub async fn recv(&mut self, max_bytes: usize, timeout: Duration) -> Result<Option<Bytes>> {
        match self.read_event(max_bytes, timeout).await? {
            Recv::Data(data) => Ok(Some(data)),
            Recv::Closed => Ok(None),
            Recv::TimedOut => Err(Error::Transport(io::Error::new(
                io::ErrorKind::TimedOut,
                "read timed out",
            ))),
        }
    }

    /// Tri-state read used by the worker loop; timeouts are an event here,
    /// not an error.
    pub(crate) async fn read_event(&mut self, max_bytes: usize, timeout: Duration) -> io::Result<Recv> {
        let event = self.stream.recv(max_bytes, timeout).await?;
        if let Recv::Data(data) = &event {
            self.bytes_in += data.len() as u64;
        }
        Ok(event)
    }
}
