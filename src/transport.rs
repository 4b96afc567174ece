//! Socket transport: cleartext TCP and TLS behind one surface.
//!
//! The rest of the crate never touches `TcpStream` or `TlsStream` directly.
//! A [`Transport`] is resolved into a [`Binding`] at startup (loading TLS
//! material, so configuration problems surface before the listen socket
//! exists), bound into a [`Listener`], and each accepted socket travels as
//! an [`Accepted`] until its worker completes the handshake and obtains a
//! [`Stream`].

use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// Upper bound on a single unsized read.
const RECV_BUFFER_SIZE: usize = 16 * 1024;

/// Transport selection for a server: plain TCP, or TLS on top of it.
#[derive(Debug, Clone, Default)]
pub enum Transport {
    #[default]
    Tcp,
    Tls(TlsConfig),
}

impl Transport {
    /// Short transport name used in telemetry and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Tls(_) => "tls",
        }
    }
}

/// TLS material and options for a [`Transport::Tls`] server.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// PEM file with the certificate chain, leaf first.
    pub cert_path: PathBuf,
    /// PEM file with the matching private key.
    pub key_path: PathBuf,
    /// ALPN protocols to advertise, in preference order. Empty disables
    /// ALPN.
    pub alpn_protocols: Vec<Vec<u8>>,
}

impl TlsConfig {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> TlsConfig {
        TlsConfig {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            alpn_protocols: Vec::new(),
        }
    }

    /// Advertise the given ALPN protocols, in preference order.
    pub fn with_alpn<I, P>(mut self, protocols: I) -> TlsConfig
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        self.alpn_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }
}

/// A [`Transport`] resolved into bindable state.
///
/// For TLS this is where certificates are read and parsed, so a broken
/// configuration fails [`Server::start`](crate::Server::start) instead of
/// every handshake.
pub(crate) struct Binding {
    kind: &'static str,
    tls: Option<TlsAcceptor>,
}

impl Binding {
    pub(crate) fn from_transport(transport: &Transport) -> Result<Binding> {
        let tls = match transport {
            Transport::Tcp => None,
            Transport::Tls(config) => Some(build_tls_acceptor(config)?),
        };

        Ok(Binding {
            kind: transport.kind(),
            tls,
        })
    }

    /// Bind the listen socket. Port `0` asks the OS for an ephemeral port;
    /// the chosen port is readable via [`Listener::local_addr`].
    pub(crate) async fn bind(self, addr: SocketAddr) -> Result<Listener> {
        let listener = TcpListener::bind(addr).await.map_err(Error::Bind)?;

        Ok(Listener {
            listener,
            tls: self.tls,
            kind: self.kind,
        })
    }
}

fn build_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    let certs = load_certs(&config.cert_path)?;
    let key = load_key(&config.key_path)?;

    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| Error::Config(format!("invalid tls certificate or key: {err}")))?;

    if !config.alpn_protocols.is_empty() {
        server_config.alpn_protocols = config.alpn_protocols.clone();
    }

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .map_err(|err| Error::Config(format!("unreadable certificate {}: {err}", path.display())))?;

    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<io::Result<Vec<_>>>()
        .map_err(|err| Error::Config(format!("malformed certificate {}: {err}", path.display())))?;

    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .map_err(|err| Error::Config(format!("unreadable private key {}: {err}", path.display())))?;

    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|err| Error::Config(format!("malformed private key {}: {err}", path.display())))?
        .ok_or_else(|| Error::Config(format!("no private key found in {}", path.display())))
}

/// The bound listen socket. One per server.
///
/// Acceptors invoke [`accept`](Listener::accept) through a shared
/// [`ListenerHandle`]; the OS serialises concurrent accepts internally.
/// The socket closes when the last handle drops.
pub(crate) struct Listener {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    kind: &'static str,
}

impl Listener {
    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub(crate) fn kind(&self) -> &'static str {
        self.kind
    }

    /// Accept one connection. The TLS handshake is NOT performed here; the
    /// returned [`Accepted`] carries everything the worker needs to finish
    /// transport setup off the accept path.
    pub(crate) async fn accept(&self) -> io::Result<Accepted> {
        let (stream, peer_addr) = self.listener.accept().await?;

        Ok(Accepted {
            stream,
            peer_addr,
            tls: self.tls.clone(),
        })
    }
}

/// Shared reference to the [`Listener`], tied to a close notification.
///
/// Handles are held by acceptor tasks (to accept) and their groups (to
/// respawn a crashed acceptor). Each handle also holds a guard sender;
/// when every handle is gone the guard channel closes, which is how
/// [`Server::stop`](crate::Server::stop) learns that the OS socket is
/// closed and new connects are being refused.
#[derive(Clone)]
pub(crate) struct ListenerHandle {
    inner: Arc<Listener>,
    _guard: mpsc::Sender<()>,
}

impl ListenerHandle {
    /// Wraps `listener`, returning the handle and the receiver that
    /// completes once every handle (and with it the socket) is gone.
    pub(crate) fn new(listener: Listener) -> (ListenerHandle, mpsc::Receiver<()>) {
        let (guard, closed_rx) = mpsc::channel(1);
        let handle = ListenerHandle {
            inner: Arc::new(listener),
            _guard: guard,
        };
        (handle, closed_rx)
    }

    pub(crate) async fn accept(&self) -> io::Result<Accepted> {
        self.inner.accept().await
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub(crate) fn kind(&self) -> &'static str {
        self.inner.kind()
    }
}

/// A freshly accepted socket, prior to any TLS handshake.
///
/// Ownership moves from the acceptor into the worker task; only the worker
/// ever drives the handshake or reads from the socket.
pub(crate) struct Accepted {
    stream: TcpStream,
    peer_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
}

impl Accepted {
    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    /// Complete transport setup. A no-op for cleartext; drives the TLS
    /// handshake for TLS.
    pub(crate) async fn handshake(self) -> Result<Stream> {
        match self.tls {
            None => Ok(Stream::Tcp(self.stream)),
            Some(acceptor) => match acceptor.accept(self.stream).await {
                Ok(stream) => Ok(Stream::Tls(stream)),
                Err(err) => Err(Error::Handshake(err)),
            },
        }
    }
}

/// Outcome of a single bounded read.
#[derive(Debug)]
pub(crate) enum Recv {
    /// Payload bytes arrived.
    Data(Bytes),
    /// The peer performed an orderly close of its write side.
    Closed,
    /// Nothing arrived within the allotted time.
    TimedOut,
}

/// An established connection stream, cleartext or TLS.
///
/// `Dead` stands in for a socket that never finished transport setup, so
/// that `handle_error` still has a connection value to receive; all io on
/// it fails with `NotConnected`.
#[derive(Debug)]
pub(crate) enum Stream {
    Tcp(TcpStream),
    Tls(TlsStream<TcpStream>),
    Dead,
}

impl Stream {
    /// One read of at most `max_bytes` (`0` means whatever is available, up
    /// to an internal bound), waiting no longer than `timeout`.
    pub(crate) async fn recv(&mut self, max_bytes: usize, timeout: Duration) -> io::Result<Recv> {
        let capacity = match max_bytes {
            0 => RECV_BUFFER_SIZE,
            n => n,
        };
        let mut buf = BytesMut::zeroed(capacity);

        match time::timeout(timeout, self.read(&mut buf[..])).await {
            Err(_elapsed) => Ok(Recv::TimedOut),
            Ok(Ok(0)) => Ok(Recv::Closed),
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(Recv::Data(buf.freeze()))
            }
            Ok(Err(err)) => Err(err),
        }
    }

    /// Write the whole payload and flush it to the wire.
    pub(crate) async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all(data).await?;
        self.flush().await
    }

    /// Half-close: further sends fail, peer reads drain. For TLS this also
    /// sends the close_notify alert.
    pub(crate) async fn shutdown_write(&mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport setup failed")
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Stream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            Stream::Dead => Poll::Ready(Err(not_connected())),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_write(cx, data),
            Stream::Tls(stream) => Pin::new(stream).poll_write(cx, data),
            Stream::Dead => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Stream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            Stream::Dead => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Stream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            Stream::Dead => Poll::Ready(Err(not_connected())),
        }
    }
}
