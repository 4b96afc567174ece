use std::io;
use thiserror::Error;

/// A specialized `Result` for framework operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The configuration could not be used, e.g. an unreadable TLS
    /// certificate. Surfaced synchronously from [`Server::start`].
    ///
    /// [`Server::start`]: crate::Server::start
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The OS refused the listen (port in use, permission denied).
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),
    /// The TLS handshake with a peer failed (bad client hello, unsupported
    /// cipher, TLS alert).
    #[error("tls handshake failed: {0}")]
    Handshake(#[source] io::Error),
    /// A mid-connection read or write failed.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    /// An application callback panicked. The panic is caught by the
    /// connection worker and never takes down its acceptor group.
    #[error("handler panicked: {0}")]
    HandlerPanic(String),
    /// The handler requested abnormal termination via
    /// [`Directive::Error`](crate::Directive::Error).
    #[error("handler error: {0}")]
    Handler(String),
}

/// Coarse classification of an [`Error`], stable across source rewording.
///
/// Handlers usually only care which leg of the error taxonomy they are on,
/// not the underlying io error; `handle_error` implementations match on
/// this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Bind,
    Handshake,
    Transport,
    HandlerPanic,
    Handler,
}

impl Error {
    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Bind(_) => ErrorKind::Bind,
            Error::Handshake(_) => ErrorKind::Handshake,
            Error::Transport(_) => ErrorKind::Transport,
            Error::HandlerPanic(_) => ErrorKind::HandlerPanic,
            Error::Handler(_) => ErrorKind::Handler,
        }
    }
}
