//! Server configuration.

use crate::error::{Error, Result};
use crate::handler::MakeHandler;
use crate::telemetry::{TelemetryEvent, TelemetryHook};
use crate::transport::Transport;
use crate::DEFAULT_PORT;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_NUM_ACCEPTORS: usize = 10;
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

/// Immutable server configuration, consumed by
/// [`Server::start`](crate::Server::start).
///
/// Build one with [`ServerConfig::builder`]; only the handler factory is
/// required.
pub struct ServerConfig {
    pub(crate) host: IpAddr,
    pub(crate) port: u16,
    pub(crate) transport: Transport,
    pub(crate) factory: Arc<dyn MakeHandler>,
    pub(crate) num_acceptors: usize,
    pub(crate) read_timeout: Duration,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) telemetry_hook: Option<TelemetryHook>,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

/// Builder for [`ServerConfig`].
pub struct ServerConfigBuilder {
    host: IpAddr,
    port: u16,
    transport: Transport,
    factory: Option<Arc<dyn MakeHandler>>,
    num_acceptors: usize,
    read_timeout: Duration,
    shutdown_timeout: Duration,
    telemetry_hook: Option<TelemetryHook>,
}

impl Default for ServerConfigBuilder {
    fn default() -> ServerConfigBuilder {
        ServerConfigBuilder {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            transport: Transport::default(),
            factory: None,
            num_acceptors: DEFAULT_NUM_ACCEPTORS,
            read_timeout: DEFAULT_READ_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            telemetry_hook: None,
        }
    }
}

impl ServerConfigBuilder {
    /// Local address to bind. Defaults to `0.0.0.0`.
    pub fn host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    /// TCP port to bind; `0` asks the OS for an ephemeral port. Defaults
    /// to [`DEFAULT_PORT`].
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Cleartext or TLS. Defaults to cleartext.
    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// The handler factory invoked once per accepted connection. Required.
    pub fn handler(mut self, factory: impl MakeHandler + 'static) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Number of acceptor groups. Defaults to 10.
    pub fn num_acceptors(mut self, num_acceptors: usize) -> Self {
        self.num_acceptors = num_acceptors;
        self
    }

    /// Default per-read timeout, steering `handle_timeout`. Defaults to
    /// 60 seconds.
    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Drain budget for graceful shutdown. Defaults to 15 seconds.
    pub fn shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    /// Fire-and-forget observer for [`TelemetryEvent`]s.
    pub fn telemetry_hook(
        mut self,
        hook: impl Fn(&TelemetryEvent) + Send + Sync + 'static,
    ) -> Self {
        self.telemetry_hook = Some(Arc::new(hook));
        self
    }

    /// Validate and assemble the configuration.
    pub fn build(self) -> Result<ServerConfig> {
        let factory = self
            .factory
            .ok_or_else(|| Error::Config("a handler factory is required".to_string()))?;

        if self.num_acceptors == 0 {
            return Err(Error::Config(
                "num_acceptors must be at least 1".to_string(),
            ));
        }
        if self.read_timeout.is_zero() {
            return Err(Error::Config("read_timeout must be non-zero".to_string()));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(Error::Config(
                "shutdown_timeout must be non-zero".to_string(),
            ));
        }

        Ok(ServerConfig {
            host: self.host,
            port: self.port,
            transport: self.transport,
            factory,
            num_acceptors: self.num_acceptors,
            read_timeout: self.read_timeout,
            shutdown_timeout: self.shutdown_timeout,
            telemetry_hook: self.telemetry_hook,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use crate::ErrorKind;

    struct Noop;
    impl Handler for Noop {}

    fn factory() -> Box<dyn Handler> {
        Box::new(Noop)
    }

    #[test]
    fn defaults_match_documentation() {
        let config = ServerConfig::builder().handler(factory).build().unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.num_acceptors, 10);
        assert_eq!(config.read_timeout, Duration::from_secs(60));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(15));
        assert_eq!(config.transport.kind(), "tcp");
    }

    #[test]
    fn missing_handler_is_rejected() {
        let Err(err) = ServerConfig::builder().build() else {
            panic!("build must fail without a handler");
        };
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn zero_acceptors_is_rejected() {
        let Err(err) = ServerConfig::builder().handler(factory).num_acceptors(0).build() else {
            panic!("build must fail with zero acceptors");
        };
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
