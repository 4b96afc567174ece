use anyhow::Context;
use async_trait::async_trait;
use berth::{Connection, Directive, Handler, Server, ServerConfig, DEFAULT_HOST, DEFAULT_PORT};
use bytes::Bytes;
use clap::Parser;
use std::net::IpAddr;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "berth-echo", version, author)]
/// A TCP echo server built on berth
struct EchoCli {
    /// Port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Address to bind
    #[arg(long, default_value = DEFAULT_HOST)]
    host: IpAddr,
    /// Number of acceptor groups
    #[arg(long, default_value_t = 10)]
    acceptors: usize,
}

struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn handle_data(&mut self, data: Bytes, conn: &mut Connection) -> Directive {
        match conn.send(&data).await {
            Ok(()) => Directive::Continue,
            Err(err) => Directive::Error(err),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = EchoCli::parse();

    let config = ServerConfig::builder()
        .host(cli.host)
        .port(cli.port)
        .num_acceptors(cli.acceptors)
        .handler(|| Box::new(Echo) as Box<dyn Handler>)
        .build()
        .context("invalid configuration")?;

    let server = Server::start(config)
        .await
        .context("failed to start server")?;
    info!(port = server.listener_info().port, "echo server running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    server.stop().await;

    Ok(())
}
