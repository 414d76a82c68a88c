use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;

use frameserver::{
    setup_local_tracing, AppError, AppResult, Handler, IpcMessage, Server, ServerConfig, Session,
};

/// Echo server: each request is a 4-byte big-endian length header followed
/// by that many body bytes, and the body is written straight back.
#[derive(Parser)]
#[command(version)]
struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    conf: Option<String>,
    /// listen address used when no config file is given
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    addr: String,
}

struct EchoHandler;

impl Handler for EchoHandler {
    fn on_connected(&self, session: &Arc<Session>, peer_addr: SocketAddr) -> AppResult<()> {
        info!("session {}: {} connected", session.id(), peer_addr);
        Ok(())
    }

    fn on_request_header(&self, _session: &Arc<Session>, header: &[u8]) -> AppResult<usize> {
        let bytes: [u8; 4] = header
            .try_into()
            .map_err(|_| AppError::handler("header must be 4 bytes"))?;
        Ok(u32::from_be_bytes(bytes) as usize)
    }

    fn on_request_body(&self, session: &Arc<Session>, body: &[u8]) -> AppResult<()> {
        session.write(body)?;
        Ok(())
    }

    fn on_ipc(&self, _session: &Arc<Session>, _message: IpcMessage) -> AppResult<()> {
        Ok(())
    }

    fn on_closed(&self, session: &Arc<Session>) {
        info!("session {} closed", session.id());
    }
}

#[tokio::main]
async fn main() -> AppResult<()> {
    setup_local_tracing()?;

    let commandline = CommandLine::parse();
    let config = match &commandline.conf {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::new(commandline.addr.clone(), 4),
    };

    let mut server = Server::new(config, Arc::new(EchoHandler));
    server.start().await?;
    if let Some(addr) = server.local_addr() {
        info!("echo server ready on {}", addr);
    }

    signal::ctrl_c().await?;
    info!("shutdown signal received");
    server.stop().await?;
    Ok(())
}
