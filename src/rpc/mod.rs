//! Control server for operators and the CLI.
//!
//! JSON-RPC 2.0 over TCP with newline-delimited framing.
//!
//! - `protocol`: request/response types and error codes
//! - `transport`: TCP listener, one task per connection
//! - `methods`: method dispatch onto [`MirrorEngine`]
//! - `client`: client used by the CLI subcommands

pub mod client;
pub mod methods;
pub mod protocol;
mod transport;

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

use crate::core::MirrorEngine;
use transport::Transport;

pub use client::{ClientError, RpcClient};
pub use methods::MethodHandler;
pub use protocol::{Request, Response, RpcError};

pub struct RpcServer {
    transport: Transport,
    shutdown: CancellationToken,
}

impl RpcServer {
    /// Bind the listening socket. Port 0 picks a free port; see
    /// [`RpcServer::local_addr`].
    pub async fn bind(engine: MirrorEngine, bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let transport = Transport::bind(bind_addr, MethodHandler::new(engine)).await?;
        Ok(Self {
            transport,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Serve until [`RpcServer::shutdown`] is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.transport.listen(self.shutdown.clone()).await
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
