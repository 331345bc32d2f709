//! Accept loop: one worker task per inbound connection.
//!
//! The server owns nothing but the TCP listener and the shared
//! [`ClientRegistry`]; all session logic lives in [`crate::worker`]. A
//! worker is spawned before any login happens, so a connection that never
//! logs in still times out and is torn down like any other.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::registry::ClientRegistry;
use crate::transport::TcpTransport;
use crate::worker::{Worker, RECEIVE_TIMEOUT};

/// Server tuning knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on. Port 0 picks an ephemeral port.
    pub bind: SocketAddr,
    /// Per-connection inactivity timeout handed to every worker.
    pub receive_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:50000".parse().unwrap(),
            receive_timeout: RECEIVE_TIMEOUT,
        }
    }
}

/// A bound chat server, not yet accepting.
pub struct ChatServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<ClientRegistry>,
    receive_timeout: Duration,
}

impl ChatServer {
    pub async fn bind(config: ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind).await?;
        let local_addr = listener.local_addr()?;
        log::info!("[server] listening on {local_addr}");
        Ok(Self {
            listener,
            local_addr,
            registry: Arc::new(ClientRegistry::new()),
            receive_timeout: config.receive_timeout,
        })
    }

    /// The actual bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared client registry, for inspection.
    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accept connections forever. Errors from `accept` end the loop;
    /// errors on individual connections only cost that connection.
    pub async fn run(self) -> io::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            log::debug!("[server] connection from {peer}");
            match TcpTransport::new(stream) {
                Ok(conn) => {
                    let worker = Worker::new(Arc::clone(&self.registry), Arc::new(conn))
                        .with_receive_timeout(self.receive_timeout);
                    tokio::spawn(worker.run());
                }
                Err(e) => {
                    log::warn!("[server] dropping connection from {peer}: {e}");
                }
            }
        }
    }
}
