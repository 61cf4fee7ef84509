//! TCP listener: one session task per accepted connection

use std::net::SocketAddr;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::protocol::Session;
use crate::shutdown::Shutdown;
use crate::state::AppState;

pub struct Server {
    listener: TcpListener,
    app: AppState,
}

impl Server {
    pub async fn bind(addr: &str, app: AppState) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to listen on {}", addr))?;
        Ok(Self { listener, app })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until shutdown. Sessions already running are left to finish.
    pub async fn run(self, mut shutdown: Shutdown) {
        let addr = self
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".into());
        info!("Listening on {}", addr);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!("Accepted connection from {}", peer);
                        let session = Session::new(stream, peer.to_string(), self.app.clone());
                        tokio::spawn(session.start());
                    }
                    Err(e) => error!("Accept on {} failed: {}", addr, e),
                },
                _ = shutdown.wait() => break,
            }
        }
        info!("Listener on {} stopped", addr);
    }

    pub fn spawn(self, shutdown: Shutdown) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
