//! TCP listener for worker streams.

use crate::error::Result;
use crate::worker::registry::WorkerRegistry;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Accepts worker connections and hands each to the registry.
pub struct WorkerServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl WorkerServer {
    /// Bind `bind_addr` and start accepting. Use port 0 for an ephemeral
    /// port; [`Self::addr`] reports the bound address.
    pub async fn start(
        bind_addr: &str,
        registry: WorkerRegistry,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "worker stream server listening");

        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "worker accept failed");
                        continue;
                    }
                };
                debug!(%peer, "worker connected");
                let registry = registry.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    let (reader, writer) = stream.into_split();
                    let peer = peer.to_string();
                    if let Err(e) = registry.serve_stream(reader, writer, &peer, token).await {
                        warn!(%peer, error = %e, "worker stream ended with error");
                    } else {
                        debug!(%peer, "worker stream closed");
                    }
                });
            }
            info!("worker stream server stopped");
        });

        Ok(Self {
            addr,
            shutdown,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and wait for the accept loop to exit. Open streams
    /// observe the same token and close on their own.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "worker server task join failed");
        }
    }
}
