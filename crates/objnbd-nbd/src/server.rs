//! NBD TCP listener
//!
//! Accepts clients on one port and runs each as an independent
//! [`Connection`]. Clients pick their volume by export name during the
//! handshake.

use crate::connection::Connection;
use crate::error::NbdResult;

use objnbd_block::AttachmentRegistry;
use objnbd_common::ConnectorConfig;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub struct NbdServer {
    config: Arc<ConnectorConfig>,
    registry: Arc<AttachmentRegistry>,
}

impl NbdServer {
    pub fn new(config: ConnectorConfig, registry: Arc<AttachmentRegistry>) -> Self {
        Self {
            config: Arc::new(config),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<AttachmentRegistry> {
        &self.registry
    }

    /// Build a connection over an already-established stream.
    pub fn connection<S>(
        &self,
        stream: S,
        peer: impl fmt::Display,
        shutdown: watch::Receiver<bool>,
    ) -> Connection<S>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        Connection::new(
            stream,
            peer,
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            shutdown,
        )
    }

    /// Bind `addr` and serve until `shutdown` flips to true.
    pub async fn serve(&self, addr: SocketAddr, shutdown: watch::Receiver<bool>) -> NbdResult<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("NBD: listening on {}", listener.local_addr()?);
        self.serve_listener(listener, shutdown).await
    }

    /// Accept loop over a bound listener.
    ///
    /// On shutdown, stops accepting and waits for every open connection to
    /// drain.
    pub async fn serve_listener(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> NbdResult<()> {
        let mut connections = JoinSet::new();

        while !*shutdown.borrow() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("NBD: set_nodelay for {peer}: {e}");
                        }
                        let conn = self.connection(stream, peer, shutdown.clone());
                        connections.spawn(async move {
                            if let Err(e) = conn.run().await {
                                warn!("NBD: client {peer} error: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("NBD: accept error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
                Some(joined) = connections.join_next() => {
                    if let Err(e) = joined {
                        error!("NBD: connection task failed: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(
            "NBD: shutting down, waiting for {} connections",
            connections.len()
        );
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                error!("NBD: connection task failed: {e}");
            }
        }
        Ok(())
    }
}
