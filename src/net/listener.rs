// TCP listener for voice clients
// Accepts connections and hands each one to a JsonClient

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::connection::Connection;
use super::json_client::JsonClient;
use crate::coordinator::Coordinator;

/// Accept loop handle. Dropping it stops accepting new clients; clients
/// already connected keep running until they disconnect.
pub struct TcpServer {
    addr: SocketAddr,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl TcpServer {
    /// Bind `addr` and serve voice clients against `coordinator`.
    pub async fn start_with_coordinator(
        addr: SocketAddr,
        coordinator: Arc<Coordinator>,
        motd: String,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                debug!(%peer_addr, "Accepted connection");
                                let coordinator = Arc::clone(&coordinator);
                                let motd = motd.clone();
                                tokio::spawn(async move {
                                    let connection = Connection::new(stream, peer_addr);
                                    let mut client = JsonClient::new(connection, motd, coordinator);
                                    if let Err(e) = client.run().await {
                                        warn!(%peer_addr, "Client error: {}", e);
                                    }
                                });
                            }
                            Err(e) => warn!("Accept error: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!(addr = %local_addr, "Voice listener shutting down");
                        break;
                    }
                }
            }
        });

        info!(addr = %local_addr, "Voice client handler listening (TCP)");

        Ok(TcpServer {
            addr: local_addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Get the address the server is listening on
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}
