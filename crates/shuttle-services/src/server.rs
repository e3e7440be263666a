//! Server loop — reads the shared socket and hands datagrams to the registry.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use crate::registry::Registry;

/// Serve until `shutdown` fires. Per-datagram problems are logged and
/// skipped; the loop only ends on shutdown.
pub async fn serve(
    socket: Arc<UdpSocket>,
    registry: Registry,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let max_datagram = registry.settings().max_datagram;
    let mut buf = vec![0u8; max_datagram + 1];
    tracing::info!(addr = %socket.local_addr()?, max_datagram, "serving");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!(sessions = registry.len(), "server loop shutting down");
                return Ok(());
            }

            result = socket.recv_from(&mut buf) => {
                let (len, peer) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "recv_from failed");
                        continue;
                    }
                };
                if len > max_datagram {
                    tracing::warn!(%peer, len, max_datagram, "oversized datagram dropped");
                    continue;
                }
                registry.route(peer, Bytes::copy_from_slice(&buf[..len])).await;
            }
        }
    }
}
