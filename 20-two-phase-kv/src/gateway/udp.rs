use std::{future::Future, io, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{net::UdpSocket, select};
use tracing::{info, warn};

use super::GatewayConfig;
use crate::pool::WorkerPool;
use crate::router::RequestRouter;

/// Largest request datagram accepted; longer ones are truncated.
pub const MAX_DATAGRAM: usize = 1024;

pub struct UdpGateway {
    socket: Arc<UdpSocket>,
    router: Arc<RequestRouter>,
    config: GatewayConfig,
}

impl UdpGateway {
    pub fn new(socket: UdpSocket, router: Arc<RequestRouter>, config: GatewayConfig) -> Self {
        Self {
            socket: Arc::new(socket),
            router,
            config,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serves datagrams until `shutdown` resolves, then drains the pool.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let UdpGateway {
            socket,
            router,
            config,
        } = self;
        let pool = WorkerPool::new(config.pool);
        let mut buf = [0u8; MAX_DATAGRAM];
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("udp gateway shutting down");
                    break;
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        let request = buf[..len].to_vec();
                        let socket = Arc::clone(&socket);
                        let router = Arc::clone(&router);
                        pool.submit(async move {
                            if let Err(err) = answer(&socket, peer, &request, &router).await {
                                warn!(%peer, error = ?err, "failed to answer udp client");
                            }
                        })
                        .await;
                    }
                    // On some platforms an ICMP error from an earlier reply
                    // surfaces here; the socket itself is still usable.
                    Err(err) => warn!(error = ?err, "failed to receive udp datagram"),
                }
            }
        }

        pool.shutdown(config.shutdown_grace).await;
        Ok(())
    }
}

async fn answer(
    socket: &UdpSocket,
    peer: SocketAddr,
    request: &[u8],
    router: &RequestRouter,
) -> io::Result<()> {
    let text = String::from_utf8_lossy(request);
    info!(%peer, request = %text.trim_end(), "received");
    let response = router.handle_bytes(request).await;
    socket.send_to(response.as_bytes(), peer).await?;
    info!(%peer, %response, "sent");
    Ok(())
}
