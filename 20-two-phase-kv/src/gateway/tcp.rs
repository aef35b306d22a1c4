use std::{future::Future, io, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use super::GatewayConfig;
use crate::error::ProtocolError;
use crate::pool::WorkerPool;
use crate::protocol::Response;
use crate::router::RequestRouter;

/// Longest request line accepted, line ending included. A client that sends
/// more without a newline is answered with an error and disconnected.
pub const MAX_LINE: usize = 8 * 1024;

pub struct TcpGateway {
    listener: TcpListener,
    router: Arc<RequestRouter>,
    config: GatewayConfig,
}

impl TcpGateway {
    pub fn new(listener: TcpListener, router: Arc<RequestRouter>, config: GatewayConfig) -> Self {
        Self {
            listener,
            router,
            config,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves connections until `shutdown` resolves, then drains the pool.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let TcpGateway {
            listener,
            router,
            config,
        } = self;
        let pool = WorkerPool::new(config.pool);
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("tcp gateway shutting down");
                    break;
                }
                accept_result = listener.accept() => match accept_result {
                    Ok((stream, peer)) => {
                        info!(%peer, "connection established");
                        let router = Arc::clone(&router);
                        pool.submit(async move {
                            if let Err(err) = serve_connection(stream, peer, &router).await {
                                warn!(%peer, error = ?err, "tcp client closed with error");
                            }
                        })
                        .await;
                    }
                    Err(err) => warn!(error = ?err, "failed to accept tcp connection"),
                }
            }
        }

        pool.shutdown(config.shutdown_grace).await;
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: &RequestRouter,
) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = (&mut reader)
            .take(MAX_LINE as u64)
            .read_until(b'\n', &mut line)
            .await?;
        if read == 0 {
            break;
        }

        if read == MAX_LINE && line.last() != Some(&b'\n') {
            // No way to find the next request boundary; answer and hang up.
            warn!(%peer, limit = MAX_LINE, "request line too long; closing connection");
            let error = ProtocolError::Malformed("request line too long".to_string());
            write_line(&mut writer, &Response::Invalid(error).to_string()).await?;
            break;
        }

        let text = String::from_utf8_lossy(&line);
        info!(%peer, request = %text.trim_end(), "received");
        let response = router.handle_bytes(&line).await;
        write_line(&mut writer, &response).await?;
        info!(%peer, %response, "sent");
    }

    debug!(%peer, "tcp client disconnected");
    Ok(())
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
