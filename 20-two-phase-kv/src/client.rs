//! Client-side tools: one-shot requests against a gateway, store
//! pre-population, and a concurrent mixed workload driven straight through a
//! coordinator.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::stream::{self, StreamExt};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpStream, UdpSocket},
    time::timeout,
};
use tracing::{info, warn};

use crate::command::Operation;
use crate::coordinator::Coordinator;
use crate::gateway::udp::MAX_DATAGRAM;
use crate::protocol::Response;

/// Bound on connecting to a gateway and on waiting for its answer.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Sends one request line over TCP and returns the response line.
pub async fn send_tcp(server: SocketAddr, request: &str) -> Result<String> {
    let stream = timeout(REQUEST_TIMEOUT, TcpStream::connect(server))
        .await
        .with_context(|| format!("timed out connecting to {server}"))?
        .with_context(|| format!("failed to connect to {server}"))?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    writer.write_all(request.trim_end().as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    let mut line = String::new();
    let bytes = timeout(REQUEST_TIMEOUT, reader.read_line(&mut line))
        .await
        .context("timed out waiting for response")??;
    if bytes == 0 {
        return Err(anyhow!("server closed the connection without responding"));
    }
    Ok(line.trim_end().to_string())
}

/// Sends one request datagram and returns the response datagram.
pub async fn send_udp(server: SocketAddr, request: &str) -> Result<String> {
    let bind_addr = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .context("failed to bind udp socket")?;
    socket.connect(server).await?;
    socket.send(request.trim_end().as_bytes()).await?;

    let mut buf = [0u8; MAX_DATAGRAM];
    let len = timeout(REQUEST_TIMEOUT, socket.recv(&mut buf))
        .await
        .context("timed out waiting for response")??;
    Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
}

/// Seeds `key1..=keyN` with `value1..=valueN` through two-phase commit.
///
/// Returns how many of the writes committed; failures are logged, not fatal.
pub async fn prepopulate(coordinator: &Coordinator, count: usize) -> usize {
    let mut committed = 0;
    for i in 1..=count {
        let key = format!("key{i}");
        let value = format!("value{i}");
        if coordinator
            .perform_transaction(Operation::Put, &key, Some(value.as_str()))
            .await
        {
            info!(%key, %value, "pre-populated");
            committed += 1;
        } else {
            warn!(%key, %value, "failed to pre-populate");
        }
    }
    committed
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadStep {
    Put { key: String, value: String },
    /// Reads from the replica at this index of the cluster view.
    Get { key: String, replica: usize },
    Delete { key: String },
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step: WorkloadStep,
    pub response: Response,
}

/// The PUT, GET and DELETE steps for `key1..=keyN`, in submission order.
pub fn workload_steps(keys: usize, replicas: usize) -> Vec<WorkloadStep> {
    let names: Vec<String> = (1..=keys).map(|i| format!("key{i}")).collect();
    let puts = names.iter().enumerate().map(|(i, key)| WorkloadStep::Put {
        key: key.clone(),
        value: format!("value{}", i + 1),
    });
    let gets = names.iter().enumerate().map(|(i, key)| WorkloadStep::Get {
        key: key.clone(),
        replica: i % replicas.max(1),
    });
    let deletes = names
        .iter()
        .map(|key| WorkloadStep::Delete { key: key.clone() });
    puts.chain(gets).chain(deletes).collect()
}

/// Runs the workload with at most `concurrency` steps in flight.
///
/// Steps are started in submission order but may finish in any order, so a
/// GET can observe its key before, during or after the matching PUT.
pub async fn run_workload(
    coordinator: Arc<Coordinator>,
    keys: usize,
    concurrency: usize,
) -> Vec<StepOutcome> {
    let steps = workload_steps(keys, coordinator.replicas().len());
    stream::iter(steps)
        .map(|step| {
            let coordinator = Arc::clone(&coordinator);
            async move {
                let response = run_step(&coordinator, &step).await;
                info!(?step, %response, "workload step finished");
                StepOutcome { step, response }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await
}

async fn run_step(coordinator: &Coordinator, step: &WorkloadStep) -> Response {
    match step {
        WorkloadStep::Put { key, value } => {
            if coordinator
                .perform_transaction(Operation::Put, key, Some(value.as_str()))
                .await
            {
                Response::PutOk
            } else {
                Response::PutError
            }
        }
        WorkloadStep::Get { key, replica } => {
            let Some(handle) = coordinator.replicas().replicas().get(*replica) else {
                return Response::RemoteError(format!("no replica at index {replica}"));
            };
            match handle.get(key).await {
                Ok(Some(value)) => Response::GetOk(value),
                Ok(None) => Response::GetNotFound,
                Err(err) => Response::RemoteError(err.to_string()),
            }
        }
        WorkloadStep::Delete { key } => {
            if coordinator
                .perform_transaction(Operation::Delete, key, None)
                .await
            {
                Response::DeleteOk
            } else {
                Response::DeleteError
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterView;

    #[test]
    fn steps_cover_every_key_in_three_rounds() {
        let steps = workload_steps(5, 3);
        assert_eq!(steps.len(), 15);
        assert_eq!(
            steps[0],
            WorkloadStep::Put {
                key: "key1".into(),
                value: "value1".into(),
            }
        );
        assert_eq!(
            steps[9],
            WorkloadStep::Get {
                key: "key5".into(),
                replica: 1,
            }
        );
        assert_eq!(steps[14], WorkloadStep::Delete { key: "key5".into() });
    }

    #[tokio::test]
    async fn prepopulate_writes_every_replica() {
        let (view, stores) = ClusterView::local(5);
        let coordinator = Coordinator::new(view);
        assert_eq!(prepopulate(&coordinator, 5).await, 5);
        for store in &stores {
            assert_eq!(store.get("key3"), Some("value3".to_string()));
        }
    }

    #[tokio::test]
    async fn sequential_workload_ends_with_empty_stores() {
        let (view, stores) = ClusterView::local(3);
        let outcomes = run_workload(Arc::new(Coordinator::new(view)), 5, 1).await;

        assert_eq!(outcomes.len(), 15);
        assert!(outcomes.iter().all(|o| o.response != Response::PutError));
        assert!(outcomes
            .iter()
            .filter(|o| matches!(o.step, WorkloadStep::Get { .. }))
            .all(|o| matches!(o.response, Response::GetOk(_))));
        assert!(stores.iter().all(|s| s.snapshot().is_empty()));
    }
}
