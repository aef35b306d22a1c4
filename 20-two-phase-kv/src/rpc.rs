//! Replica RPC: wire messages, line framing, and the server that exposes a
//! [`ReplicaStore`] over TCP.
//!
//! Every message is one JSON object on one line, so a replica can be poked
//! with netcat. A connection may carry any number of request/response pairs.

use std::{future::Future, io, net::SocketAddr, sync::Arc};

use anyhow::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::command::Proposal;
use crate::store::ReplicaStore;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplicaRequest {
    Put { key: String, value: String },
    Get { key: String },
    Delete { key: String },
    Prepare { proposal: Proposal },
    Commit { proposal: Proposal },
    Abort { proposal: Proposal },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplicaResponse {
    Ack,
    Value { value: Option<String> },
    Deleted { existed: bool },
    Vote { commit: bool },
    Error { message: String },
}

/// Reads the next non-blank line, without its line ending.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }
        return Ok(Some(trimmed.to_string()));
    }
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    match read_line(reader).await? {
        Some(line) => serde_json::from_str(&line).map(Some).map_err(to_io_error),
        None => Ok(None),
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Applies one request to a store.
pub fn dispatch(store: &ReplicaStore, request: ReplicaRequest) -> ReplicaResponse {
    match request {
        ReplicaRequest::Put { key, value } => {
            store.put(key, value);
            ReplicaResponse::Ack
        }
        ReplicaRequest::Get { key } => ReplicaResponse::Value {
            value: store.get(&key),
        },
        ReplicaRequest::Delete { key } => ReplicaResponse::Deleted {
            existed: store.delete(&key),
        },
        ReplicaRequest::Prepare { proposal } => ReplicaResponse::Vote {
            commit: store.prepare(proposal),
        },
        ReplicaRequest::Commit { proposal } => {
            store.commit(proposal);
            ReplicaResponse::Ack
        }
        ReplicaRequest::Abort { proposal } => {
            store.abort(&proposal);
            ReplicaResponse::Ack
        }
    }
}

/// Serves one replica store to remote coordinators.
pub struct ReplicaServer {
    listener: TcpListener,
    store: Arc<ReplicaStore>,
}

impl ReplicaServer {
    pub fn new(listener: TcpListener, store: Arc<ReplicaStore>) -> Self {
        Self { listener, store }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn store(&self) -> &Arc<ReplicaStore> {
        &self.store
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let ReplicaServer { listener, store } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(replica = %store.name(), "replica server shutting down");
                    break;
                }
                accept_result = listener.accept() => match accept_result {
                    Ok((stream, peer)) => spawn_connection(stream, peer, &store),
                    Err(err) => warn!(error = ?err, "failed to accept replica connection"),
                }
            }
        }

        Ok(())
    }
}

fn spawn_connection(stream: TcpStream, peer: SocketAddr, store: &Arc<ReplicaStore>) {
    let store = Arc::clone(store);
    tokio::spawn(async move {
        if let Err(err) = serve_connection(stream, &store).await {
            warn!(peer = %peer, error = ?err, "replica connection closed with error");
        }
    });
}

async fn serve_connection(stream: TcpStream, store: &ReplicaStore) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    while let Some(line) = read_line(&mut reader).await? {
        let response = match serde_json::from_str::<ReplicaRequest>(&line) {
            Ok(request) => {
                debug!(replica = %store.name(), ?request, "replica request");
                dispatch(store, request)
            }
            Err(err) => ReplicaResponse::Error {
                message: format!("bad request: {err}"),
            },
        };
        write_message(&mut writer, &response).await?;
    }

    Ok(())
}
