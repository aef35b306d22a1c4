//! Handles through which the coordinator reaches replicas.
//!
//! Every call returns a value or a [`TransportError`]; nothing is thrown
//! across the boundary. [`LocalReplica`] talks to a store in the same
//! process, [`RemoteReplica`] speaks the JSON line RPC from [`crate::rpc`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::{io::BufReader, net::TcpStream, time::timeout};

use crate::command::Proposal;
use crate::error::TransportError;
use crate::rpc::{read_message, write_message, ReplicaRequest, ReplicaResponse};
use crate::store::ReplicaStore;

/// The capability set of one replica.
#[async_trait]
pub trait ReplicaHandle: Send + Sync {
    /// Label used in logs and reports.
    fn name(&self) -> &str;

    async fn put(&self, key: &str, value: &str) -> Result<(), TransportError>;

    async fn get(&self, key: &str) -> Result<Option<String>, TransportError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, TransportError>;

    /// Returns the replica's vote.
    async fn prepare(&self, proposal: &Proposal) -> Result<bool, TransportError>;

    async fn commit(&self, proposal: &Proposal) -> Result<(), TransportError>;

    async fn abort(&self, proposal: &Proposal) -> Result<(), TransportError>;
}

/// In-process handle. Never fails.
#[derive(Clone)]
pub struct LocalReplica {
    store: Arc<ReplicaStore>,
}

impl LocalReplica {
    pub fn new(store: Arc<ReplicaStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<ReplicaStore> {
        &self.store
    }
}

#[async_trait]
impl ReplicaHandle for LocalReplica {
    fn name(&self) -> &str {
        self.store.name()
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), TransportError> {
        self.store.put(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, TransportError> {
        Ok(self.store.get(key))
    }

    async fn delete(&self, key: &str) -> Result<bool, TransportError> {
        Ok(self.store.delete(key))
    }

    async fn prepare(&self, proposal: &Proposal) -> Result<bool, TransportError> {
        Ok(self.store.prepare(proposal.clone()))
    }

    async fn commit(&self, proposal: &Proposal) -> Result<(), TransportError> {
        self.store.commit(proposal.clone());
        Ok(())
    }

    async fn abort(&self, proposal: &Proposal) -> Result<(), TransportError> {
        self.store.abort(proposal);
        Ok(())
    }
}

/// Default bound on establishing a connection to a remote replica.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a replica served by [`crate::rpc::ReplicaServer`].
///
/// Opens a fresh connection per call, so a replica that restarts is picked
/// up again on the next call without any reconnect logic.
#[derive(Debug, Clone)]
pub struct RemoteReplica {
    name: String,
    addr: String,
    connect_timeout: Duration,
}

impl RemoteReplica {
    pub fn new(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        Self {
            name: addr.clone(),
            addr,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn call(&self, request: ReplicaRequest) -> Result<ReplicaResponse, TransportError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))?
            .map_err(|source| TransportError::Connect {
                addr: self.addr.clone(),
                source,
            })?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        write_message(&mut writer, &request).await?;
        match read_message::<_, ReplicaResponse>(&mut reader).await? {
            Some(ReplicaResponse::Error { message }) => Err(TransportError::Remote(message)),
            Some(response) => Ok(response),
            None => Err(TransportError::Closed),
        }
    }
}

fn unexpected(response: ReplicaResponse) -> TransportError {
    TransportError::Remote(format!("unexpected response: {response:?}"))
}

#[async_trait]
impl ReplicaHandle for RemoteReplica {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), TransportError> {
        let request = ReplicaRequest::Put {
            key: key.to_string(),
            value: value.to_string(),
        };
        match self.call(request).await? {
            ReplicaResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, TransportError> {
        let request = ReplicaRequest::Get {
            key: key.to_string(),
        };
        match self.call(request).await? {
            ReplicaResponse::Value { value } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, TransportError> {
        let request = ReplicaRequest::Delete {
            key: key.to_string(),
        };
        match self.call(request).await? {
            ReplicaResponse::Deleted { existed } => Ok(existed),
            other => Err(unexpected(other)),
        }
    }

    async fn prepare(&self, proposal: &Proposal) -> Result<bool, TransportError> {
        let request = ReplicaRequest::Prepare {
            proposal: proposal.clone(),
        };
        match self.call(request).await? {
            ReplicaResponse::Vote { commit } => Ok(commit),
            other => Err(unexpected(other)),
        }
    }

    async fn commit(&self, proposal: &Proposal) -> Result<(), TransportError> {
        let request = ReplicaRequest::Commit {
            proposal: proposal.clone(),
        };
        match self.call(request).await? {
            ReplicaResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn abort(&self, proposal: &Proposal) -> Result<(), TransportError> {
        let request = ReplicaRequest::Abort {
            proposal: proposal.clone(),
        };
        match self.call(request).await? {
            ReplicaResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}
