use std::sync::Arc;

use tracing::{debug, warn};

use crate::cluster::ClusterView;
use crate::command::Operation;
use crate::coordinator::Coordinator;
use crate::error::{ProtocolError, TransportError};
use crate::protocol::{Request, Response};

/// Front door used by every gateway.
///
/// Offers the same put/get/delete set as a single replica, but writes go
/// through the coordinator and reads go straight to the first replica of the
/// cluster view. Built once at startup and shared by reference.
pub struct RequestRouter {
    coordinator: Arc<Coordinator>,
}

impl RequestRouter {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn replicas(&self) -> &ClusterView {
        self.coordinator.replicas()
    }

    pub async fn put(&self, key: &str, value: &str) -> bool {
        self.coordinator
            .perform_transaction(Operation::Put, key, Some(value))
            .await
    }

    /// Deletes through 2PC. Replicas do not check existence on prepare, so
    /// deleting an absent key still succeeds.
    pub async fn delete(&self, key: &str) -> bool {
        self.coordinator
            .perform_transaction(Operation::Delete, key, None)
            .await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, TransportError> {
        match self.replicas().primary() {
            Some(replica) => replica.get(key).await,
            None => Ok(None),
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Put { key, value } => {
                if self.put(&key, &value).await {
                    Response::PutOk
                } else {
                    Response::PutError
                }
            }
            Request::Get { key } => match self.get(&key).await {
                Ok(Some(value)) => Response::GetOk(value),
                Ok(None) => Response::GetNotFound,
                Err(err) => {
                    warn!(%key, error = %err, "read replica unreachable");
                    Response::RemoteError(err.to_string())
                }
            },
            Request::Delete { key } => {
                if self.delete(&key).await {
                    Response::DeleteOk
                } else {
                    Response::DeleteError
                }
            }
        }
    }

    /// Turns one request line into one response line.
    pub async fn handle_line(&self, line: &str) -> String {
        self.respond(Request::parse(line)).await
    }

    /// Like [`RequestRouter::handle_line`] for a line read off the wire as
    /// raw bytes. A line that is not valid UTF-8 gets a malformed-request
    /// error.
    pub async fn handle_bytes(&self, line: &[u8]) -> String {
        self.respond(Request::parse_bytes(line)).await
    }

    async fn respond(&self, parsed: Result<Request, ProtocolError>) -> String {
        let response = match parsed {
            Ok(request) => self.handle(request).await,
            Err(err) => {
                debug!(error = %err, "rejected request line");
                Response::Invalid(err)
            }
        };
        response.to_string()
    }
}
