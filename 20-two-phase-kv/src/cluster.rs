use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Result};

use crate::replica::{LocalReplica, RemoteReplica, ReplicaHandle};
use crate::store::ReplicaStore;

/// The fixed, ordered set of replicas a coordinator addresses.
///
/// Built once at startup and never changed afterwards; cloning shares the
/// same handles.
#[derive(Clone)]
pub struct ClusterView {
    replicas: Arc<[Arc<dyn ReplicaHandle>]>,
}

impl ClusterView {
    pub fn new(replicas: Vec<Arc<dyn ReplicaHandle>>) -> Self {
        Self {
            replicas: replicas.into(),
        }
    }

    /// Remote handles for the configured replica addresses, in order.
    pub fn from_addrs<S: AsRef<str>>(addrs: &[S], connect_timeout: Duration) -> Result<Self> {
        ensure!(!addrs.is_empty(), "cluster requires at least one replica");
        let replicas = addrs
            .iter()
            .map(|addr| {
                let handle =
                    RemoteReplica::new(addr.as_ref()).with_connect_timeout(connect_timeout);
                Arc::new(handle) as Arc<dyn ReplicaHandle>
            })
            .collect();
        Ok(Self::new(replicas))
    }

    /// An in-process cluster of `n` empty stores named `replica-1..=n`.
    ///
    /// Returns the stores too so callers can inspect replica state directly.
    pub fn local(n: usize) -> (Self, Vec<Arc<ReplicaStore>>) {
        let stores: Vec<Arc<ReplicaStore>> = (1..=n)
            .map(|i| Arc::new(ReplicaStore::new(format!("replica-{i}"))))
            .collect();
        let replicas = stores
            .iter()
            .map(|store| Arc::new(LocalReplica::new(Arc::clone(store))) as Arc<dyn ReplicaHandle>)
            .collect();
        (Self::new(replicas), stores)
    }

    pub fn replicas(&self) -> &[Arc<dyn ReplicaHandle>] {
        &self.replicas
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// The replica GET requests are sent to.
    pub fn primary(&self) -> Option<&Arc<dyn ReplicaHandle>> {
        self.replicas.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_addrs_rejects_empty_cluster() {
        let addrs: [&str; 0] = [];
        assert!(ClusterView::from_addrs(&addrs, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn from_addrs_keeps_configured_order() -> Result<()> {
        let view = ClusterView::from_addrs(
            &["127.0.0.1:1099", "127.0.0.1:1100"],
            Duration::from_secs(1),
        )?;
        let names: Vec<&str> = view.replicas().iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["127.0.0.1:1099", "127.0.0.1:1100"]);
        assert_eq!(view.primary().map(|r| r.name()), Some("127.0.0.1:1099"));
        Ok(())
    }

    #[test]
    fn local_cluster_names_replicas_in_order() {
        let (view, stores) = ClusterView::local(3);
        assert_eq!(view.len(), 3);
        assert_eq!(stores[2].name(), "replica-3");
    }
}
