//! Integration tests for the two-phase commit coordinator.
//!
//! Replicas live in-process; the ones that misbehave are wrapped in a
//! scripted handle that fails or stalls the phases it is told to.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use two_phase_kv::{
    cluster::ClusterView,
    command::{Operation, Proposal},
    coordinator::{Coordinator, CoordinatorConfig, Decision},
    error::{TransportError, Vote},
    replica::{LocalReplica, ReplicaHandle},
    router::RequestRouter,
    store::{RejectAll, ReplicaStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    None,
    RejectPrepare,
    UnreachablePrepare,
    FailCommit,
    HangPrepare,
}

/// Local replica with an optional scripted fault.
struct Scripted {
    inner: LocalReplica,
    fault: Fault,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    hold: Duration,
}

impl Scripted {
    fn new(store: Arc<ReplicaStore>, fault: Fault) -> Self {
        Self {
            inner: LocalReplica::new(store),
            fault,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            hold: Duration::ZERO,
        }
    }
}

#[async_trait]
impl ReplicaHandle for Scripted {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), TransportError> {
        self.inner.put(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, TransportError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool, TransportError> {
        self.inner.delete(key).await
    }

    async fn prepare(&self, proposal: &Proposal) -> Result<bool, TransportError> {
        match self.fault {
            Fault::RejectPrepare => return Ok(false),
            Fault::UnreachablePrepare => return Err(TransportError::Closed),
            Fault::HangPrepare => std::future::pending::<()>().await,
            Fault::None | Fault::FailCommit => {}
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.hold.is_zero() {
            tokio::time::sleep(self.hold).await;
        }
        self.inner.prepare(proposal).await
    }

    async fn commit(&self, proposal: &Proposal) -> Result<(), TransportError> {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.fault == Fault::FailCommit {
            return Err(TransportError::Remote("commit refused".into()));
        }
        self.inner.commit(proposal).await
    }

    async fn abort(&self, proposal: &Proposal) -> Result<(), TransportError> {
        if self.fault == Fault::HangPrepare {
            std::future::pending::<()>().await;
        }
        self.inner.abort(proposal).await
    }
}

/// Test harness: an in-process cluster where replica `i` (1-indexed) can be
/// given a fault.
struct TestCluster {
    stores: Vec<Arc<ReplicaStore>>,
    coordinator: Coordinator,
}

impl TestCluster {
    fn healthy(n: usize) -> Self {
        Self::with_faults(n, &[], CoordinatorConfig::default())
    }

    fn with_faults(n: usize, faults: &[(usize, Fault)], config: CoordinatorConfig) -> Self {
        let stores: Vec<Arc<ReplicaStore>> = (1..=n)
            .map(|i| Arc::new(ReplicaStore::new(format!("replica-{i}"))))
            .collect();
        let handles = stores
            .iter()
            .enumerate()
            .map(|(i, store)| {
                let fault = faults
                    .iter()
                    .find(|(id, _)| *id == i + 1)
                    .map_or(Fault::None, |(_, fault)| *fault);
                Arc::new(Scripted::new(Arc::clone(store), fault)) as Arc<dyn ReplicaHandle>
            })
            .collect();
        Self {
            stores,
            coordinator: Coordinator::with_config(ClusterView::new(handles), config),
        }
    }

    fn store(&self, id: usize) -> &ReplicaStore {
        &self.stores[id - 1]
    }

    fn snapshots(&self) -> Vec<BTreeMap<String, String>> {
        self.stores.iter().map(|s| s.snapshot()).collect()
    }

    fn nothing_staged(&self) -> bool {
        self.stores.iter().all(|s| s.staged().is_none())
    }
}

#[tokio::test]
async fn healthy_put_reaches_every_replica() -> Result<()> {
    let cluster = TestCluster::healthy(3);

    let committed = cluster
        .coordinator
        .perform_transaction(Operation::Put, "a", Some("1"))
        .await;

    assert!(committed);
    for id in 1..=3 {
        assert_eq!(cluster.store(id).get("a"), Some("1".to_string()));
    }
    assert!(cluster.nothing_staged());
    Ok(())
}

#[tokio::test]
async fn one_rejecting_replica_aborts_everywhere() -> Result<()> {
    let cluster = TestCluster::with_faults(
        3,
        &[(2, Fault::RejectPrepare)],
        CoordinatorConfig::default(),
    );

    let committed = cluster
        .coordinator
        .perform_transaction(Operation::Put, "b", Some("2"))
        .await;

    assert!(!committed);
    for id in 1..=3 {
        assert_eq!(cluster.store(id).get("b"), None);
    }
    assert!(cluster.nothing_staged());
    Ok(())
}

#[tokio::test]
async fn rejecting_store_policy_aborts() -> Result<()> {
    let stores = vec![
        Arc::new(ReplicaStore::new("replica-1")),
        Arc::new(ReplicaStore::with_policy("replica-2", RejectAll)),
    ];
    let handles = stores
        .iter()
        .map(|s| Arc::new(LocalReplica::new(Arc::clone(s))) as Arc<dyn ReplicaHandle>)
        .collect();
    let coordinator = Coordinator::new(ClusterView::new(handles));

    let report = coordinator.execute(Proposal::put("k", "v")).await;

    assert_eq!(report.decision, Decision::Abort);
    assert!(matches!(report.votes[1].vote, Vote::Rejected));
    assert!(stores.iter().all(|s| s.snapshot().is_empty()));
    Ok(())
}

#[tokio::test]
async fn deleting_an_absent_key_still_commits() -> Result<()> {
    let cluster = TestCluster::healthy(3);

    let committed = cluster
        .coordinator
        .perform_transaction(Operation::Delete, "never-written", None)
        .await;

    assert!(committed);
    assert!(cluster.snapshots().iter().all(BTreeMap::is_empty));
    Ok(())
}

#[tokio::test]
async fn put_without_a_value_aborts() -> Result<()> {
    let cluster = TestCluster::healthy(3);

    let committed = cluster
        .coordinator
        .perform_transaction(Operation::Put, "k", None)
        .await;

    assert!(!committed);
    for id in 1..=3 {
        assert_eq!(cluster.store(id).get("k"), None);
    }
    assert!(cluster.nothing_staged());

    // A replica asked directly votes the same proposal down.
    let bare_put = Proposal {
        operation: Operation::Put,
        key: "k".into(),
        value: None,
    };
    let replica = LocalReplica::new(Arc::clone(&cluster.stores[0]));
    assert!(!replica.prepare(&bare_put).await?);
    assert!(cluster.nothing_staged());
    Ok(())
}

#[tokio::test]
async fn failed_commit_leaves_an_observable_divergence() -> Result<()> {
    let cluster = TestCluster::with_faults(
        3,
        &[(3, Fault::FailCommit)],
        CoordinatorConfig::default(),
    );

    let report = cluster.coordinator.execute(Proposal::put("c", "3")).await;

    assert!(report.committed());
    assert_eq!(report.divergent_replicas(), vec!["replica-3"]);
    assert_eq!(cluster.store(1).get("c"), Some("3".to_string()));
    assert_eq!(cluster.store(2).get("c"), Some("3".to_string()));
    assert_eq!(cluster.store(3).get("c"), None);
    Ok(())
}

#[tokio::test]
async fn unanimity_is_required_at_every_cluster_size() -> Result<()> {
    for n in [1, 3, 5] {
        for dissenter in 1..=n {
            let cluster = TestCluster::with_faults(
                n,
                &[(dissenter, Fault::RejectPrepare)],
                CoordinatorConfig::default(),
            );
            let committed = cluster
                .coordinator
                .perform_transaction(Operation::Put, "k", Some("v"))
                .await;
            assert!(!committed, "n={n} dissenter={dissenter} should abort");
            assert!(cluster.snapshots().iter().all(BTreeMap::is_empty));
        }

        let cluster = TestCluster::healthy(n);
        assert!(
            cluster
                .coordinator
                .perform_transaction(Operation::Put, "k", Some("v"))
                .await
        );
    }
    Ok(())
}

#[tokio::test]
async fn unreachable_replica_counts_as_a_no_vote() -> Result<()> {
    let cluster = TestCluster::with_faults(
        3,
        &[(1, Fault::UnreachablePrepare)],
        CoordinatorConfig::default(),
    );

    let report = cluster.coordinator.execute(Proposal::put("x", "1")).await;

    assert_eq!(report.decision, Decision::Abort);
    assert!(matches!(report.votes[0].vote, Vote::Unreachable(_)));
    assert!(report.votes[1..].iter().all(|v| v.vote.is_yes()));
    assert!(cluster.snapshots().iter().all(BTreeMap::is_empty));
    Ok(())
}

#[tokio::test]
async fn abort_keeps_previously_committed_value() -> Result<()> {
    let cluster = TestCluster::with_faults(
        3,
        &[(2, Fault::RejectPrepare)],
        CoordinatorConfig::default(),
    );
    for store in &cluster.stores {
        store.put("a".into(), "old".into());
    }

    let put = cluster
        .coordinator
        .perform_transaction(Operation::Put, "a", Some("new"))
        .await;
    let delete = cluster
        .coordinator
        .perform_transaction(Operation::Delete, "a", None)
        .await;

    assert!(!put && !delete);
    for id in 1..=3 {
        assert_eq!(cluster.store(id).get("a"), Some("old".to_string()));
    }
    Ok(())
}

#[tokio::test]
async fn repeating_a_committed_put_changes_nothing() -> Result<()> {
    let cluster = TestCluster::healthy(3);

    assert!(cluster.coordinator.perform_transaction(Operation::Put, "a", Some("1")).await);
    let first = cluster.snapshots();
    assert!(cluster.coordinator.perform_transaction(Operation::Put, "a", Some("1")).await);

    assert_eq!(cluster.snapshots(), first);
    Ok(())
}

#[tokio::test]
async fn call_timeout_turns_a_stalled_replica_into_an_abort() -> Result<()> {
    let config = CoordinatorConfig {
        call_timeout: Some(Duration::from_millis(100)),
        ..CoordinatorConfig::default()
    };
    let cluster = TestCluster::with_faults(3, &[(2, Fault::HangPrepare)], config);

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        cluster.coordinator.execute(Proposal::put("slow", "1")),
    )
    .await?;

    assert_eq!(report.decision, Decision::Abort);
    assert!(matches!(
        report.votes[1].vote,
        Vote::Unreachable(TransportError::Timeout(_))
    ));
    assert!(cluster.snapshots().iter().all(BTreeMap::is_empty));
    Ok(())
}

/// Runs five concurrent PUTs on one key against a single slow replica and
/// returns the most prepares that were ever in flight at once.
async fn peak_prepares_on_one_key(sequence_keys: bool) -> usize {
    let store = Arc::new(ReplicaStore::new("replica-1"));
    let mut replica = Scripted::new(Arc::clone(&store), Fault::None);
    replica.hold = Duration::from_millis(20);
    let peak = Arc::clone(&replica.peak);

    let config = CoordinatorConfig {
        sequence_keys,
        ..CoordinatorConfig::default()
    };
    let view = ClusterView::new(vec![Arc::new(replica) as Arc<dyn ReplicaHandle>]);
    let coordinator = Coordinator::with_config(view, config);

    let writes = (0..5).map(|i| {
        let value = i.to_string();
        let coordinator = &coordinator;
        async move {
            coordinator
                .perform_transaction(Operation::Put, "hot", Some(value.as_str()))
                .await
        }
    });
    assert!(join_all(writes).await.into_iter().all(|ok| ok));
    assert!(store.get("hot").is_some());

    peak.load(Ordering::SeqCst)
}

#[tokio::test]
async fn sequenced_keys_run_one_transaction_at_a_time() -> Result<()> {
    assert_eq!(peak_prepares_on_one_key(true).await, 1);
    assert!(peak_prepares_on_one_key(false).await > 1);
    Ok(())
}

#[tokio::test]
async fn router_reads_from_the_first_replica() -> Result<()> {
    let cluster = TestCluster::healthy(3);
    let router = RequestRouter::new(Arc::new(cluster.coordinator));

    assert_eq!(router.handle_line("PUT a 1").await, "PUT OK");
    cluster.stores[0].put("a".into(), "primary".into());
    cluster.stores[1].put("a".into(), "secondary".into());

    assert_eq!(router.handle_line("GET a").await, "GET OK: primary");
    assert_eq!(router.handle_line("DELETE a").await, "DELETE OK");
    assert_eq!(router.handle_line("GET a").await, "GET ERROR: Key not found");
    Ok(())
}
