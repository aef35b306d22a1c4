//! Two-phase commit coordinator.
//!
//! A transaction is a scatter-gather in two rounds:
//!
//! 1. **Prepare**: one task per replica asks for a vote; the coordinator waits
//!    for every task (join-all barrier). A transport failure is a "no".
//! 2. **Commit or abort**: commit only if every vote was "yes", otherwise
//!    abort. Again one task per replica and a join-all barrier.
//!
//! The decision is fixed after round 1. Failures in round 2 are reported and
//! logged but never change it: a replica that misses its commit simply ends
//! up divergent.
//!
//! The coordinator keeps no per-transaction state between calls and takes no
//! locks by default, so concurrent transactions on the same key are not
//! ordered relative to each other. [`CoordinatorConfig::sequence_keys`]
//! turns on [`KeySequencer`] for callers that need that ordering.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use nanoid::nanoid;
use tokio::task::JoinError;
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::cluster::ClusterView;
use crate::command::{Operation, Proposal};
use crate::error::{TransportError, Vote};
use crate::replica::ReplicaHandle;
use crate::sequencer::KeySequencer;

/// Tuning knobs. The defaults reproduce the baseline protocol exactly.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    /// Upper bound on each replica call. `None` waits forever, so a single
    /// unresponsive replica stalls the transaction.
    pub call_timeout: Option<Duration>,
    /// Run at most one transaction per key at a time through this coordinator.
    pub sequence_keys: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Commit,
    Abort,
}

/// How one replica voted in phase 1.
#[derive(Debug)]
pub struct ReplicaVote {
    pub replica: String,
    pub vote: Vote,
}

/// A phase 2 call that did not go through.
#[derive(Debug)]
pub struct PhaseTwoFault {
    pub replica: String,
    pub error: TransportError,
}

/// Everything that happened during one transaction.
#[derive(Debug)]
pub struct TransactionReport {
    pub id: String,
    pub proposal: Proposal,
    pub decision: Decision,
    pub votes: Vec<ReplicaVote>,
    pub faults: Vec<PhaseTwoFault>,
}

impl TransactionReport {
    pub fn committed(&self) -> bool {
        self.decision == Decision::Commit
    }

    /// Replicas that were told to commit but may not have applied the write.
    pub fn divergent_replicas(&self) -> Vec<&str> {
        if self.decision != Decision::Commit {
            return Vec::new();
        }
        self.faults.iter().map(|f| f.replica.as_str()).collect()
    }
}

pub struct Coordinator {
    view: ClusterView,
    config: CoordinatorConfig,
    sequencer: Option<KeySequencer>,
}

impl Coordinator {
    pub fn new(view: ClusterView) -> Self {
        Self::with_config(view, CoordinatorConfig::default())
    }

    pub fn with_config(view: ClusterView, config: CoordinatorConfig) -> Self {
        let sequencer = config.sequence_keys.then(KeySequencer::new);
        Self {
            view,
            config,
            sequencer,
        }
    }

    /// The replicas this coordinator drives. GET paths read from here directly.
    pub fn replicas(&self) -> &ClusterView {
        &self.view
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Runs one transaction and returns the phase 1 decision: `true` iff
    /// every replica voted to commit. A PUT with no value is aborted without
    /// contacting any replica.
    pub async fn perform_transaction(
        &self,
        operation: Operation,
        key: &str,
        value: Option<&str>,
    ) -> bool {
        let proposal = Proposal {
            operation,
            key: key.to_string(),
            value: value.map(str::to_string),
        };
        self.execute(proposal).await.committed()
    }

    /// Runs one transaction and reports votes, decision and phase 2 faults.
    pub async fn execute(&self, proposal: Proposal) -> TransactionReport {
        let id = nanoid!(10);
        let span = info_span!("txn", %id, operation = %proposal.operation, key = %proposal.key);
        self.run(id, proposal).instrument(span).await
    }

    async fn run(&self, id: String, proposal: Proposal) -> TransactionReport {
        let _key_guard = match &self.sequencer {
            Some(sequencer) => Some(sequencer.acquire(&proposal.key).await),
            None => None,
        };

        if !proposal.is_well_formed() {
            warn!("refusing PUT without a value; aborting before prepare");
            return TransactionReport {
                id,
                proposal,
                decision: Decision::Abort,
                votes: Vec::new(),
                faults: Vec::new(),
            };
        }

        info!(value = ?proposal.value, replicas = self.view.len(), "starting two-phase commit");
        let proposal = Arc::new(proposal);

        let votes = self.prepare_all(&proposal).await;
        let decision = if votes.iter().all(|v| v.vote.is_yes()) {
            Decision::Commit
        } else {
            Decision::Abort
        };
        info!(?decision, "phase 1 complete");

        let faults = self.finish_all(decision, &proposal).await;
        if decision == Decision::Commit && !faults.is_empty() {
            warn!(
                divergent = faults.len(),
                "transaction committed but some replicas did not acknowledge"
            );
        }

        TransactionReport {
            id,
            proposal: Arc::unwrap_or_clone(proposal),
            decision,
            votes,
            faults,
        }
    }

    async fn prepare_all(&self, proposal: &Arc<Proposal>) -> Vec<ReplicaVote> {
        let results = self
            .fan_out(proposal, |replica, proposal| async move {
                replica.prepare(&proposal).await
            })
            .await;

        results
            .into_iter()
            .map(|(replica, result)| {
                let vote = match result {
                    Ok(true) => Vote::Yes,
                    Ok(false) => Vote::Rejected,
                    Err(err) => Vote::Unreachable(err),
                };
                if vote.is_yes() {
                    debug!(%replica, "voted yes");
                } else {
                    warn!(%replica, %vote, "replica did not vote to commit");
                }
                ReplicaVote { replica, vote }
            })
            .collect()
    }

    async fn finish_all(&self, decision: Decision, proposal: &Arc<Proposal>) -> Vec<PhaseTwoFault> {
        let results = match decision {
            Decision::Commit => {
                self.fan_out(proposal, |replica, proposal| async move {
                    replica.commit(&proposal).await
                })
                .await
            }
            Decision::Abort => {
                self.fan_out(proposal, |replica, proposal| async move {
                    replica.abort(&proposal).await
                })
                .await
            }
        };

        results
            .into_iter()
            .filter_map(|(replica, result)| match result {
                Ok(()) => {
                    debug!(%replica, ?decision, "phase 2 acknowledged");
                    None
                }
                Err(error) => {
                    warn!(%replica, ?decision, %error, "phase 2 call failed");
                    Some(PhaseTwoFault { replica, error })
                }
            })
            .collect()
    }

    /// Spawns `call` once per replica and waits for all of them.
    ///
    /// Results come back in cluster order, paired with the replica's name.
    async fn fan_out<T, F, Fut>(
        &self,
        proposal: &Arc<Proposal>,
        call: F,
    ) -> Vec<(String, Result<T, TransportError>)>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn ReplicaHandle>, Arc<Proposal>) -> Fut,
        Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        let limit = self.config.call_timeout;
        let tasks: Vec<_> = self
            .view
            .replicas()
            .iter()
            .map(|replica| {
                let fut = call(Arc::clone(replica), Arc::clone(proposal));
                tokio::spawn(bounded(limit, fut).in_current_span())
            })
            .collect();

        let names = self.view.replicas().iter().map(|r| r.name().to_string());
        names
            .zip(join_all(tasks).await)
            .map(|(name, joined)| (name, joined.unwrap_or_else(|err| Err(task_failure(err)))))
            .collect()
    }
}

async fn bounded<T, Fut>(limit: Option<Duration>, call: Fut) -> Result<T, TransportError>
where
    Fut: Future<Output = Result<T, TransportError>>,
{
    match limit {
        Some(limit) => timeout(limit, call)
            .await
            .unwrap_or(Err(TransportError::Timeout(limit))),
        None => call.await,
    }
}

fn task_failure(err: JoinError) -> TransportError {
    TransportError::Task(err.to_string())
}
