//! Replica-local storage and transaction slot.
//!
//! Each replica owns a committed key-value map (the only state GET can see)
//! and a single staging slot that holds the proposal between prepare and the
//! matching commit or abort.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use crate::command::{Operation, Proposal};

/// Decides how a replica votes on prepare.
///
/// The baseline store always accepts. A store that wants conflict or
/// capacity checks plugs in its own policy; the coordinator honours a `false`.
pub trait VotePolicy: Send + Sync {
    fn accepts(&self, proposal: &Proposal) -> bool;
}

/// Votes yes to everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAccept;

impl VotePolicy for AlwaysAccept {
    fn accepts(&self, _proposal: &Proposal) -> bool {
        true
    }
}

/// Votes no to everything. Useful for drills where one replica must dissent.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectAll;

impl VotePolicy for RejectAll {
    fn accepts(&self, _proposal: &Proposal) -> bool {
        false
    }
}

/// One replica's state: committed data plus the in-flight transaction slot.
///
/// # Locking
///
/// `slot` is the replica's exclusive critical section. put, delete, prepare,
/// commit and abort hold it for their whole duration, so transactional and
/// direct writes on one replica are serialized.
///
/// `data` is only ever written while `slot` is held. GET takes a read lock on
/// `data` alone and never waits on the critical section: it sees either the
/// pre- or post-commit value of a key, never a partial write.
pub struct ReplicaStore {
    name: String,
    data: RwLock<BTreeMap<String, String>>,
    slot: Mutex<Option<Proposal>>,
    policy: Box<dyn VotePolicy>,
}

impl ReplicaStore {
    /// Creates an empty store that accepts every prepare.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_policy(name, AlwaysAccept)
    }

    pub fn with_policy(name: impl Into<String>, policy: impl VotePolicy + 'static) -> Self {
        Self {
            name: name.into(),
            data: RwLock::new(BTreeMap::new()),
            slot: Mutex::new(None),
            policy: Box::new(policy),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writes a value directly, outside the transaction protocol.
    pub fn put(&self, key: String, value: String) {
        let _slot = self.lock_slot();
        debug!(replica = %self.name, %key, "direct put");
        self.write_data().insert(key, value);
    }

    /// Removes a key directly. Returns whether the key existed.
    pub fn delete(&self, key: &str) -> bool {
        let _slot = self.lock_slot();
        let existed = self.write_data().remove(key).is_some();
        debug!(replica = %self.name, %key, existed, "direct delete");
        existed
    }

    /// Reads a committed value. Staged proposals are never visible here.
    pub fn get(&self, key: &str) -> Option<String> {
        self.read_data().get(key).cloned()
    }

    /// Phase 1: stage the proposal and vote.
    ///
    /// A stale staged proposal left behind by an earlier, never-finished
    /// transaction is replaced. A PUT without a value is always voted down.
    pub fn prepare(&self, proposal: Proposal) -> bool {
        let mut slot = self.lock_slot();
        if !proposal.is_well_formed() {
            warn!(replica = %self.name, %proposal, "prepare rejected: PUT without a value");
            return false;
        }
        if !self.policy.accepts(&proposal) {
            debug!(replica = %self.name, %proposal, "prepare rejected");
            return false;
        }
        if let Some(stale) = slot.as_ref() {
            debug!(replica = %self.name, %stale, "replacing staged proposal");
        }
        debug!(replica = %self.name, %proposal, "prepared");
        *slot = Some(proposal);
        true
    }

    /// Phase 2 (commit): apply the given operation and clear the slot.
    ///
    /// Applies exactly what it is told, whether or not it matches what was
    /// staged. A mismatch is logged but not refused.
    pub fn commit(&self, proposal: Proposal) {
        let mut slot = self.lock_slot();
        match slot.take() {
            Some(staged) if staged != proposal => {
                warn!(
                    replica = %self.name,
                    %staged,
                    %proposal,
                    "commit differs from staged proposal"
                );
            }
            None => {
                debug!(replica = %self.name, %proposal, "commit without a staged proposal");
            }
            Some(_) => {}
        }

        let Proposal {
            operation,
            key,
            value,
        } = proposal;
        let mut data = self.write_data();
        match (operation, value) {
            (Operation::Put, Some(value)) => {
                data.insert(key, value);
            }
            (Operation::Put, None) => {
                warn!(replica = %self.name, %key, "ignoring PUT commit without a value");
            }
            (Operation::Delete, _) => {
                data.remove(&key);
            }
        }
        debug!(replica = %self.name, "committed");
    }

    /// Phase 2 (abort): drop the staged proposal. Committed data is untouched.
    pub fn abort(&self, proposal: &Proposal) {
        let staged = self.lock_slot().take();
        debug!(replica = %self.name, %proposal, had_staged = staged.is_some(), "aborted");
    }

    /// The proposal currently between prepare and commit/abort, if any.
    pub fn staged(&self) -> Option<Proposal> {
        self.lock_slot().clone()
    }

    /// Copy of the committed map.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.read_data().clone()
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<Proposal>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_data(&self) -> RwLockReadGuard<'_, BTreeMap<String, String>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_data(&self) -> RwLockWriteGuard<'_, BTreeMap<String, String>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}
