//! The write-transaction pipeline.
//!
//! A driver walks one transaction through Prepare → Replicate → Apply →
//! Commit. Leader-side drivers run Prepare on the leader apply pool and hand
//! the operation to consensus; replica-side drivers receive the already
//! accepted replicate and only run Apply → Commit on the replica pool.
//!
//! Apply failures after replication are not rolled back silently: the driver
//! appends an abort commit so every replica settles the operation the same
//! way, and the caller sees the error in the response.

pub mod alter_schema;
pub mod write;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use strata_consensus::{CommitMsg, OpId, OperationType};
use strata_util::clock::Timestamp;
use strata_util::{Error, Result};

use crate::peer::TabletPeer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverType {
    Leader,
    Replica,
}

/// Driver-visible lifecycle of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnLifecycle {
    New,
    Prepared,
    Replicating,
    Replicated,
    Applied,
    Committed,
    Aborted,
}

/// One replicated operation, as seen by the driver.
///
/// Implementations hold their own state (request, response, locks, staged
/// mutations) and release everything they acquired in `finish` or `fail`.
pub trait Transaction: Send + 'static {
    fn op_kind(&self) -> OperationType;

    /// Validate the request and acquire locks. Leader-side errors here are
    /// reported to the caller without contacting consensus.
    fn prepare(&mut self, peer: &Arc<TabletPeer>) -> Result<()>;

    /// Assign the transaction timestamp (no-op when it arrived with the
    /// replicate).
    fn start(&mut self, peer: &Arc<TabletPeer>) -> Result<()>;

    fn timestamp(&self) -> Timestamp;

    fn deadline(&self) -> Option<Instant>;

    /// Serialized request carried in the replicate message.
    fn payload(&self) -> Result<Vec<u8>>;

    fn set_op_id(&mut self, id: OpId);

    fn op_id(&self) -> Option<OpId>;

    /// Mutate tablet state (staged) and produce the commit record.
    fn apply(&mut self, peer: &Arc<TabletPeer>) -> Result<CommitMsg>;

    /// Commit record used when apply fails after replication.
    fn abort_commit_msg(&self, err: &Error) -> CommitMsg;

    /// Make staged changes reader-visible, drop locks, fire the completion
    /// callback with a successful response.
    fn finish(&mut self, peer: &Arc<TabletPeer>);

    /// Drop locks and fire the completion callback with `err`.
    fn fail(&mut self, err: Error);
}

pub struct TransactionDriver {
    peer: Arc<TabletPeer>,
    driver_type: DriverType,
    txn: Mutex<Box<dyn Transaction>>,
    lifecycle: Mutex<TxnLifecycle>,
    self_ref: std::sync::Weak<TransactionDriver>,
}

impl TransactionDriver {
    pub fn new(
        peer: Arc<TabletPeer>,
        driver_type: DriverType,
        txn: Box<dyn Transaction>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            peer,
            driver_type,
            txn: Mutex::new(txn),
            lifecycle: Mutex::new(TxnLifecycle::New),
            self_ref: weak.clone(),
        })
    }

    pub fn lifecycle(&self) -> TxnLifecycle {
        *self.lifecycle.lock().unwrap()
    }

    /// Kick off the pipeline; returns as soon as the first stage is queued.
    pub fn execute(&self) -> Result<()> {
        let driver = self.self_ref.upgrade().ok_or_else(|| {
            Error::IllegalState("transaction driver dropped before execute".to_string())
        })?;
        match self.driver_type {
            DriverType::Leader => self
                .peer
                .leader_apply_pool()
                .submit_func(move || driver.leader_prepare_task()),
            DriverType::Replica => self
                .peer
                .replica_apply_pool()
                .submit_func(move || driver.replica_task()),
        }
    }

    fn set_lifecycle(&self, lifecycle: TxnLifecycle) {
        *self.lifecycle.lock().unwrap() = lifecycle;
    }

    fn leader_prepare_task(self: Arc<Self>) {
        let (op_kind, timestamp, payload, deadline) = {
            let mut txn = self.txn.lock().unwrap();
            if let Err(err) = txn.prepare(&self.peer) {
                tracing::debug!(op = ?txn.op_kind(), error = %err, "prepare failed");
                self.set_lifecycle(TxnLifecycle::Aborted);
                txn.fail(err);
                return;
            }
            if let Err(err) = txn.start(&self.peer) {
                self.set_lifecycle(TxnLifecycle::Aborted);
                txn.fail(err);
                return;
            }
            let payload = match txn.payload() {
                Ok(payload) => payload,
                Err(err) => {
                    self.set_lifecycle(TxnLifecycle::Aborted);
                    txn.fail(err);
                    return;
                }
            };
            (txn.op_kind(), txn.timestamp(), payload, txn.deadline())
        };
        self.set_lifecycle(TxnLifecycle::Prepared);

        let consensus = match self.peer.consensus() {
            Ok(consensus) => consensus,
            Err(err) => {
                self.fail_txn(err);
                return;
            }
        };

        self.set_lifecycle(TxnLifecycle::Replicating);
        let driver = Arc::clone(&self);
        let submit = consensus.replicate(
            op_kind,
            timestamp,
            payload,
            deadline,
            Box::new(move |res| driver.replicate_finished(res)),
        );
        if let Err(err) = submit {
            self.fail_txn(err);
        }
    }

    fn replicate_finished(self: Arc<Self>, res: Result<OpId>) {
        let id = match res {
            Ok(id) => id,
            Err(err) => {
                if err.is_timed_out() {
                    // The operation may still commit on peers; bootstrap
                    // reconciles the raced state on restart.
                    tracing::warn!(error = %err, "write raced its deadline during replication");
                }
                self.set_lifecycle(TxnLifecycle::Aborted);
                self.fail_txn(err);
                return;
            }
        };
        self.txn.lock().unwrap().set_op_id(id);
        self.set_lifecycle(TxnLifecycle::Replicated);

        let driver = Arc::clone(&self);
        let submit = self
            .peer
            .leader_apply_pool()
            .submit_func(move || driver.apply_and_commit());
        if let Err(err) = submit {
            self.fail_txn(err);
        }
    }

    fn replica_task(self: Arc<Self>) {
        {
            let mut txn = self.txn.lock().unwrap();
            if let Err(err) = txn.prepare(&self.peer) {
                // The leader already accepted this operation; a replica that
                // cannot even prepare it settles it as an abort.
                tracing::error!(op = ?txn.op_kind(), error = %err, "replica prepare failed");
                let abort = txn.abort_commit_msg(&err);
                if let Ok(log) = self.peer.log() {
                    if let Err(log_err) = log.append_commit(abort) {
                        tracing::error!(error = %log_err, "could not append abort commit");
                    }
                }
                self.set_lifecycle(TxnLifecycle::Aborted);
                txn.fail(err);
                return;
            }
        }
        self.set_lifecycle(TxnLifecycle::Prepared);
        self.apply_and_commit();
    }

    fn apply_and_commit(&self) {
        let mut txn = self.txn.lock().unwrap();
        match txn.apply(&self.peer) {
            Ok(commit_msg) => {
                self.set_lifecycle(TxnLifecycle::Applied);
                let log = match self.peer.log() {
                    Ok(log) => log,
                    Err(err) => {
                        txn.fail(err);
                        return;
                    }
                };
                if let Err(err) = log.append_commit(commit_msg) {
                    self.set_lifecycle(TxnLifecycle::Aborted);
                    txn.fail(err);
                    return;
                }
                self.set_lifecycle(TxnLifecycle::Committed);
                txn.finish(&self.peer);
            }
            Err(err) => {
                // Replicated but not applied: append an abort commit so
                // every replica agrees on the outcome.
                let abort = txn.abort_commit_msg(&err);
                if let Ok(log) = self.peer.log() {
                    if let Err(log_err) = log.append_commit(abort) {
                        tracing::error!(error = %log_err, "could not append abort commit");
                    }
                }
                self.set_lifecycle(TxnLifecycle::Aborted);
                txn.fail(err);
            }
        }
    }

    fn fail_txn(&self, err: Error) {
        self.txn.lock().unwrap().fail(err);
    }
}
