//! The tablet peer: runtime binding of tablet + log + consensus + the two
//! apply pools; the unit of replication.

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use strata_consensus::anchor::LogAnchor;
use strata_consensus::consensus::{Consensus, ConsensusBootstrapInfo, ReplicaOpFactory};
use strata_consensus::log::Log;
use strata_consensus::ops::{CommitMsg, OperationType, ReplicateMsg};
use strata_consensus::quorum::Role;
use strata_util::clock::HybridClock;
use strata_util::latch::CountDownLatch;
use strata_util::threadpool::ThreadPool;
use strata_util::{Error, Result};

use crate::metadata::TabletMetadata;
use crate::schema::Schema;
use crate::tablet::Tablet;
use crate::transactions::alter_schema::{AlterSchemaTransaction, AlterSchemaTransactionState};
use crate::transactions::write::{WriteTransaction, WriteTransactionState};
use crate::transactions::{DriverType, TransactionDriver};

/// Notified whenever the peer's consensus configuration changes.
pub trait StateChangeListener: Send + Sync {
    fn on_state_changed(&self, peer: &TabletPeer);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerLifecycle {
    NotInitialized,
    Initialized,
    Running,
    Shutdown,
}

#[derive(Clone)]
struct PeerComponents {
    tablet: Arc<Tablet>,
    clock: Arc<HybridClock>,
    log: Arc<Log>,
    consensus: Arc<Consensus>,
}

pub struct TabletPeer {
    meta: Mutex<TabletMetadata>,
    tablet_id: String,
    leader_apply_pool: Arc<ThreadPool>,
    replica_apply_pool: Arc<ThreadPool>,
    listener: Mutex<Option<Weak<dyn StateChangeListener>>>,
    components: RwLock<Option<PeerComponents>>,
    lifecycle: Mutex<PeerLifecycle>,
    /// Back-reference used by driver construction and factory registration.
    self_ref: Weak<TabletPeer>,
}

impl TabletPeer {
    pub fn new(
        meta: TabletMetadata,
        leader_apply_pool: Arc<ThreadPool>,
        replica_apply_pool: Arc<ThreadPool>,
    ) -> Arc<Self> {
        let tablet_id = meta.tablet_id().to_string();
        Arc::new_cyclic(|weak| Self {
            meta: Mutex::new(meta),
            tablet_id,
            leader_apply_pool,
            replica_apply_pool,
            listener: Mutex::new(None),
            components: RwLock::new(None),
            lifecycle: Mutex::new(PeerLifecycle::NotInitialized),
            self_ref: weak.clone(),
        })
    }

    pub fn set_state_change_listener(&self, listener: Weak<dyn StateChangeListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    /// Bind the bootstrapped components to this peer.
    pub fn init(
        &self,
        tablet: Arc<Tablet>,
        clock: Arc<HybridClock>,
        log: Arc<Log>,
        consensus: Arc<Consensus>,
    ) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            if *lifecycle != PeerLifecycle::NotInitialized {
                return Err(Error::IllegalState(format!(
                    "tablet peer {} already initialized",
                    self.tablet_id
                )));
            }
            *lifecycle = PeerLifecycle::Initialized;
        }
        consensus
            .set_replica_op_factory(self.self_ref.clone() as Weak<dyn ReplicaOpFactory>);
        *self.components.write().unwrap() = Some(PeerComponents {
            tablet,
            clock,
            log,
            consensus,
        });
        Ok(())
    }

    /// Start consensus, settle any orphaned replicates through the normal
    /// pipeline, and only then open the peer for new submissions. Settling
    /// first keeps apply order identical on every replica: an orphan always
    /// applies before any write accepted after the restart.
    pub fn start(
        &self,
        info: &ConsensusBootstrapInfo,
        orphan_anchor: Option<LogAnchor>,
    ) -> Result<()> {
        let components = self.components()?;
        components.consensus.start(info)?;

        if !info.orphaned_replicates.is_empty() {
            let latch = Arc::new(CountDownLatch::new(info.orphaned_replicates.len()));
            for msg in &info.orphaned_replicates {
                if let Err(err) = self.redrive_orphan(&components, msg, &latch) {
                    tracing::warn!(
                        tablet_id = %self.tablet_id,
                        op_id = %msg.id,
                        error = %err,
                        "could not re-drive orphaned replicate"
                    );
                    latch.count_down();
                }
            }
            latch.wait();
            // Orphan applies ride the replica pool; drain it before
            // accepting new writes.
            self.replica_apply_pool.wait();
        }

        {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            *lifecycle = PeerLifecycle::Running;
        }

        if let Some(listener) = self.listener.lock().unwrap().as_ref().and_then(Weak::upgrade) {
            listener.on_state_changed(self);
        }

        if let Some(anchor) = orphan_anchor {
            components.log.anchor_registry().unregister(anchor)?;
        }
        Ok(())
    }

    /// Submit a leader-side write.
    pub fn submit_write(&self, state: WriteTransactionState) -> Result<()> {
        self.check_leader()?;
        let driver = TransactionDriver::new(
            self.self_arc()?,
            DriverType::Leader,
            Box::new(WriteTransaction::new(state)),
        );
        driver.execute()
    }

    /// Submit a leader-side alter-schema.
    pub fn submit_alter_schema(&self, state: AlterSchemaTransactionState) -> Result<()> {
        self.check_leader()?;
        let driver = TransactionDriver::new(
            self.self_arc()?,
            DriverType::Leader,
            Box::new(AlterSchemaTransaction::new(state)),
        );
        driver.execute()
    }

    /// Poll until the peer's consensus reports itself running.
    pub fn wait_until_consensus_running(&self, timeout: Duration) -> Result<()> {
        self.components()?.consensus.wait_until_running(timeout)
    }

    pub fn shutdown(&self) {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if *lifecycle == PeerLifecycle::Shutdown {
            return;
        }
        *lifecycle = PeerLifecycle::Shutdown;
        drop(lifecycle);
        if let Ok(components) = self.components() {
            components.consensus.shutdown();
        }
        tracing::info!(tablet_id = %self.tablet_id, "tablet peer shut down");
    }

    pub fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    pub fn tablet(&self) -> Result<Arc<Tablet>> {
        Ok(self.components()?.tablet)
    }

    pub fn log(&self) -> Result<Arc<Log>> {
        Ok(self.components()?.log)
    }

    pub fn clock(&self) -> Result<Arc<HybridClock>> {
        Ok(self.components()?.clock)
    }

    pub fn consensus(&self) -> Result<Arc<Consensus>> {
        Ok(self.components()?.consensus)
    }

    pub fn leader_apply_pool(&self) -> &Arc<ThreadPool> {
        &self.leader_apply_pool
    }

    pub fn replica_apply_pool(&self) -> &Arc<ThreadPool> {
        &self.replica_apply_pool
    }

    pub fn role(&self) -> Role {
        self.components()
            .map(|c| c.consensus.role())
            .unwrap_or(Role::NonParticipant)
    }

    /// Persist an applied schema change into the tablet superblock.
    pub fn update_persistent_schema(&self, schema: Schema, version: u32) -> Result<()> {
        let mut meta = self.meta.lock().unwrap();
        meta.set_schema(schema, version);
        meta.flush()
    }

    fn self_arc(&self) -> Result<Arc<TabletPeer>> {
        self.self_ref.upgrade().ok_or_else(|| {
            Error::IllegalState(format!(
                "tablet peer {} has been dropped",
                self.tablet_id
            ))
        })
    }

    fn components(&self) -> Result<PeerComponents> {
        self.components
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| {
                Error::IllegalState(format!(
                    "tablet peer {} is not initialized",
                    self.tablet_id
                ))
            })
    }

    fn check_leader(&self) -> Result<()> {
        let lifecycle = *self.lifecycle.lock().unwrap();
        if lifecycle != PeerLifecycle::Running {
            return Err(Error::ServiceUnavailable(format!(
                "tablet peer {} is not running ({lifecycle:?})",
                self.tablet_id
            )));
        }
        let role = self.components()?.consensus.role();
        if role != Role::Leader {
            return Err(Error::IllegalState(format!(
                "writes must be submitted to the leader, this peer is {role:?}"
            )));
        }
        Ok(())
    }

    /// Settle one replicate left without a commit by a previous run.
    ///
    /// A replica simply applies the entry it already logged, under its
    /// original op id. The leader first re-replicates the entry under its
    /// original op id (followers that missed it expect exactly that index),
    /// then applies it the same way once the quorum has it.
    fn redrive_orphan(
        &self,
        components: &PeerComponents,
        msg: &ReplicateMsg,
        latch: &Arc<CountDownLatch>,
    ) -> Result<()> {
        tracing::info!(
            tablet_id = %self.tablet_id,
            op_id = %msg.id,
            op = ?msg.op_type,
            "re-driving orphaned replicate"
        );
        if components.consensus.role() != Role::Leader {
            self.start_replica_op(msg.clone())?;
            latch.count_down();
            return Ok(());
        }

        let peer = self.self_arc()?;
        let replay = msg.clone();
        let done = Arc::clone(latch);
        components.consensus.replicate_existing(
            msg.clone(),
            Box::new(move |res| {
                match res {
                    Ok(_) => {
                        if let Err(err) = peer.start_replica_op(replay.clone()) {
                            tracing::error!(
                                tablet_id = %peer.tablet_id,
                                op_id = %replay.id,
                                error = %err,
                                "could not apply re-driven replicate"
                            );
                        }
                    }
                    Err(err) => {
                        // Still orphaned; the next bootstrap retries it.
                        tracing::warn!(
                            op_id = %replay.id,
                            error = %err,
                            "orphaned replicate not re-replicated"
                        );
                    }
                }
                done.count_down();
            }),
        )
    }
}

impl ReplicaOpFactory for TabletPeer {
    fn start_replica_op(&self, msg: ReplicateMsg) -> Result<()> {
        let components = self.components()?;
        components.clock.update(msg.timestamp);

        match msg.op_type {
            OperationType::Write => {
                let state = WriteTransactionState::from_replicate(&msg)?;
                let driver = TransactionDriver::new(
                    self.self_arc()?,
                    DriverType::Replica,
                    Box::new(WriteTransaction::new(state)),
                );
                driver.execute()
            }
            OperationType::AlterSchema => {
                let state = AlterSchemaTransactionState::from_replicate(&msg)?;
                let driver = TransactionDriver::new(
                    self.self_arc()?,
                    DriverType::Replica,
                    Box::new(AlterSchemaTransaction::new(state)),
                );
                driver.execute()
            }
            OperationType::NoOp => components.log.append_commit(CommitMsg {
                committed_op_id: msg.id,
                op_type: OperationType::NoOp,
                timestamp: msg.timestamp,
                result: Vec::new(),
                error: None,
            }),
            OperationType::OpAbort => Err(Error::Corruption(
                "replicate entry carries an abort op type".to_string(),
            )),
        }
    }
}
