//! The consensus engine for one replicated tablet.
//!
//! A single replication worker processes accepted operations in op-id order:
//! durable local append, then delivery to every voting peer, then the commit
//! callback. FIFO processing means callbacks fire in log-index order, which
//! is what keeps apply ordering identical on every replica.
//!
//! Roles are static until leader election lands: the committed quorum names
//! the leader, and the engine only checks membership at startup.

use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::log::Log;
use crate::metadata::ConsensusMetadata;
use crate::ops::{OpId, OperationType, ReplicateMsg};
use crate::quorum::{Quorum, Role};
use crate::transport::Transport;
use strata_util::clock::Timestamp;
use strata_util::{Error, Result};

/// Consensus state recovered by replaying the log at startup.
#[derive(Debug, Clone, Default)]
pub struct ConsensusBootstrapInfo {
    /// Op id of the last entry in the persisted log.
    pub last_id: OpId,
    /// Highest op id known to be committed.
    pub last_committed_id: OpId,
    /// Replicate entries without a matching commit; these are re-driven
    /// through the normal transaction pipeline after restart.
    pub orphaned_replicates: Vec<ReplicateMsg>,
}

/// Started by a follower's consensus for every replicate accepted from the
/// leader. The tablet peer implements this to drive replica-side apply.
pub trait ReplicaOpFactory: Send + Sync {
    fn start_replica_op(&self, msg: ReplicateMsg) -> Result<()>;
}

/// Callback invoked once an operation is durably replicated (or has failed).
pub type ReplicateCallback = Box<dyn FnOnce(Result<OpId>) + Send>;

struct ReplicateRound {
    msg: ReplicateMsg,
    deadline: Option<Instant>,
    callback: ReplicateCallback,
    /// True when the entry is already in the local log (orphan re-drive).
    already_logged: bool,
}

struct EngineState {
    running: bool,
    role: Role,
    term: u64,
    next_index: u64,
    /// Highest replicate accepted on this node, leader- or follower-side.
    last_received: OpId,
    replicate_tx: Option<mpsc::Sender<ReplicateRound>>,
}

/// Peer snapshot handed to the replication worker. Delivery is keyed by the
/// uuid resolved at quorum-construction time.
#[derive(Clone)]
struct VotingPeer {
    uuid: String,
}

pub struct Consensus {
    tablet_id: String,
    local_uuid: String,
    meta: Mutex<ConsensusMetadata>,
    log: Arc<Log>,
    transport: Arc<dyn Transport>,
    state: Mutex<EngineState>,
    running_cond: Condvar,
    factory: Mutex<Option<Weak<dyn ReplicaOpFactory>>>,
    self_ref: Weak<Consensus>,
}

impl Consensus {
    pub fn new(
        meta: ConsensusMetadata,
        log: Arc<Log>,
        transport: Arc<dyn Transport>,
        local_uuid: impl Into<String>,
    ) -> Arc<Self> {
        let tablet_id = meta.tablet_id().to_string();
        let term = meta.current_term();
        let local_uuid = local_uuid.into();
        Arc::new_cyclic(|weak| Self {
            tablet_id,
            local_uuid,
            meta: Mutex::new(meta),
            log,
            transport,
            state: Mutex::new(EngineState {
                running: false,
                role: Role::NonParticipant,
                term,
                next_index: 1,
                last_received: OpId::default(),
                replicate_tx: None,
            }),
            running_cond: Condvar::new(),
            factory: Mutex::new(None),
            self_ref: weak.clone(),
        })
    }

    /// Register the factory used to drive replica-side operations. Held
    /// weakly; the tablet peer outlives the rounds it starts.
    pub fn set_replica_op_factory(&self, factory: Weak<dyn ReplicaOpFactory>) {
        *self.factory.lock().unwrap() = Some(factory);
    }

    /// Bring the engine online from bootstrap state.
    pub fn start(&self, info: &ConsensusBootstrapInfo) -> Result<()> {
        let (quorum, term) = {
            let meta = self.meta.lock().unwrap();
            (meta.committed_quorum().clone(), meta.current_term())
        };

        let local_peer = quorum.peer_by_uuid(&self.local_uuid).ok_or_else(|| {
            Error::IllegalState(format!(
                "local peer {} is not in the committed quorum",
                self.local_uuid
            ))
        })?;
        let role = match local_peer.role {
            // The leadership slot resolves to Leader once the engine runs.
            Role::Leader | Role::Candidate => Role::Leader,
            other => other,
        };

        let voters: Vec<VotingPeer> = quorum
            .peers
            .iter()
            .filter(|p| {
                !matches!(p.role, Role::Learner | Role::NonParticipant)
                    && p.permanent_uuid.as_deref() != Some(self.local_uuid.as_str())
            })
            .map(|p| VotingPeer {
                uuid: p.permanent_uuid.clone().unwrap_or_default(),
            })
            .collect();
        let majority = quorum.majority_size();

        let mut state = self.state.lock().unwrap();
        if state.running {
            return Err(Error::IllegalState(format!(
                "consensus for tablet {} already running",
                self.tablet_id
            )));
        }
        state.term = term;
        state.role = role;
        state.next_index = info.last_id.index + 1;
        state.last_received = info.last_id;

        if role == Role::Leader {
            let (tx, rx) = mpsc::channel();
            state.replicate_tx = Some(tx);
            let engine = self.self_ref.upgrade().ok_or_else(|| {
                Error::IllegalState("consensus engine dropped during start".to_string())
            })?;
            std::thread::Builder::new()
                .name("consensus-rep".to_string())
                .spawn(move || engine.replication_worker(rx, voters, majority))
                .map_err(|err| {
                    Error::ServiceUnavailable(format!(
                        "could not spawn replication worker: {err}"
                    ))
                })?;
        }

        state.running = true;
        self.running_cond.notify_all();
        tracing::info!(
            tablet_id = %self.tablet_id,
            uuid = %self.local_uuid,
            role = ?role,
            term,
            next_index = state.next_index,
            "consensus started"
        );
        Ok(())
    }

    /// Accept an operation for replication. The engine assigns the op id and
    /// invokes `callback` once a majority has durably accepted the entry.
    ///
    /// Only valid on the leader.
    pub fn replicate(
        &self,
        op_type: OperationType,
        timestamp: Timestamp,
        payload: Vec<u8>,
        deadline: Option<Instant>,
        callback: ReplicateCallback,
    ) -> Result<OpId> {
        let mut state = self.state.lock().unwrap();
        if !state.running {
            return Err(Error::ServiceUnavailable(format!(
                "consensus for tablet {} is not running",
                self.tablet_id
            )));
        }
        if state.role != Role::Leader {
            return Err(Error::IllegalState(format!(
                "replicate called on a {:?} replica",
                state.role
            )));
        }

        let id = OpId::new(state.term, state.next_index);
        state.next_index += 1;
        state.last_received = id;
        let msg = ReplicateMsg {
            id,
            op_type,
            timestamp,
            payload,
        };
        // Send while holding the lock so channel order matches index order.
        let tx = state.replicate_tx.as_ref().ok_or_else(|| {
            Error::IllegalState("replication worker not started".to_string())
        })?;
        tx.send(ReplicateRound {
            msg,
            deadline,
            callback,
            already_logged: false,
        })
        .map_err(|_| Error::IllegalState("replication worker has exited".to_string()))?;
        Ok(id)
    }

    /// Re-replicate an entry that is already in the local log under its
    /// original op id. Used to settle orphaned replicates after a restart:
    /// followers that missed the entry are still expecting exactly this
    /// index, so it must not be reassigned.
    pub fn replicate_existing(
        &self,
        msg: ReplicateMsg,
        callback: ReplicateCallback,
    ) -> Result<()> {
        let state = self.state.lock().unwrap();
        if !state.running {
            return Err(Error::ServiceUnavailable(format!(
                "consensus for tablet {} is not running",
                self.tablet_id
            )));
        }
        if state.role != Role::Leader {
            return Err(Error::IllegalState(format!(
                "replicate_existing called on a {:?} replica",
                state.role
            )));
        }
        if msg.id.index >= state.next_index {
            return Err(Error::InvalidArgument(format!(
                "entry {} is not in the local log (next index {})",
                msg.id, state.next_index
            )));
        }
        let tx = state.replicate_tx.as_ref().ok_or_else(|| {
            Error::IllegalState("replication worker not started".to_string())
        })?;
        tx.send(ReplicateRound {
            msg,
            deadline: None,
            callback,
            already_logged: true,
        })
        .map_err(|_| Error::IllegalState("replication worker has exited".to_string()))?;
        Ok(())
    }

    /// Follower-side entry point: accept a replicate from the leader,
    /// durably append it, and hand it to the replica-op factory.
    ///
    /// The engine lock is held across the append so concurrent deliveries
    /// cannot reorder the log or the replica-apply submissions.
    pub fn receive_replicate(&self, msg: ReplicateMsg) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.running {
            return Err(Error::ServiceUnavailable(format!(
                "consensus for tablet {} is not running",
                self.tablet_id
            )));
        }
        if state.role == Role::Leader {
            return Err(Error::IllegalState(
                "leader received a replicate from another node".to_string(),
            ));
        }
        if msg.id.index <= state.last_received.index {
            // Duplicate delivery; already durably accepted.
            return Ok(());
        }
        if msg.id.index != state.last_received.index + 1 {
            return Err(Error::IllegalState(format!(
                "out-of-order replicate {}: expected index {}",
                msg.id,
                state.last_received.index + 1
            )));
        }

        self.log.append_replicate(msg.clone())?;
        if msg.id.term > state.term {
            state.term = msg.id.term;
        }
        state.last_received = msg.id;

        // Still under the lock: the factory only queues the apply, and the
        // queue order must match the log order.
        let factory = self
            .factory
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade);
        match factory {
            Some(factory) => factory.start_replica_op(msg),
            None => Err(Error::IllegalState(
                "no replica op factory registered".to_string(),
            )),
        }
    }

    fn replication_worker(
        &self,
        rx: mpsc::Receiver<ReplicateRound>,
        voters: Vec<VotingPeer>,
        majority: usize,
    ) {
        while let Ok(round) = rx.recv() {
            let result = self.run_round(
                &round.msg,
                round.deadline,
                round.already_logged,
                voters.as_slice(),
                majority,
            );
            (round.callback)(result.map(|()| round.msg.id));
        }
    }

    fn run_round(
        &self,
        msg: &ReplicateMsg,
        deadline: Option<Instant>,
        already_logged: bool,
        voters: &[VotingPeer],
        majority: usize,
    ) -> Result<()> {
        if !already_logged {
            self.log.append_replicate(msg.clone())?;
        }

        // Local durable append counts toward the majority. Every voter gets
        // the entry even after the majority is reached, so no follower is
        // left to discover it only at bootstrap.
        let mut acks = 1usize;
        let mut last_error: Option<Error> = None;
        for peer in voters {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(Error::TimedOut(format!(
                        "deadline elapsed replicating {} to quorum",
                        msg.id
                    )));
                }
            }
            match self
                .transport
                .replicate(&peer.uuid, &self.tablet_id, msg)
            {
                Ok(()) => acks += 1,
                Err(err) => {
                    tracing::warn!(
                        tablet_id = %self.tablet_id,
                        peer = %peer.uuid,
                        op_id = %msg.id,
                        error = %err,
                        "replicate to peer failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        if acks >= majority {
            return Ok(());
        }
        Err(Error::ServiceUnavailable(format!(
            "replicated {} to {acks}/{majority} needed acks: {}",
            msg.id,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no reachable peers".to_string())
        )))
    }

    /// Poll until the engine reports itself running.
    pub fn wait_until_running(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while !state.running {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::TimedOut(format!(
                    "consensus for tablet {} not running after {timeout:?}",
                    self.tablet_id
                )));
            }
            let (next, _) = self
                .running_cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = next;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    pub fn role(&self) -> Role {
        self.state.lock().unwrap().role
    }

    pub fn peer_uuid(&self) -> &str {
        &self.local_uuid
    }

    pub fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    pub fn current_term(&self) -> u64 {
        self.state.lock().unwrap().term
    }

    /// Snapshot of the committed quorum.
    pub fn quorum(&self) -> Quorum {
        self.meta.lock().unwrap().committed_quorum().clone()
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.running = false;
        // Dropping the sender lets the replication worker drain and exit.
        state.replicate_tx = None;
        tracing::info!(tablet_id = %self.tablet_id, "consensus shut down");
    }
}
