//! Alter-schema transactions.
//!
//! Same pipeline as a write, plus the exclusive schema lock: writers hold it
//! shared during their apply, so the alter's apply waits for in-flight
//! writes to drain and then swaps the schema alone.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::ArcRwLockWriteGuard;

use strata_consensus::{CommitMsg, OpId, OperationType, ReplicateMsg};
use strata_util::clock::Timestamp;
use strata_util::{Error, ErrorCode, Result};

use crate::peer::TabletPeer;
use crate::transactions::Transaction;
use crate::wire::{AlterSchemaRequest, AlterSchemaResponse};

pub type AlterSchemaCompletionCallback = Box<dyn FnOnce(AlterSchemaResponse) + Send>;

pub struct AlterSchemaTransactionState {
    request: AlterSchemaRequest,
    response: AlterSchemaResponse,
    timestamp: Option<Timestamp>,
    op_id: Option<OpId>,
    deadline: Option<Instant>,
    completion: Option<AlterSchemaCompletionCallback>,
    schema_guard: Option<ArcRwLockWriteGuard<parking_lot::RawRwLock, ()>>,
}

impl AlterSchemaTransactionState {
    pub fn new(
        request: AlterSchemaRequest,
        deadline: Option<Instant>,
        completion: Option<AlterSchemaCompletionCallback>,
    ) -> Self {
        Self {
            request,
            response: AlterSchemaResponse::default(),
            timestamp: None,
            op_id: None,
            deadline,
            completion,
            schema_guard: None,
        }
    }

    pub fn from_replicate(msg: &ReplicateMsg) -> Result<Self> {
        let request = AlterSchemaRequest::from_payload(&msg.payload)?;
        let mut state = Self::new(request, None, None);
        state.timestamp = Some(msg.timestamp);
        state.op_id = Some(msg.id);
        Ok(state)
    }

    fn complete(&mut self) {
        if let Some(completion) = self.completion.take() {
            completion(std::mem::take(&mut self.response));
        }
    }
}

impl Drop for AlterSchemaTransactionState {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            let mut response = std::mem::take(&mut self.response);
            response.error = Some((
                ErrorCode::Aborted,
                "transaction dropped before completion".to_string(),
            ));
            completion(response);
        }
    }
}

pub struct AlterSchemaTransaction {
    state: AlterSchemaTransactionState,
}

impl AlterSchemaTransaction {
    pub fn new(state: AlterSchemaTransactionState) -> Self {
        Self { state }
    }
}

impl Transaction for AlterSchemaTransaction {
    fn op_kind(&self) -> OperationType {
        OperationType::AlterSchema
    }

    fn prepare(&mut self, peer: &Arc<TabletPeer>) -> Result<()> {
        let tablet = peer.tablet()?;
        if self.state.request.tablet_id != tablet.tablet_id() {
            return Err(Error::InvalidArgument(format!(
                "alter addressed to tablet {}, this peer hosts {}",
                self.state.request.tablet_id,
                tablet.tablet_id()
            )));
        }
        tablet.create_prepared_alter_schema(
            &self.state.request.new_schema,
            self.state.request.schema_version,
        )
    }

    fn start(&mut self, peer: &Arc<TabletPeer>) -> Result<()> {
        if self.state.timestamp.is_none() {
            self.state.timestamp = Some(peer.clock()?.now());
        }
        Ok(())
    }

    fn timestamp(&self) -> Timestamp {
        self.state.timestamp.unwrap_or_default()
    }

    fn deadline(&self) -> Option<Instant> {
        self.state.deadline
    }

    fn payload(&self) -> Result<Vec<u8>> {
        self.state.request.to_payload()
    }

    fn set_op_id(&mut self, id: OpId) {
        self.state.op_id = Some(id);
    }

    fn op_id(&self) -> Option<OpId> {
        self.state.op_id
    }

    fn apply(&mut self, peer: &Arc<TabletPeer>) -> Result<CommitMsg> {
        let tablet = peer.tablet()?;
        // Exclusive: blocks until every in-flight write apply drains.
        self.state.schema_guard = Some(tablet.schema_lock().write_arc());

        tablet.alter_schema(
            self.state.request.new_schema.clone(),
            self.state.request.schema_version,
        )?;
        peer.update_persistent_schema(
            self.state.request.new_schema.clone(),
            self.state.request.schema_version,
        )?;

        let op_id = self.state.op_id.ok_or_else(|| {
            Error::IllegalState("alter applied before replication assigned an op id".to_string())
        })?;
        Ok(CommitMsg {
            committed_op_id: op_id,
            op_type: OperationType::AlterSchema,
            timestamp: self.timestamp(),
            result: Vec::new(),
            error: None,
        })
    }

    fn abort_commit_msg(&self, err: &Error) -> CommitMsg {
        CommitMsg {
            committed_op_id: self.state.op_id.unwrap_or_default(),
            op_type: OperationType::OpAbort,
            timestamp: self.timestamp(),
            result: Vec::new(),
            error: Some((err.code(), err.to_string())),
        }
    }

    fn finish(&mut self, _peer: &Arc<TabletPeer>) {
        self.state.schema_guard = None;
        self.state.complete();
    }

    fn fail(&mut self, err: Error) {
        self.state.schema_guard = None;
        self.state.response.set_error(&err);
        self.state.complete();
    }
}
