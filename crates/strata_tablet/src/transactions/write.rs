//! Write transactions: batched row operations against one tablet.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::ArcRwLockReadGuard;

use strata_consensus::{CommitMsg, OpId, OperationType, ReplicateMsg};
use strata_util::clock::Timestamp;
use strata_util::{Error, ErrorCode, Result};

use crate::lock_manager::{LockManager, RowLocks};
use crate::peer::TabletPeer;
use crate::schema::{Row, Schema};
use crate::tablet::{StagedMutation, Tablet};
use crate::transactions::Transaction;
use crate::wire::{PerRowError, RowOpType, WriteRequest, WriteResponse};

pub type WriteCompletionCallback = Box<dyn FnOnce(WriteResponse) + Send>;

/// A row operation after key encoding.
pub(crate) struct DecodedRowOp {
    pub op_type: RowOpType,
    pub key: Vec<u8>,
    pub row: Row,
}

/// Decode a batch against the writer's schema, producing encoded keys.
pub(crate) fn decode_row_operations(
    schema: &Schema,
    operations: &[crate::wire::RowOperation],
) -> Result<Vec<DecodedRowOp>> {
    let mut decoded = Vec::with_capacity(operations.len());
    for op in operations {
        schema.validate_row(&op.row)?;
        let key = schema.encode_row_key(&op.row)?;
        decoded.push(DecodedRowOp {
            op_type: op.op_type,
            key,
            row: op.row.clone(),
        });
    }
    Ok(decoded)
}

/// Validate and stage a decoded batch against the tablet's current schema.
///
/// Per-row failures do not abort the batch; they come back alongside the
/// mutations that did stage. Rows are judged against committed state plus
/// the earlier rows of the same batch.
pub(crate) fn stage_row_operations(
    tablet: &Tablet,
    write_schema: &Schema,
    decoded: &[DecodedRowOp],
) -> (Vec<StagedMutation>, Vec<PerRowError>) {
    let tablet_schema = tablet.schema();
    let mut staged = Vec::with_capacity(decoded.len());
    let mut per_row_errors = Vec::new();
    // Presence as of this batch: committed state overlaid with earlier ops.
    let mut batch_present: std::collections::HashMap<&[u8], bool> = std::collections::HashMap::new();

    for (row_index, op) in decoded.iter().enumerate() {
        let present = batch_present
            .get(op.key.as_slice())
            .copied()
            .unwrap_or_else(|| tablet.contains_key(&op.key));

        let outcome: Result<StagedMutation> = (|| {
            match op.op_type {
                RowOpType::Insert => {
                    if present {
                        return Err(Error::AlreadyPresent(
                            "key already exists".to_string(),
                        ));
                    }
                    let row = tablet_schema.project_row(write_schema, &op.row)?;
                    Ok(StagedMutation::Insert {
                        key: op.key.clone(),
                        row,
                    })
                }
                RowOpType::Update => {
                    if !present {
                        return Err(Error::NotFound("key does not exist".to_string()));
                    }
                    let row = tablet_schema.project_row(write_schema, &op.row)?;
                    Ok(StagedMutation::Update {
                        key: op.key.clone(),
                        row,
                    })
                }
                RowOpType::Delete => {
                    if !present {
                        return Err(Error::NotFound("key does not exist".to_string()));
                    }
                    Ok(StagedMutation::Delete {
                        key: op.key.clone(),
                    })
                }
            }
        })();

        match outcome {
            Ok(mutation) => {
                batch_present.insert(op.key.as_slice(), !matches!(op.op_type, RowOpType::Delete));
                staged.push(mutation);
            }
            Err(err) => per_row_errors.push(PerRowError {
                row_index,
                code: err.code(),
                message: err.to_string(),
            }),
        }
    }
    (staged, per_row_errors)
}

pub struct WriteTransactionState {
    request: WriteRequest,
    response: WriteResponse,
    timestamp: Option<Timestamp>,
    op_id: Option<OpId>,
    deadline: Option<Instant>,
    completion: Option<WriteCompletionCallback>,
    decoded: Vec<DecodedRowOp>,
    row_locks: Option<RowLocks>,
    component_guard: Option<ArcRwLockReadGuard<parking_lot::RawRwLock, ()>>,
    schema_guard: Option<ArcRwLockReadGuard<parking_lot::RawRwLock, ()>>,
    staged: Vec<StagedMutation>,
}

impl WriteTransactionState {
    pub fn new(
        request: WriteRequest,
        deadline: Option<Instant>,
        completion: Option<WriteCompletionCallback>,
    ) -> Self {
        Self {
            request,
            response: WriteResponse::default(),
            timestamp: None,
            op_id: None,
            deadline,
            completion,
            decoded: Vec::new(),
            row_locks: None,
            component_guard: None,
            schema_guard: None,
            staged: Vec::new(),
        }
    }

    /// Replica-side state: the request, timestamp, and op id all come from
    /// the accepted replicate.
    pub fn from_replicate(msg: &ReplicateMsg) -> Result<Self> {
        let request = WriteRequest::from_payload(&msg.payload)?;
        let mut state = Self::new(request, None, None);
        state.timestamp = Some(msg.timestamp);
        state.op_id = Some(msg.id);
        Ok(state)
    }

    fn release_locks(&mut self) {
        self.schema_guard = None;
        self.component_guard = None;
        self.row_locks = None;
    }

    fn complete(&mut self) {
        if let Some(completion) = self.completion.take() {
            completion(std::mem::take(&mut self.response));
        }
    }
}

impl Drop for WriteTransactionState {
    fn drop(&mut self) {
        // A task dropped from a shutting-down pool must still release its
        // waiter.
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

pub struct WriteTransaction {
    state: WriteTransactionState,
}

impl WriteTransaction {
    pub fn new(state: WriteTransactionState) -> Self {
        Self { state }
    }
}

impl Transaction for WriteTransaction {
    fn op_kind(&self) -> OperationType {
        OperationType::Write
    }

    fn prepare(&mut self, peer: &Arc<TabletPeer>) -> Result<()> {
        let tablet = peer.tablet()?;
        if self.state.request.tablet_id != tablet.tablet_id() {
            return Err(Error::InvalidArgument(format!(
                "write addressed to tablet {}, this peer hosts {}",
                self.state.request.tablet_id,
                tablet.tablet_id()
            )));
        }

        self.state.component_guard = Some(tablet.component_lock().read_arc());

        // The writer may be on an older schema, but keys never change shape.
        let tablet_schema = tablet.schema();
        if self.state.request.schema.key_columns() != tablet_schema.key_columns() {
            return Err(Error::InvalidSchema(
                "write schema key columns do not match the tablet".to_string(),
            ));
        }

        self.state.decoded =
            decode_row_operations(&self.state.request.schema, &self.state.request.row_operations)?;
        let keys: Vec<Vec<u8>> = self.state.decoded.iter().map(|op| op.key.clone()).collect();
        self.state.row_locks = Some(LockManager::acquire(tablet.lock_manager(), keys));
        Ok(())
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
        self.state.schema_guard = Some(tablet.schema_lock().read_arc());

        let (staged, per_row_errors) = stage_row_operations(
            &tablet,
            &self.state.request.schema,
            &self.state.decoded,
        );
        self.state.staged = staged;
        self.state.response.per_row_errors = per_row_errors.clone();

        let op_id = self.state.op_id.ok_or_else(|| {
            Error::IllegalState("write applied before replication assigned an op id".to_string())
        })?;
        Ok(CommitMsg {
            committed_op_id: op_id,
            op_type: OperationType::Write,
            timestamp: self.timestamp(),
            result: serde_json::to_vec(&per_row_errors).map_err(Error::from)?,
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

    fn finish(&mut self, peer: &Arc<TabletPeer>) {
        if let Ok(tablet) = peer.tablet() {
            tablet.apply_staged(&self.state.staged);
        }
        self.state.release_locks();
        self.state.complete();
    }

    fn fail(&mut self, err: Error) {
        self.state.release_locks();
        self.state.response.set_error(&err);
        self.state.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, SchemaBuilder, Value};
    use crate::wire::RowOperation;

    fn test_schema() -> Schema {
        let mut builder = SchemaBuilder::new();
        builder.add_key_column("kind", DataType::UInt8).unwrap();
        builder.add_key_column("id", DataType::String).unwrap();
        builder.add_column("payload", DataType::Bytes).unwrap();
        builder.build().unwrap()
    }

    fn op(op_type: RowOpType, id: &str, payload: &[u8]) -> RowOperation {
        RowOperation {
            op_type,
            row: Row::new(vec![
                Value::UInt8(1),
                Value::String(id.to_string()),
                Value::Bytes(payload.to_vec()),
            ]),
        }
    }

    fn stage(
        tablet: &Tablet,
        schema: &Schema,
        ops: &[RowOperation],
    ) -> (Vec<StagedMutation>, Vec<PerRowError>) {
        let decoded = decode_row_operations(schema, ops).unwrap();
        stage_row_operations(tablet, schema, &decoded)
    }

    #[test]
    fn duplicate_insert_fails_per_row_without_aborting_the_batch() {
        let schema = test_schema();
        let tablet = Tablet::new("t", schema.clone(), 0);
        let (staged, errors) = stage(&tablet, &schema, &[op(RowOpType::Insert, "a", b"x")]);
        assert!(errors.is_empty());
        tablet.apply_staged(&staged);

        let (staged, errors) = stage(
            &tablet,
            &schema,
            &[
                op(RowOpType::Insert, "a", b"dup"),
                op(RowOpType::Insert, "b", b"fresh"),
            ],
        );
        assert_eq!(staged.len(), 1);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].row_index, 0);
        assert_eq!(errors[0].code, ErrorCode::AlreadyPresent);
    }

    #[test]
    fn mutations_of_missing_rows_are_not_found() {
        let schema = test_schema();
        let tablet = Tablet::new("t", schema.clone(), 0);
        let (staged, errors) = stage(
            &tablet,
            &schema,
            &[
                op(RowOpType::Update, "ghost", b"x"),
                op(RowOpType::Delete, "ghost", b""),
            ],
        );
        assert!(staged.is_empty());
        assert_eq!(errors.len(), 2);
        assert!(errors
            .iter()
            .all(|e| e.code == ErrorCode::NotFound));
    }

    #[test]
    fn later_rows_see_earlier_rows_of_the_same_batch() {
        let schema = test_schema();
        let tablet = Tablet::new("t", schema.clone(), 0);

        // Insert then update of the same key both stage; a second insert of
        // it fails against the batch overlay, not just committed state.
        let (staged, errors) = stage(
            &tablet,
            &schema,
            &[
                op(RowOpType::Insert, "a", b"v1"),
                op(RowOpType::Update, "a", b"v2"),
                op(RowOpType::Insert, "a", b"v3"),
            ],
        );
        assert_eq!(staged.len(), 2);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].row_index, 2);
        assert_eq!(errors[0].code, ErrorCode::AlreadyPresent);

        tablet.apply_staged(&staged);
        let key = schema
            .encode_row_key(&op(RowOpType::Insert, "a", b"").row)
            .unwrap();
        assert_eq!(
            tablet.get_row(&key).unwrap().values[2],
            Value::Bytes(b"v2".to_vec())
        );

        // A delete earlier in the batch frees the key for a re-insert.
        let (staged, errors) = stage(
            &tablet,
            &schema,
            &[
                op(RowOpType::Delete, "a", b""),
                op(RowOpType::Insert, "a", b"v4"),
            ],
        );
        assert_eq!(staged.len(), 2);
        assert!(errors.is_empty());
    }
}
