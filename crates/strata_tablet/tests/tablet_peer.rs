//! End-to-end pipeline tests for a single-node tablet peer: writes through
//! consensus into the tablet, per-row error semantics, schema changes racing
//! writers, and restart via bootstrap.

use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use strata_consensus::consensus::Consensus;
use strata_consensus::metadata::{ConsensusMetadata, MINIMUM_TERM};
use strata_consensus::quorum::Quorum;
use strata_consensus::transport::{NoRemotePeers, Transport};
use strata_tablet::bootstrap::bootstrap_tablet;
use strata_tablet::metadata::{TabletBootstrapState, TabletMasterBlock, TabletMetadata};
use strata_tablet::schema::{DataType, Row, Schema, SchemaBuilder, Value};
use strata_tablet::transactions::alter_schema::AlterSchemaTransactionState;
use strata_tablet::transactions::write::WriteTransactionState;
use strata_tablet::wire::{
    AlterSchemaRequest, AlterSchemaResponse, RowOpType, RowOperation, WriteRequest, WriteResponse,
};
use strata_tablet::{ScanSpec, TabletPeer};
use strata_util::clock::HybridClock;
use strata_util::threadpool::ThreadPoolBuilder;
use strata_util::ErrorCode;

use strata_consensus::anchor::LogAnchorRegistry;

const TABLET_ID: &str = "00001111222233334444555566667777";
const PEER_UUID: &str = "peer-under-test";

fn catalog_schema() -> Schema {
    let mut builder = SchemaBuilder::new();
    builder.add_key_column("kind", DataType::UInt8).unwrap();
    builder.add_key_column("id", DataType::String).unwrap();
    builder.add_column("payload", DataType::Bytes).unwrap();
    builder.build().unwrap()
}

fn master_block() -> TabletMasterBlock {
    TabletMasterBlock {
        tablet_id: TABLET_ID.to_string(),
        block_a: "0".repeat(32),
        block_b: "1".repeat(32),
    }
}

struct LocalPeer {
    peer: Arc<TabletPeer>,
}

/// Build (or rebuild) a single-node peer over `root`.
fn start_peer(root: &Path, fresh: bool) -> LocalPeer {
    let mut metadata = if fresh {
        TabletMetadata::create_new(
            root,
            master_block(),
            "test-table",
            catalog_schema(),
            Vec::new(),
            Vec::new(),
            TabletBootstrapState::RemoteBootstrapDone,
        )
        .unwrap()
    } else {
        TabletMetadata::load(root, master_block()).unwrap()
    };

    let cmeta = if fresh {
        ConsensusMetadata::create(
            root,
            TABLET_ID,
            Quorum::local_quorum(0, PEER_UUID),
            MINIMUM_TERM,
        )
        .unwrap()
    } else {
        ConsensusMetadata::load(root, TABLET_ID).unwrap()
    };

    let clock = Arc::new(HybridClock::new());
    let registry = Arc::new(LogAnchorRegistry::new());
    let boot = bootstrap_tablet(&mut metadata, &clock, registry).unwrap();

    let consensus = Consensus::new(
        cmeta,
        Arc::clone(&boot.log),
        Arc::new(NoRemotePeers) as Arc<dyn Transport>,
        PEER_UUID,
    );

    let leader_pool = Arc::new(
        ThreadPoolBuilder::new("ldr-apply")
            .max_threads(4)
            .build()
            .unwrap(),
    );
    let replica_pool = Arc::new(
        ThreadPoolBuilder::new("repl-apply")
            .max_threads(1)
            .build()
            .unwrap(),
    );

    let peer = TabletPeer::new(metadata, leader_pool, replica_pool);
    peer.init(boot.tablet, clock, boot.log, consensus).unwrap();
    peer.start(&boot.info, boot.orphan_anchor).unwrap();
    peer.wait_until_consensus_running(Duration::from_secs(10))
        .unwrap();
    LocalPeer { peer }
}

fn insert_op(id: &str, payload: &[u8]) -> RowOperation {
    RowOperation {
        op_type: RowOpType::Insert,
        row: Row::new(vec![
            Value::UInt8(1),
            Value::String(id.to_string()),
            Value::Bytes(payload.to_vec()),
        ]),
    }
}

fn update_op(id: &str, payload: &[u8]) -> RowOperation {
    RowOperation {
        op_type: RowOpType::Update,
        row: Row::new(vec![
            Value::UInt8(1),
            Value::String(id.to_string()),
            Value::Bytes(payload.to_vec()),
        ]),
    }
}

fn sync_write(peer: &Arc<TabletPeer>, request: WriteRequest) -> WriteResponse {
    let (tx, rx) = mpsc::channel();
    let state = WriteTransactionState::new(
        request,
        None,
        Some(Box::new(move |resp| {
            let _ = tx.send(resp);
        })),
    );
    peer.submit_write(state).unwrap();
    rx.recv().unwrap()
}

fn sync_alter(peer: &Arc<TabletPeer>, request: AlterSchemaRequest) -> AlterSchemaResponse {
    let (tx, rx) = mpsc::channel();
    let state = AlterSchemaTransactionState::new(
        request,
        None,
        Some(Box::new(move |resp| {
            let _ = tx.send(resp);
        })),
    );
    peer.submit_alter_schema(state).unwrap();
    rx.recv().unwrap()
}

fn write_request(ops: Vec<RowOperation>) -> WriteRequest {
    WriteRequest {
        tablet_id: TABLET_ID.to_string(),
        schema: catalog_schema(),
        row_operations: ops,
    }
}

#[test]
fn committed_write_is_visible() {
    let dir = tempfile::tempdir().unwrap();
    let local = start_peer(dir.path(), true);

    let resp = sync_write(
        &local.peer,
        write_request(vec![insert_op("t1", b"alpha"), insert_op("t2", b"beta")]),
    );
    assert!(resp.error.is_none(), "unexpected error: {:?}", resp.error);
    assert!(resp.per_row_errors.is_empty());

    let tablet = local.peer.tablet().unwrap();
    assert_eq!(tablet.row_count(), 2);
    local.peer.shutdown();
}

#[test]
fn per_row_errors_do_not_abort_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let local = start_peer(dir.path(), true);

    sync_write(&local.peer, write_request(vec![insert_op("t1", b"v")]));

    // Batch: duplicate insert + update of a missing row + one good insert.
    let resp = sync_write(
        &local.peer,
        write_request(vec![
            insert_op("t1", b"dup"),
            update_op("missing", b"x"),
            insert_op("t2", b"good"),
        ]),
    );
    assert!(resp.error.is_none());
    assert_eq!(resp.per_row_errors.len(), 2);
    assert_eq!(resp.per_row_errors[0].row_index, 0);
    assert_eq!(resp.per_row_errors[0].code, ErrorCode::AlreadyPresent);
    assert_eq!(resp.per_row_errors[1].row_index, 1);
    assert_eq!(resp.per_row_errors[1].code, ErrorCode::NotFound);

    let tablet = local.peer.tablet().unwrap();
    assert_eq!(tablet.row_count(), 2);
    local.peer.shutdown();
}

#[test]
fn prepare_failure_reaches_the_caller_without_consensus() {
    let dir = tempfile::tempdir().unwrap();
    let local = start_peer(dir.path(), true);

    // Row shaped for the wrong schema: prepare rejects the whole request.
    let bad = WriteRequest {
        tablet_id: TABLET_ID.to_string(),
        schema: catalog_schema(),
        row_operations: vec![RowOperation {
            op_type: RowOpType::Insert,
            row: Row::new(vec![Value::UInt8(1)]),
        }],
    };
    let resp = sync_write(&local.peer, bad);
    let (code, _) = resp.error.expect("prepare error expected");
    assert_eq!(code, ErrorCode::InvalidArgument);

    let tablet = local.peer.tablet().unwrap();
    assert_eq!(tablet.row_count(), 0);
    // Nothing was replicated for the rejected write.
    assert!(local.peer.log().unwrap().last_appended().is_none());
    local.peer.shutdown();
}

#[test]
fn mismatched_tablet_id_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let local = start_peer(dir.path(), true);

    let mut request = write_request(vec![insert_op("t1", b"v")]);
    request.tablet_id = "someone-elses-tablet".to_string();
    let resp = sync_write(&local.peer, request);
    let (code, _) = resp.error.expect("error expected");
    assert_eq!(code, ErrorCode::InvalidArgument);
    local.peer.shutdown();
}

#[test]
fn writes_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let local = start_peer(dir.path(), true);
        let resp = sync_write(
            &local.peer,
            write_request(vec![insert_op("t1", b"persisted")]),
        );
        assert!(resp.error.is_none());
        local.peer.shutdown();
    }

    let local = start_peer(dir.path(), false);
    let tablet = local.peer.tablet().unwrap();
    assert_eq!(tablet.row_count(), 1);

    // A second no-op restart leaves the state unchanged.
    local.peer.shutdown();
    let local = start_peer(dir.path(), false);
    assert_eq!(local.peer.tablet().unwrap().row_count(), 1);
    local.peer.shutdown();
}

#[test]
fn alter_schema_rejects_incompatible_changes() {
    let dir = tempfile::tempdir().unwrap();
    let local = start_peer(dir.path(), true);

    // Defaultless new column is not a superset-compatible change.
    let mut builder = SchemaBuilder::from_schema(&catalog_schema());
    builder.add_column("extra", DataType::String).unwrap();
    let resp = sync_alter(
        &local.peer,
        AlterSchemaRequest {
            tablet_id: TABLET_ID.to_string(),
            new_schema: builder.build().unwrap(),
            schema_version: 1,
        },
    );
    let (code, _) = resp.error.expect("invalid schema expected");
    assert_eq!(code, ErrorCode::InvalidSchema);
    assert_eq!(local.peer.tablet().unwrap().schema_version(), 0);
    local.peer.shutdown();
}

#[test]
fn concurrent_writes_and_alter_never_straddle_schemas() {
    let dir = tempfile::tempdir().unwrap();
    let local = start_peer(dir.path(), true);

    const WRITERS: usize = 4;
    const PER_WRITER: usize = 25;

    let mut handles = Vec::new();
    for w in 0..WRITERS {
        let peer = Arc::clone(&local.peer);
        handles.push(std::thread::spawn(move || {
            for i in 0..PER_WRITER {
                let resp = sync_write(
                    &peer,
                    write_request(vec![insert_op(&format!("w{w}-row{i:03}"), b"v")]),
                );
                assert!(resp.error.is_none(), "write failed: {:?}", resp.error);
                assert!(resp.per_row_errors.is_empty());
            }
        }));
    }

    // Inject the alter mid-flight.
    std::thread::sleep(Duration::from_millis(5));
    let mut builder = SchemaBuilder::from_schema(&catalog_schema());
    builder
        .add_column_with_default("flags", DataType::UInt8, Value::UInt8(9))
        .unwrap();
    let new_schema = builder.build().unwrap();
    let alter_resp = sync_alter(
        &local.peer,
        AlterSchemaRequest {
            tablet_id: TABLET_ID.to_string(),
            new_schema,
            schema_version: 1,
        },
    );
    assert!(alter_resp.error.is_none(), "alter failed: {:?}", alter_resp.error);

    for handle in handles {
        handle.join().unwrap();
    }

    let tablet = local.peer.tablet().unwrap();
    assert_eq!(tablet.schema_version(), 1);
    assert_eq!(tablet.row_count(), WRITERS * PER_WRITER);

    // Every row landed entirely under the old schema (3 columns) or
    // entirely under the new one (4 columns, defaulted flags).
    let mut iter = tablet.new_row_iterator(&ScanSpec::default()).unwrap();
    while iter.has_next() {
        for row in iter.next_block() {
            match row.values.len() {
                3 => {}
                4 => assert_eq!(row.values[3], Value::UInt8(9)),
                n => panic!("row straddles schemas with {n} values"),
            }
        }
    }
    local.peer.shutdown();
}

#[test]
fn orphaned_replicate_is_redriven_on_restart() {
    use strata_consensus::log::Log;
    use strata_consensus::ops::{OpId, OperationType, ReplicateMsg};
    use strata_util::clock::Timestamp;

    let dir = tempfile::tempdir().unwrap();
    {
        let local = start_peer(dir.path(), true);
        let resp = sync_write(&local.peer, write_request(vec![insert_op("t1", b"v")]));
        assert!(resp.error.is_none());
        local.peer.shutdown();
    }

    // Simulate a crash after a replicate was logged but before its commit.
    {
        let registry = Arc::new(LogAnchorRegistry::new());
        let log = Log::open(dir.path(), TABLET_ID, registry, None).unwrap();
        let request = write_request(vec![insert_op("orphan", b"o")]);
        log.append_replicate(ReplicateMsg {
            id: OpId::new(0, 2),
            op_type: OperationType::Write,
            timestamp: Timestamp(1),
            payload: request.to_payload().unwrap(),
        })
        .unwrap();
    }

    // Restart settles the orphan through the normal pipeline.
    let local = start_peer(dir.path(), false);
    assert_eq!(local.peer.tablet().unwrap().row_count(), 2);
    local.peer.shutdown();

    // After settling, nothing is orphaned anymore; a further restart is a
    // no-op.
    let local = start_peer(dir.path(), false);
    assert_eq!(local.peer.tablet().unwrap().row_count(), 2);
    local.peer.shutdown();
}

#[test]
fn submissions_after_shutdown_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let local = start_peer(dir.path(), true);
    local.peer.shutdown();

    let state = WriteTransactionState::new(write_request(vec![insert_op("t", b"v")]), None, None);
    let err = local.peer.submit_write(state).unwrap_err();
    assert!(err.is_service_unavailable(), "unexpected error: {err}");
}
