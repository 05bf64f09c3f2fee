//! The sys-catalog table: the singleton replicated tablet whose rows encode
//! the cluster's tables and tablets.
//!
//! Schema: `(entry_type, entry_id) -> metadata`. The entry type leads the
//! compound key so "scan all tables" and "scan all tablets" are single-range
//! scans. The tablet id is a reserved constant so every master finds the
//! catalog deterministically.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use strata_consensus::anchor::LogAnchorRegistry;
use strata_consensus::consensus::Consensus;
use strata_consensus::metadata::{ConsensusMetadata, MINIMUM_TERM};
use strata_consensus::quorum::{verify_quorum, Quorum, QuorumPeer, Role};
use strata_consensus::transport::{resolve_peer_uuid_with_retries, Transport};
use strata_tablet::bootstrap::bootstrap_tablet;
use strata_tablet::metadata::{TabletBootstrapState, TabletMasterBlock, TabletMetadata};
use strata_tablet::peer::{StateChangeListener, TabletPeer};
use strata_tablet::tablet::{ColumnRangePredicate, ScanSpec};
use strata_tablet::transactions::write::WriteTransactionState;
use strata_tablet::wire::{RowOpType, RowOperation, WriteRequest, WriteResponse};
use strata_tablet::{DataType, Row, Schema, SchemaBuilder, Value};
use strata_util::clock::HybridClock;
use strata_util::latch::CountDownLatch;
use strata_util::threadpool::{ThreadPool, ThreadPoolBuilder};
use strata_util::{Error, Result};

use crate::entries::{
    SysTablesEntry, SysTabletsEntry, TableInfo, TableVisitor, TabletInfo, TabletVisitor,
};
use crate::options::MasterOptions;

/// Reserved id of the sys-catalog tablet, identical on every master.
pub const SYS_CATALOG_TABLET_ID: &str = "00000000000000000000000000000000";

const SYS_CATALOG_TABLE_NAME: &str = "sys.catalog";
const SYS_CATALOG_BLOCK_A: &str = "00000000000000000000000000000000";
const SYS_CATALOG_BLOCK_B: &str = "11111111111111111111111111111111";

const COL_ENTRY_TYPE: &str = "entry_type";
const COL_ENTRY_ID: &str = "entry_id";
const COL_METADATA: &str = "metadata";

/// Key prefix values partitioning the catalog keyspace.
const TABLES_ENTRY: u8 = 1;
const TABLETS_ENTRY: u8 = 2;

/// Immutable per-process wiring handed to the catalog at startup.
pub struct MasterContext {
    pub opts: MasterOptions,
    pub fs_root: PathBuf,
    /// This master's permanent uuid.
    pub uuid: String,
    pub clock: Arc<HybridClock>,
    pub transport: Arc<dyn Transport>,
}

pub struct SysCatalogTable {
    ctx: Arc<MasterContext>,
    schema: Schema,
    leader_apply_pool: Arc<ThreadPool>,
    replica_apply_pool: Arc<ThreadPool>,
    tablet_peer: RwLock<Option<Arc<TabletPeer>>>,
    self_ref: Weak<SysCatalogTable>,
}

impl SysCatalogTable {
    pub fn new(ctx: Arc<MasterContext>) -> Result<Arc<Self>> {
        let leader_apply_pool = Arc::new(ThreadPoolBuilder::new("ldr-apply").build()?);
        // Replica apply must follow log order exactly, so it gets a single
        // worker; the separate pool still keeps it out of the leader path.
        let replica_apply_pool = Arc::new(
            ThreadPoolBuilder::new("repl-apply").max_threads(1).build()?,
        );
        Ok(Arc::new_cyclic(|weak| Self {
            ctx,
            schema: build_table_schema(),
            leader_apply_pool,
            replica_apply_pool,
            tablet_peer: RwLock::new(None),
            self_ref: weak.clone(),
        }))
    }

    pub fn table_name(&self) -> &'static str {
        SYS_CATALOG_TABLE_NAME
    }

    /// Create the sys-catalog tablet on a fresh filesystem, persisting the
    /// tablet descriptor and the initial consensus record.
    pub fn create_new(&self) -> Result<()> {
        let metadata = TabletMetadata::create_new(
            &self.ctx.fs_root,
            master_block(),
            SYS_CATALOG_TABLE_NAME,
            self.schema.clone(),
            Vec::new(),
            Vec::new(),
            TabletBootstrapState::RemoteBootstrapDone,
        )?;

        let quorum = if self.ctx.opts.is_distributed() {
            tracing::info!("configuring the quorum for distributed operation");
            self.setup_distributed_quorum(0)?
        } else {
            Quorum::local_quorum(0, self.ctx.uuid.clone())
        };

        let cmeta = ConsensusMetadata::create(
            &self.ctx.fs_root,
            SYS_CATALOG_TABLET_ID,
            quorum,
            MINIMUM_TERM,
        )?;
        self.setup_tablet(metadata, cmeta)
    }

    /// Load the sys-catalog tablet on master restart, reconfiguring the
    /// quorum from the static options when running distributed.
    pub fn load(&self) -> Result<()> {
        let metadata = TabletMetadata::load(&self.ctx.fs_root, master_block())?;
        if metadata.schema() != &self.schema {
            return Err(Error::Corruption(format!(
                "sys-catalog tablet has an unexpected schema: {:?}",
                metadata.schema()
            )));
        }

        let mut cmeta = ConsensusMetadata::load(&self.ctx.fs_root, SYS_CATALOG_TABLET_ID)?;
        if self.ctx.opts.is_distributed() {
            tracing::info!("configuring the quorum for distributed operation");
            let old_seqno = cmeta.committed_quorum().seqno;
            let quorum = self.setup_distributed_quorum(old_seqno + 1)?;
            cmeta.set_committed_quorum(quorum);
            cmeta.flush()?;
        }

        self.setup_tablet(metadata, cmeta)
    }

    /// Build the quorum descriptor from static configuration, resolving
    /// missing peer identities by (blocking) RPC.
    fn setup_distributed_quorum(&self, seqno: i64) -> Result<Quorum> {
        let opts = &self.ctx.opts;
        let mut quorum = Quorum::new(seqno, false);

        for addr in &opts.follower_addresses {
            let mut peer = QuorumPeer::new(Role::Follower);
            peer.last_known_addr = Some(addr.clone());
            quorum.peers.push(peer);
        }

        // The local peer; its identity is already known.
        let mut local_peer = QuorumPeer::new(if opts.leader {
            Role::Leader
        } else {
            Role::Follower
        });
        local_peer.permanent_uuid = Some(self.ctx.uuid.clone());
        local_peer.last_known_addr = Some(opts.rpc_bind_addr.clone());
        quorum.peers.push(local_peer);

        if !opts.leader {
            let leader_addr = opts.leader_address.clone().ok_or_else(|| {
                Error::Config("follower master has no configured leader address".to_string())
            })?;
            let mut leader_peer = QuorumPeer::new(Role::Candidate);
            leader_peer.last_known_addr = Some(leader_addr);
            quorum.peers.push(leader_peer);
        }

        for peer in &mut quorum.peers {
            if peer.permanent_uuid.is_none() {
                tracing::info!(
                    peer = %peer.last_known_addr.as_ref().map(|a| a.to_string()).unwrap_or_default(),
                    "peer has no permanent uuid yet, resolving"
                );
                resolve_peer_uuid_with_retries(
                    self.ctx.transport.as_ref(),
                    peer,
                    opts.resolve_retry_interval,
                    opts.resolve_timeout,
                )?;
            }
        }

        verify_quorum(&quorum)?;
        tracing::info!(seqno, peers = quorum.peers.len(), "distributed quorum configured");
        Ok(quorum)
    }

    fn setup_tablet(
        &self,
        mut metadata: TabletMetadata,
        cmeta: ConsensusMetadata,
    ) -> Result<()> {
        let anchor_registry = Arc::new(LogAnchorRegistry::new());
        let boot = bootstrap_tablet(&mut metadata, &self.ctx.clock, anchor_registry)?;

        let consensus = Consensus::new(
            cmeta,
            Arc::clone(&boot.log),
            Arc::clone(&self.ctx.transport),
            self.ctx.uuid.clone(),
        );

        let peer = TabletPeer::new(
            metadata,
            Arc::clone(&self.leader_apply_pool),
            Arc::clone(&self.replica_apply_pool),
        );
        peer.set_state_change_listener(self.self_ref.clone() as Weak<dyn StateChangeListener>);
        peer.init(
            boot.tablet,
            Arc::clone(&self.ctx.clock),
            boot.log,
            consensus,
        )?;
        peer.start(&boot.info, boot.orphan_anchor)?;

        *self.tablet_peer.write().unwrap() = Some(peer);
        Ok(())
    }

    /// Block until the catalog tablet's consensus is up, logging progress
    /// every second.
    pub fn wait_until_running(&self) -> Result<()> {
        let peer = self.tablet_peer()?;
        let mut seconds_waited = 0u64;
        loop {
            match peer.wait_until_consensus_running(Duration::from_secs(1)) {
                Ok(()) => {
                    tracing::info!(
                        tablet_id = %peer.tablet_id(),
                        "sys-catalog configured and running, proceeding with master startup"
                    );
                    return Ok(());
                }
                Err(err) if err.is_timed_out() => {
                    seconds_waited += 1;
                    tracing::warn!(
                        tablet_id = %peer.tablet_id(),
                        seconds_waited,
                        "sys-catalog not online yet"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn shutdown(&self) {
        if let Some(peer) = self.tablet_peer.read().unwrap().as_ref() {
            peer.shutdown();
        }
        self.leader_apply_pool.shutdown();
        self.replica_apply_pool.shutdown();
    }

    pub fn tablet_peer(&self) -> Result<Arc<TabletPeer>> {
        self.tablet_peer
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::IllegalState("sys-catalog tablet not set up".to_string()))
    }

    // ==============================================================
    // Table entries
    // ==============================================================

    pub fn add_table(&self, table: &TableInfo) -> Result<()> {
        let ops = vec![self.table_op(RowOpType::Insert, table)?];
        self.sync_write(self.write_request(ops))
    }

    pub fn update_table(&self, table: &TableInfo) -> Result<()> {
        let ops = vec![self.table_op(RowOpType::Update, table)?];
        self.sync_write(self.write_request(ops))
    }

    pub fn delete_table(&self, table: &TableInfo) -> Result<()> {
        let row = self.entry_row(TABLES_ENTRY, &table.table_id, Vec::new());
        let ops = vec![RowOperation {
            op_type: RowOpType::Delete,
            row,
        }];
        self.sync_write(self.write_request(ops))
    }

    pub fn visit_tables(&self, visitor: &mut dyn TableVisitor) -> Result<()> {
        self.visit_entries(TABLES_ENTRY, &mut |entry_id, metadata| {
            let entry: SysTablesEntry = serde_json::from_slice(metadata).map_err(|err| {
                Error::Corruption(format!(
                    "unable to parse metadata field for table {entry_id}: {err}"
                ))
            })?;
            visitor.visit_table(entry_id, &entry)
        })
    }

    // ==============================================================
    // Tablet entries
    // ==============================================================

    pub fn add_tablets(&self, tablets: &[TabletInfo]) -> Result<()> {
        self.add_and_update_tablets(tablets, &[])
    }

    pub fn update_tablets(&self, tablets: &[TabletInfo]) -> Result<()> {
        self.add_and_update_tablets(&[], tablets)
    }

    /// Insert and update tablet rows in one replicated batch.
    pub fn add_and_update_tablets(
        &self,
        tablets_to_add: &[TabletInfo],
        tablets_to_update: &[TabletInfo],
    ) -> Result<()> {
        let mut ops = Vec::with_capacity(tablets_to_add.len() + tablets_to_update.len());
        for tablet in tablets_to_add {
            ops.push(self.tablet_op(RowOpType::Insert, tablet)?);
        }
        for tablet in tablets_to_update {
            ops.push(self.tablet_op(RowOpType::Update, tablet)?);
        }
        self.sync_write(self.write_request(ops))
    }

    pub fn delete_tablets(&self, tablets: &[TabletInfo]) -> Result<()> {
        let mut ops = Vec::with_capacity(tablets.len());
        for tablet in tablets {
            let row = self.entry_row(TABLETS_ENTRY, &tablet.tablet_id, Vec::new());
            ops.push(RowOperation {
                op_type: RowOpType::Delete,
                row,
            });
        }
        self.sync_write(self.write_request(ops))
    }

    pub fn visit_tablets(&self, visitor: &mut dyn TabletVisitor) -> Result<()> {
        self.visit_entries(TABLETS_ENTRY, &mut |entry_id, metadata| {
            let entry: SysTabletsEntry = serde_json::from_slice(metadata).map_err(|err| {
                Error::Corruption(format!(
                    "unable to parse metadata field for tablet {entry_id}: {err}"
                ))
            })?;
            visitor.visit_tablet(&entry.table_id, entry_id, &entry)
        })
    }

    // ==============================================================
    // Row plumbing
    // ==============================================================

    fn write_request(&self, row_operations: Vec<RowOperation>) -> WriteRequest {
        WriteRequest {
            tablet_id: SYS_CATALOG_TABLET_ID.to_string(),
            schema: self.schema.clone(),
            row_operations,
        }
    }

    fn table_op(&self, op_type: RowOpType, table: &TableInfo) -> Result<RowOperation> {
        let metadata = serde_json::to_vec(&table.metadata).map_err(|err| {
            Error::Corruption(format!(
                "unable to serialize table entry for {}: {err}",
                table.table_id
            ))
        })?;
        Ok(RowOperation {
            op_type,
            row: self.entry_row(TABLES_ENTRY, &table.table_id, metadata),
        })
    }

    fn tablet_op(&self, op_type: RowOpType, tablet: &TabletInfo) -> Result<RowOperation> {
        let metadata = serde_json::to_vec(&tablet.metadata).map_err(|err| {
            Error::Corruption(format!(
                "unable to serialize tablet entry for {}: {err}",
                tablet.tablet_id
            ))
        })?;
        Ok(RowOperation {
            op_type,
            row: self.entry_row(TABLETS_ENTRY, &tablet.tablet_id, metadata),
        })
    }

    fn entry_row(&self, entry_type: u8, entry_id: &str, metadata: Vec<u8>) -> Row {
        Row::new(vec![
            Value::UInt8(entry_type),
            Value::String(entry_id.to_string()),
            Value::Bytes(metadata),
        ])
    }

    /// Submit a write and block on a one-shot latch until the transaction
    /// completes. Per-row failures surface as a single `Corruption`.
    fn sync_write(&self, request: WriteRequest) -> Result<()> {
        let peer = self.tablet_peer()?;
        let latch = Arc::new(CountDownLatch::new(1));
        let response_slot: Arc<Mutex<Option<WriteResponse>>> = Arc::new(Mutex::new(None));

        let completion_latch = Arc::clone(&latch);
        let completion_slot = Arc::clone(&response_slot);
        let state = WriteTransactionState::new(
            request,
            None,
            Some(Box::new(move |response| {
                *completion_slot.lock().unwrap() = Some(response);
                completion_latch.count_down();
            })),
        );
        peer.submit_write(state)?;
        latch.wait();

        let response = response_slot
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::IllegalState("write completed without a response".to_string()))?;
        if let Some((code, message)) = response.error {
            return Err(Error::from_code(code, message));
        }
        if !response.per_row_errors.is_empty() {
            for row_error in &response.per_row_errors {
                tracing::warn!(
                    row_index = row_error.row_index,
                    code = ?row_error.code,
                    message = %row_error.message,
                    "catalog row failed to write"
                );
            }
            return Err(Error::Corruption(
                "One or more rows failed to write".to_string(),
            ));
        }
        Ok(())
    }

    fn visit_entries(
        &self,
        entry_type: u8,
        visit: &mut dyn FnMut(&str, &[u8]) -> Result<()>,
    ) -> Result<()> {
        let peer = self.tablet_peer()?;
        let tablet = peer.tablet()?;

        let mut spec = ScanSpec::default();
        spec.add_predicate(ColumnRangePredicate::equals(
            COL_ENTRY_TYPE,
            Value::UInt8(entry_type),
        ));
        let mut iter = tablet.new_row_iterator(&spec)?;

        let id_idx = self
            .schema
            .find_column(COL_ENTRY_ID)
            .ok_or_else(|| Error::IllegalState("catalog schema lost entry_id".to_string()))?;
        let metadata_idx = self
            .schema
            .find_column(COL_METADATA)
            .ok_or_else(|| Error::IllegalState("catalog schema lost metadata".to_string()))?;

        while iter.has_next() {
            for row in iter.next_block() {
                let entry_id = match row.value(id_idx) {
                    Some(Value::String(id)) => id.as_str(),
                    other => {
                        return Err(Error::Corruption(format!(
                            "catalog row has a malformed entry id: {other:?}"
                        )))
                    }
                };
                let metadata = match row.value(metadata_idx) {
                    Some(Value::Bytes(bytes)) => bytes.as_slice(),
                    other => {
                        return Err(Error::Corruption(format!(
                            "catalog row {entry_id} has malformed metadata: {other:?}"
                        )))
                    }
                };
                visit(entry_id, metadata)?;
            }
        }
        Ok(())
    }
}

impl StateChangeListener for SysCatalogTable {
    fn on_state_changed(&self, peer: &TabletPeer) {
        let Ok(consensus) = peer.consensus() else {
            return;
        };
        let quorum = consensus.quorum();
        tracing::info!(
            uuid = %consensus.peer_uuid(),
            seqno = quorum.seqno,
            peers = quorum.peers.len(),
            role = ?consensus.role(),
            "sys-catalog state changed, new quorum configuration"
        );

        // Until real leader election lands, the configured role is the only
        // valid outcome; anything else means the cluster would split.
        if self.ctx.opts.is_distributed() {
            let expected = if self.ctx.opts.leader {
                Role::Leader
            } else {
                Role::Follower
            };
            let actual = consensus.role();
            assert_eq!(
                actual, expected,
                "aborting master startup: peer {} came up as {actual:?}, configured as {expected:?}",
                consensus.peer_uuid()
            );
        }
    }
}

/// Schema of the unified sys-catalog table: `(entry_type, entry_id)` keys a
/// single opaque metadata column.
fn build_table_schema() -> Schema {
    let mut builder = SchemaBuilder::new();
    builder
        .add_key_column(COL_ENTRY_TYPE, DataType::UInt8)
        .expect("static schema");
    builder
        .add_key_column(COL_ENTRY_ID, DataType::String)
        .expect("static schema");
    builder
        .add_column(COL_METADATA, DataType::Bytes)
        .expect("static schema");
    builder.build().expect("static schema")
}

fn master_block() -> TabletMasterBlock {
    TabletMasterBlock {
        tablet_id: SYS_CATALOG_TABLET_ID.to_string(),
        block_a: SYS_CATALOG_BLOCK_A.to_string(),
        block_b: SYS_CATALOG_BLOCK_B.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_schema_leads_with_entry_type() {
        let schema = build_table_schema();
        assert_eq!(schema.num_key_columns(), 2);
        assert_eq!(schema.columns()[0].name, COL_ENTRY_TYPE);
        assert_eq!(schema.columns()[1].name, COL_ENTRY_ID);
        assert_eq!(schema.columns()[2].name, COL_METADATA);
    }

    #[test]
    fn sys_catalog_tablet_id_is_32_zero_hex_chars() {
        assert_eq!(SYS_CATALOG_TABLET_ID.len(), 32);
        assert!(SYS_CATALOG_TABLET_ID.chars().all(|c| c == '0'));
    }
}
