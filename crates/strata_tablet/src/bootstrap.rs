//! Tablet bootstrap: replay the persisted log into a fresh in-memory tablet.
//!
//! Replicates are buffered by op id until their commit arrives; a commit
//! that cannot be matched to a buffered replicate means the log is corrupt
//! and the tablet must not come up. Replicates still unmatched at the end of
//! the log are handed back as orphans for the peer to re-drive.

use std::collections::BTreeMap;
use std::sync::Arc;

use strata_consensus::anchor::{LogAnchor, LogAnchorRegistry};
use strata_consensus::consensus::ConsensusBootstrapInfo;
use strata_consensus::log::{Log, LogEntry};
use strata_consensus::ops::{OpId, OperationType, ReplicateMsg};
use strata_util::clock::HybridClock;
use strata_util::{Error, Result};

use crate::metadata::TabletMetadata;
use crate::tablet::Tablet;
use crate::transactions::write::{decode_row_operations, stage_row_operations};
use crate::wire::{AlterSchemaRequest, WriteRequest};

/// Everything bootstrap hands back to the caller.
#[derive(Debug)]
pub struct BootstrappedTablet {
    pub tablet: Arc<Tablet>,
    /// Reopened for appending, positioned at end-of-log.
    pub log: Arc<Log>,
    pub info: ConsensusBootstrapInfo,
    /// Pins the earliest orphaned entry until the peer has re-driven it.
    pub orphan_anchor: Option<LogAnchor>,
}

pub fn bootstrap_tablet(
    metadata: &mut TabletMetadata,
    clock: &HybridClock,
    anchor_registry: Arc<LogAnchorRegistry>,
) -> Result<BootstrappedTablet> {
    let tablet_id = metadata.tablet_id().to_string();
    let entries = Log::read_entries(metadata.root(), &tablet_id)?;
    tracing::info!(
        tablet_id = %tablet_id,
        entries = entries.len(),
        "replaying tablet log"
    );

    let tablet = Tablet::new(
        tablet_id.clone(),
        metadata.schema().clone(),
        metadata.schema_version(),
    );

    let mut pending: BTreeMap<u64, ReplicateMsg> = BTreeMap::new();
    let mut last_id = OpId::default();
    let mut last_committed_id = OpId::default();
    let mut schema_changed = false;

    for entry in entries {
        match entry {
            LogEntry::Replicate(msg) => {
                clock.update(msg.timestamp);
                if pending.insert(msg.id.index, msg.clone()).is_some() {
                    return Err(Error::Corruption(format!(
                        "duplicate replicate at index {} in tablet {tablet_id} log",
                        msg.id.index
                    )));
                }
                last_id = last_id.max(msg.id);
            }
            LogEntry::Commit(commit) => {
                let Some(replicate) = pending.remove(&commit.committed_op_id.index) else {
                    return Err(Error::Corruption(format!(
                        "commit for {} has no matching replicate in tablet {tablet_id} log",
                        commit.committed_op_id
                    )));
                };
                if replicate.id != commit.committed_op_id {
                    return Err(Error::Corruption(format!(
                        "commit op id {} does not match replicate {}",
                        commit.committed_op_id, replicate.id
                    )));
                }
                if !commit.is_abort() {
                    schema_changed |= apply_replicate(&tablet, metadata, &replicate)?;
                }
                last_committed_id = last_committed_id.max(commit.committed_op_id);
            }
        }
    }

    if schema_changed {
        metadata.flush()?;
    }

    let orphaned_replicates: Vec<ReplicateMsg> = pending.into_values().collect();
    let orphan_anchor = orphaned_replicates.first().map(|msg| {
        anchor_registry.register(msg.id.index, format!("bootstrap-{tablet_id}"))
    });
    if !orphaned_replicates.is_empty() {
        tracing::warn!(
            tablet_id = %tablet_id,
            orphans = orphaned_replicates.len(),
            first = %orphaned_replicates[0].id,
            "log replay left orphaned replicates"
        );
    }

    let log = Arc::new(Log::open(
        metadata.root(),
        &tablet_id,
        anchor_registry,
        if last_id == OpId::default() {
            None
        } else {
            Some(last_id)
        },
    )?);

    Ok(BootstrappedTablet {
        tablet: Arc::new(tablet),
        log,
        info: ConsensusBootstrapInfo {
            last_id,
            last_committed_id,
            orphaned_replicates,
        },
        orphan_anchor,
    })
}

/// Re-apply one committed replicate. Returns true when it changed the
/// persisted schema.
fn apply_replicate(
    tablet: &Tablet,
    metadata: &mut TabletMetadata,
    msg: &ReplicateMsg,
) -> Result<bool> {
    match msg.op_type {
        OperationType::Write => {
            let request = WriteRequest::from_payload(&msg.payload)?;
            let decoded = decode_row_operations(&request.schema, &request.row_operations)?;
            // Per-row outcomes are recomputed deterministically; the same
            // rows fail here that failed in the original apply.
            let (staged, _per_row_errors) =
                stage_row_operations(tablet, &request.schema, &decoded);
            tablet.apply_staged(&staged);
            Ok(false)
        }
        OperationType::AlterSchema => {
            let request = AlterSchemaRequest::from_payload(&msg.payload)?;
            if request.schema_version <= tablet.schema_version() {
                return Ok(false);
            }
            tablet.alter_schema(request.new_schema.clone(), request.schema_version)?;
            metadata.set_schema(request.new_schema, request.schema_version);
            Ok(true)
        }
        OperationType::NoOp => Ok(false),
        OperationType::OpAbort => Err(Error::Corruption(
            "replicate entry carries an abort op type".to_string(),
        )),
    }
}
