//! The typed row store.
//!
//! Mutations are staged during a transaction's apply step and only published
//! into the committed row map by `apply_staged`, which the driver invokes at
//! finish. Readers always see fully committed batches.
//!
//! Lock order inside a write: row locks (prepare) → component lock shared
//! (prepare) → schema lock shared (apply). Alter-schema takes the schema
//! lock exclusive before its apply and waits for in-flight writers to drain.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};

use parking_lot::RwLock as SharedLock;

use crate::lock_manager::LockManager;
use crate::schema::{Row, Schema, Value};
use strata_util::{Error, Result};

/// Inclusive range predicate over one column.
#[derive(Debug, Clone)]
pub struct ColumnRangePredicate {
    pub column: String,
    pub lower: Option<Value>,
    pub upper: Option<Value>,
}

impl ColumnRangePredicate {
    /// Pin a column to exactly one value.
    pub fn equals(column: impl Into<String>, value: Value) -> Self {
        Self {
            column: column.into(),
            lower: Some(value.clone()),
            upper: Some(value),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanSpec {
    pub predicates: Vec<ColumnRangePredicate>,
}

impl ScanSpec {
    pub fn add_predicate(&mut self, predicate: ColumnRangePredicate) {
        self.predicates.push(predicate);
    }
}

/// A mutation validated by apply, waiting to become reader-visible.
#[derive(Debug, Clone)]
pub enum StagedMutation {
    Insert { key: Vec<u8>, row: Row },
    Update { key: Vec<u8>, row: Row },
    Delete { key: Vec<u8> },
}

#[derive(Debug)]
pub struct Tablet {
    tablet_id: String,
    schema: SharedLock<Arc<Schema>>,
    schema_version: AtomicU32,
    rows: StdRwLock<BTreeMap<Vec<u8>, Row>>,
    component_lock: Arc<SharedLock<()>>,
    schema_lock: Arc<SharedLock<()>>,
    lock_manager: Arc<LockManager>,
}

impl Tablet {
    pub fn new(tablet_id: impl Into<String>, schema: Schema, schema_version: u32) -> Self {
        Self {
            tablet_id: tablet_id.into(),
            schema: SharedLock::new(Arc::new(schema)),
            schema_version: AtomicU32::new(schema_version),
            rows: StdRwLock::new(BTreeMap::new()),
            component_lock: Arc::new(SharedLock::new(())),
            schema_lock: Arc::new(SharedLock::new(())),
            lock_manager: Arc::new(LockManager::new()),
        }
    }

    pub fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    pub fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema.read())
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version.load(Ordering::Acquire)
    }

    /// Shared by writers, exclusive for alter-schema and compaction.
    pub fn component_lock(&self) -> &Arc<SharedLock<()>> {
        &self.component_lock
    }

    /// Shared by writers during apply, exclusive for alter-schema.
    pub fn schema_lock(&self) -> &Arc<SharedLock<()>> {
        &self.schema_lock
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Whether a committed row exists for `key`. The write path judges
    /// inserts and mutations against this; under the row lock the answer
    /// stays true until the batch commits.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.rows.read().unwrap().contains_key(key)
    }

    /// Publish a batch of staged mutations to readers.
    pub fn apply_staged(&self, staged: &[StagedMutation]) {
        if staged.is_empty() {
            return;
        }
        let mut rows = self.rows.write().unwrap();
        for mutation in staged {
            match mutation {
                StagedMutation::Insert { key, row } | StagedMutation::Update { key, row } => {
                    rows.insert(key.clone(), row.clone());
                }
                StagedMutation::Delete { key } => {
                    rows.remove(key);
                }
            }
        }
    }

    /// Validate a pending schema change without applying it.
    pub fn create_prepared_alter_schema(
        &self,
        new_schema: &Schema,
        new_version: u32,
    ) -> Result<()> {
        let current_version = self.schema_version();
        if new_version <= current_version {
            return Err(Error::InvalidSchema(format!(
                "alter targets version {new_version}, tablet is already at {current_version}"
            )));
        }
        self.schema().can_alter_to(new_schema)?;
        Ok(())
    }

    /// Swap in the new schema. The caller holds the schema lock exclusive.
    pub fn alter_schema(&self, new_schema: Schema, new_version: u32) -> Result<()> {
        self.create_prepared_alter_schema(&new_schema, new_version)?;
        *self.schema.write() = Arc::new(new_schema);
        self.schema_version.store(new_version, Ordering::Release);
        tracing::info!(
            tablet_id = %self.tablet_id,
            schema_version = new_version,
            "tablet schema altered"
        );
        Ok(())
    }

    /// Open a block iterator over rows matching `spec`, snapshotted at call
    /// time.
    pub fn new_row_iterator(&self, spec: &ScanSpec) -> Result<RowBlockIterator> {
        let schema = self.schema();
        // Resolve predicate columns up front so bad scans fail loudly.
        let mut resolved = Vec::with_capacity(spec.predicates.len());
        for predicate in &spec.predicates {
            let idx = schema.find_column(&predicate.column).ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "predicate references unknown column {}",
                    predicate.column
                ))
            })?;
            resolved.push((idx, predicate.clone()));
        }

        let rows = self.rows.read().unwrap();
        let mut selected = Vec::new();
        'rows: for row in rows.values() {
            for (idx, predicate) in &resolved {
                let Some(value) = row.value(*idx) else {
                    continue 'rows;
                };
                if let Some(lower) = &predicate.lower {
                    match value.compare(lower) {
                        Some(ord) if ord != std::cmp::Ordering::Less => {}
                        _ => continue 'rows,
                    }
                }
                if let Some(upper) = &predicate.upper {
                    match value.compare(upper) {
                        Some(ord) if ord != std::cmp::Ordering::Greater => {}
                        _ => continue 'rows,
                    }
                }
            }
            selected.push(row.clone());
        }
        Ok(RowBlockIterator::new(selected))
    }

    pub fn row_count(&self) -> usize {
        self.rows.read().unwrap().len()
    }

    /// Committed row for a key, if any. Intended for tests and debugging.
    pub fn get_row(&self, key: &[u8]) -> Option<Row> {
        self.rows.read().unwrap().get(key).cloned()
    }
}

const ROW_BLOCK_SIZE: usize = 512;

/// Iterates matching rows in key order, in blocks of up to 512 rows.
pub struct RowBlockIterator {
    rows: Vec<Row>,
    pos: usize,
}

impl RowBlockIterator {
    fn new(rows: Vec<Row>) -> Self {
        Self { rows, pos: 0 }
    }

    pub fn has_next(&self) -> bool {
        self.pos < self.rows.len()
    }

    pub fn next_block(&mut self) -> &[Row] {
        let start = self.pos;
        let end = (start + ROW_BLOCK_SIZE).min(self.rows.len());
        self.pos = end;
        &self.rows[start..end]
    }
}
