//! Typed catalog entry records persisted in sys-catalog rows.
//!
//! The tablet stores these opaquely in the `metadata` column; only the
//! catalog layer parses them.

use serde::{Deserialize, Serialize};

use strata_consensus::Quorum;
use strata_tablet::Schema;
use strata_util::Result;

/// Lifecycle of a user table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableState {
    Preparing,
    Running,
    Altering,
    Removed,
}

/// Catalog record for one user table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SysTablesEntry {
    pub table_name: String,
    pub schema: Schema,
    pub state: TableState,
    pub next_column_id: u32,
    pub version: u32,
}

/// Lifecycle of a user tablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletState {
    Preparing,
    Creating,
    Running,
    Replaced,
}

/// Catalog record for one user tablet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SysTabletsEntry {
    pub table_id: String,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub quorum: Quorum,
    pub state: TabletState,
}

/// A table plus the id keying its catalog row.
#[derive(Debug, Clone, PartialEq)]
pub struct TableInfo {
    pub table_id: String,
    pub metadata: SysTablesEntry,
}

/// A tablet plus the id keying its catalog row.
#[derive(Debug, Clone, PartialEq)]
pub struct TabletInfo {
    pub tablet_id: String,
    pub metadata: SysTabletsEntry,
}

/// Receives one callback per table row during a catalog scan.
pub trait TableVisitor {
    fn visit_table(&mut self, table_id: &str, metadata: &SysTablesEntry) -> Result<()>;
}

/// Receives one callback per tablet row during a catalog scan.
pub trait TabletVisitor {
    fn visit_tablet(
        &mut self,
        table_id: &str,
        tablet_id: &str,
        metadata: &SysTabletsEntry,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_tablet::{DataType, SchemaBuilder};

    #[test]
    fn table_entry_round_trips() {
        let mut builder = SchemaBuilder::new();
        builder.add_key_column("id", DataType::String).unwrap();
        builder.add_column("v", DataType::Bytes).unwrap();
        let entry = SysTablesEntry {
            table_name: "users".to_string(),
            schema: builder.build().unwrap(),
            state: TableState::Running,
            next_column_id: 3,
            version: 2,
        };
        let bytes = serde_json::to_vec(&entry).unwrap();
        let back: SysTablesEntry = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn tablet_entry_round_trips() {
        let entry = SysTabletsEntry {
            table_id: "users".to_string(),
            start_key: b"a".to_vec(),
            end_key: b"m".to_vec(),
            quorum: Quorum::local_quorum(0, "peer"),
            state: TabletState::Creating,
        };
        let bytes = serde_json::to_vec(&entry).unwrap();
        let back: SysTabletsEntry = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, entry);
    }
}
