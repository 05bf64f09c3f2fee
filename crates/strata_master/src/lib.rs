//! The cluster masters' system catalog.
//!
//! Every master embeds one internal tablet, the sys-catalog tablet, whose
//! rows are the cluster catalog: one row per user table and one per tablet.
//! Mutations flow through the replicated write pipeline; reads are typed
//! visitors over predicate scans.

pub mod entries;
pub mod options;
pub mod sys_catalog;

pub use entries::{
    SysTablesEntry, SysTabletsEntry, TableInfo, TableState, TableVisitor, TabletInfo,
    TabletState, TabletVisitor,
};
pub use options::MasterOptions;
pub use sys_catalog::{MasterContext, SysCatalogTable, SYS_CATALOG_TABLET_ID};
