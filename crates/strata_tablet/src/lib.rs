//! Tablet runtime: the typed row store, its persistent metadata, log
//! bootstrap, and the write-transaction pipeline that funnels every mutation
//! through consensus.

pub mod bootstrap;
pub mod lock_manager;
pub mod metadata;
pub mod peer;
pub mod schema;
pub mod tablet;
pub mod transactions;
pub mod wire;

pub use peer::{StateChangeListener, TabletPeer};
pub use schema::{ColumnSchema, DataType, Row, Schema, SchemaBuilder, Value};
pub use tablet::{ColumnRangePredicate, ScanSpec, Tablet};
pub use wire::{
    AlterSchemaRequest, AlterSchemaResponse, PerRowError, RowOpType, RowOperation, WriteRequest,
    WriteResponse,
};
