//! Request/response types for the write pipeline.
//!
//! These are the serialized forms carried inside replicate payloads and
//! returned to callers; the row data inside them is typed against the
//! schema the writer used.

use serde::{Deserialize, Serialize};

use crate::schema::{Row, Schema};
use strata_util::{Error, ErrorCode, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowOpType {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowOperation {
    pub op_type: RowOpType,
    pub row: Row,
}

/// A batch of row operations against one tablet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    pub tablet_id: String,
    /// The writer's view of the schema; rows are laid out against it and
    /// re-projected onto the tablet schema at apply time.
    pub schema: Schema,
    pub row_operations: Vec<RowOperation>,
}

impl WriteRequest {
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|err| {
            Error::Corruption(format!("undecodable write request payload: {err}"))
        })
    }
}

/// Outcome of a single row operation that did not apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerRowError {
    pub row_index: usize,
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteResponse {
    pub error: Option<(ErrorCode, String)>,
    pub per_row_errors: Vec<PerRowError>,
}

impl WriteResponse {
    pub fn set_error(&mut self, err: &Error) {
        self.error = Some((err.code(), err.to_string()));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlterSchemaRequest {
    pub tablet_id: String,
    pub new_schema: Schema,
    /// Version the tablet moves to; must exceed the tablet's current one.
    pub schema_version: u32,
}

impl AlterSchemaRequest {
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|err| {
            Error::Corruption(format!("undecodable alter-schema payload: {err}"))
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlterSchemaResponse {
    pub error: Option<(ErrorCode, String)>,
}

impl AlterSchemaResponse {
    pub fn set_error(&mut self, err: &Error) {
        self.error = Some((err.code(), err.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, SchemaBuilder, Value};

    #[test]
    fn write_request_payload_round_trips() {
        let mut builder = SchemaBuilder::new();
        builder.add_key_column("k", DataType::String).unwrap();
        builder.add_column("v", DataType::Bytes).unwrap();
        let schema = builder.build().unwrap();

        let req = WriteRequest {
            tablet_id: "t".to_string(),
            schema,
            row_operations: vec![RowOperation {
                op_type: RowOpType::Insert,
                row: Row::new(vec![
                    Value::String("a".to_string()),
                    Value::Bytes(b"payload".to_vec()),
                ]),
            }],
        };
        let payload = req.to_payload().unwrap();
        let back = WriteRequest::from_payload(&payload).unwrap();
        assert_eq!(back.tablet_id, "t");
        assert_eq!(back.row_operations.len(), 1);
        assert_eq!(back.row_operations[0].op_type, RowOpType::Insert);
    }

    #[test]
    fn garbage_payload_is_corruption() {
        let err = WriteRequest::from_payload(b"not json").unwrap_err();
        assert!(err.is_corruption());
    }
}
