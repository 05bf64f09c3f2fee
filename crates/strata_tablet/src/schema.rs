//! Typed table schemas with stable column ids.
//!
//! Column ids survive renames, which is what makes alter-schema validation
//! possible: a column keeps its id for life, added columns get fresh ids and
//! must carry a default, and key columns never change.

use serde::{Deserialize, Serialize};
use strata_util::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    UInt8,
    String,
    Bytes,
}

/// A single typed cell value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    UInt8(u8),
    String(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::UInt8(_) => DataType::UInt8,
            Value::String(_) => DataType::String,
            Value::Bytes(_) => DataType::Bytes,
        }
    }

    /// Ordering within a single data type; used by range predicates.
    pub fn compare(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::UInt8(a), Value::UInt8(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub id: u32,
    pub name: String,
    pub data_type: DataType,
    pub is_key: bool,
    /// Required for columns added by an alter so that rows written under an
    /// older schema project cleanly onto the new one.
    pub default: Option<Value>,
}

/// An ordered set of columns, keys first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<ColumnSchema>,
    num_key_columns: usize,
}

impl Schema {
    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_key_columns(&self) -> usize {
        self.num_key_columns
    }

    pub fn key_columns(&self) -> &[ColumnSchema] {
        &self.columns[..self.num_key_columns]
    }

    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn find_column_by_id(&self, id: u32) -> Option<usize> {
        self.columns.iter().position(|c| c.id == id)
    }

    pub fn max_column_id(&self) -> u32 {
        self.columns.iter().map(|c| c.id).max().unwrap_or(0)
    }

    /// Check a row's arity and value types against this schema.
    pub fn validate_row(&self, row: &Row) -> Result<()> {
        if row.values.len() != self.columns.len() {
            return Err(Error::InvalidArgument(format!(
                "row has {} values, schema has {} columns",
                row.values.len(),
                self.columns.len()
            )));
        }
        for (value, column) in row.values.iter().zip(&self.columns) {
            if value.data_type() != column.data_type {
                return Err(Error::InvalidArgument(format!(
                    "column {} expects {:?}, row carries {:?}",
                    column.name,
                    column.data_type,
                    value.data_type()
                )));
            }
        }
        Ok(())
    }

    /// Encode the key columns of a row into a sortable byte key.
    ///
    /// Fixed-width values are emitted raw; variable-width values are
    /// length-prefixed except in the final key position, where the raw bytes
    /// keep prefix scans cheap.
    pub fn encode_row_key(&self, row: &Row) -> Result<Vec<u8>> {
        self.validate_row(row)?;
        let mut key = Vec::new();
        for idx in 0..self.num_key_columns {
            let last = idx + 1 == self.num_key_columns;
            match &row.values[idx] {
                Value::UInt8(v) => key.push(*v),
                Value::String(s) => encode_var(&mut key, s.as_bytes(), last),
                Value::Bytes(b) => encode_var(&mut key, b, last),
            }
        }
        Ok(key)
    }

    /// Verify `new` is a compatible evolution of this schema.
    ///
    /// Keys are immutable; existing columns may be renamed but not retyped;
    /// added columns must be non-key and carry a default.
    pub fn can_alter_to(&self, new: &Schema) -> Result<()> {
        if new.key_columns().len() != self.key_columns().len() {
            return Err(Error::InvalidSchema(
                "key column count cannot change".to_string(),
            ));
        }
        for (old_key, new_key) in self.key_columns().iter().zip(new.key_columns()) {
            if old_key.id != new_key.id
                || old_key.name != new_key.name
                || old_key.data_type != new_key.data_type
            {
                return Err(Error::InvalidSchema(format!(
                    "key column {} cannot be altered",
                    old_key.name
                )));
            }
        }
        for new_col in new.columns() {
            match self.find_column_by_id(new_col.id) {
                Some(old_idx) => {
                    let old_col = &self.columns[old_idx];
                    if old_col.data_type != new_col.data_type {
                        return Err(Error::InvalidSchema(format!(
                            "column {} cannot change type {:?} -> {:?}",
                            old_col.name, old_col.data_type, new_col.data_type
                        )));
                    }
                    if old_col.is_key != new_col.is_key {
                        return Err(Error::InvalidSchema(format!(
                            "column {} cannot move in or out of the key",
                            old_col.name
                        )));
                    }
                }
                None => {
                    if new_col.is_key {
                        return Err(Error::InvalidSchema(format!(
                            "new column {} cannot be a key column",
                            new_col.name
                        )));
                    }
                    if new_col.default.is_none() {
                        return Err(Error::InvalidSchema(format!(
                            "new column {} needs a default value",
                            new_col.name
                        )));
                    }
                    if new_col.id <= self.max_column_id() {
                        return Err(Error::InvalidSchema(format!(
                            "new column {} reuses column id {}",
                            new_col.name, new_col.id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Re-shape a row written under `source` onto this schema, matching
    /// columns by id and filling added columns from their defaults.
    pub fn project_row(&self, source: &Schema, row: &Row) -> Result<Row> {
        source.validate_row(row)?;
        let mut values = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            match source.find_column_by_id(column.id) {
                Some(idx) => values.push(row.values[idx].clone()),
                None => match &column.default {
                    Some(default) => values.push(default.clone()),
                    None => {
                        return Err(Error::InvalidArgument(format!(
                            "row is missing column {} and no default exists",
                            column.name
                        )))
                    }
                },
            }
        }
        Ok(Row::new(values))
    }
}

fn encode_var(key: &mut Vec<u8>, bytes: &[u8], last: bool) {
    if last {
        key.extend_from_slice(bytes);
    } else {
        key.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        key.extend_from_slice(bytes);
    }
}

/// A row aligned with some schema's column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn value(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }
}

/// Incrementally build a schema, assigning stable column ids.
pub struct SchemaBuilder {
    columns: Vec<ColumnSchema>,
    num_key_columns: usize,
    next_id: u32,
    sealed_keys: bool,
}

impl Default for SchemaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self {
            columns: Vec::new(),
            num_key_columns: 0,
            next_id: 1,
            sealed_keys: false,
        }
    }

    /// Seed from an existing schema; new columns continue its id sequence.
    pub fn from_schema(schema: &Schema) -> Self {
        Self {
            columns: schema.columns.clone(),
            num_key_columns: schema.num_key_columns,
            next_id: schema.max_column_id() + 1,
            sealed_keys: true,
        }
    }

    pub fn add_key_column(&mut self, name: impl Into<String>, data_type: DataType) -> Result<()> {
        if self.sealed_keys {
            return Err(Error::InvalidArgument(
                "key columns must precede value columns".to_string(),
            ));
        }
        let name = name.into();
        self.check_unique(&name)?;
        self.columns.push(ColumnSchema {
            id: self.next_id,
            name,
            data_type,
            is_key: true,
            default: None,
        });
        self.next_id += 1;
        self.num_key_columns += 1;
        Ok(())
    }

    pub fn add_column(&mut self, name: impl Into<String>, data_type: DataType) -> Result<()> {
        self.add_column_inner(name.into(), data_type, None)
    }

    pub fn add_column_with_default(
        &mut self,
        name: impl Into<String>,
        data_type: DataType,
        default: Value,
    ) -> Result<()> {
        let name = name.into();
        if default.data_type() != data_type {
            return Err(Error::InvalidArgument(format!(
                "default for column {name} has mismatched type"
            )));
        }
        self.add_column_inner(name, data_type, Some(default))
    }

    pub fn remove_column(&mut self, name: &str) -> Result<()> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| Error::NotFound(format!("no column named {name}")))?;
        if self.columns[idx].is_key {
            return Err(Error::InvalidArgument(format!(
                "cannot remove key column {name}"
            )));
        }
        self.columns.remove(idx);
        Ok(())
    }

    pub fn rename_column(&mut self, old_name: &str, new_name: impl Into<String>) -> Result<()> {
        let new_name = new_name.into();
        self.check_unique(&new_name)?;
        let idx = self
            .columns
            .iter()
            .position(|c| c.name == old_name)
            .ok_or_else(|| Error::NotFound(format!("no column named {old_name}")))?;
        self.columns[idx].name = new_name;
        Ok(())
    }

    pub fn build(self) -> Result<Schema> {
        if self.num_key_columns == 0 {
            return Err(Error::InvalidArgument(
                "schema needs at least one key column".to_string(),
            ));
        }
        Ok(Schema {
            columns: self.columns,
            num_key_columns: self.num_key_columns,
        })
    }

    fn add_column_inner(
        &mut self,
        name: String,
        data_type: DataType,
        default: Option<Value>,
    ) -> Result<()> {
        self.check_unique(&name)?;
        self.sealed_keys = true;
        self.columns.push(ColumnSchema {
            id: self.next_id,
            name,
            data_type,
            is_key: false,
            default,
        });
        self.next_id += 1;
        Ok(())
    }

    fn check_unique(&self, name: &str) -> Result<()> {
        if self.columns.iter().any(|c| c.name == name) {
            return Err(Error::AlreadyPresent(format!(
                "column {name} already exists"
            )));
        }
        Ok(())
    }
}
