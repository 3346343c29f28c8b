//! Table schema definition and validation.
//!
//! A [`TableSchema`] describes one synchronized base table: its ordered
//! columns and its primary key. Schemas are introspected from each provider at
//! the start of a session and validated before any change moves.

use crate::{error::Result, record::RowKey, ColumnName, Error, RowData, TableName};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Semantic column types, independent of any backend dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Bool,
    Int32,
    Int64,
    Double,
    Decimal,
    String,
    /// Fixed-length string (`CHAR(n)`)
    FixedString,
    Guid,
    DateTime,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ColumnType::Bool => "bool",
            ColumnType::Int32 => "int32",
            ColumnType::Int64 => "int64",
            ColumnType::Double => "double",
            ColumnType::Decimal => "decimal",
            ColumnType::String => "string",
            ColumnType::FixedString => "fixedstring",
            ColumnType::Guid => "guid",
            ColumnType::DateTime => "datetime",
            ColumnType::Json => "json",
        };
        f.write_str(name)
    }
}

/// Definition of a column in a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    /// Column name
    pub name: ColumnName,
    /// Semantic type
    pub column_type: ColumnType,
    /// Whether NULL is allowed
    pub nullable: bool,
    /// Maximum length for string columns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
    /// Total digits for decimal columns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u8>,
    /// Digits after the decimal point
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u8>,
    /// Value generated by the store on insert
    #[serde(default)]
    pub auto_increment: bool,
}

impl Column {
    /// Create a new NOT NULL column.
    pub fn required(name: impl Into<ColumnName>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            max_length: None,
            precision: None,
            scale: None,
            auto_increment: false,
        }
    }

    /// Create a new nullable column.
    pub fn nullable(name: impl Into<ColumnName>, column_type: ColumnType) -> Self {
        Self {
            nullable: true,
            ..Self::required(name, column_type)
        }
    }

    pub fn with_max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn with_precision(mut self, precision: u8, scale: u8) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Validate a JSON value against this column definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None | Some(serde_json::Value::Null) if !self.nullable && !self.auto_increment => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            None | Some(serde_json::Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.column_type {
            ColumnType::Bool => value.is_boolean() || value.is_i64() || value.is_u64(),
            ColumnType::Int32 | ColumnType::Int64 => value.is_i64() || value.is_u64(),
            ColumnType::Double => value.is_number(),
            // Decimals travel either as numbers or as their exact text form.
            ColumnType::Decimal => value.is_number() || value.is_string(),
            ColumnType::String | ColumnType::FixedString => value.is_string(),
            ColumnType::Guid | ColumnType::DateTime => value.is_string(),
            ColumnType::Json => true,
        };

        if !valid {
            return Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.column_type.to_string(),
                got: json_type_name(value).to_string(),
            });
        }

        if let (Some(max), Some(s)) = (self.max_length, value.as_str()) {
            if s.chars().count() > max as usize {
                return Err(Error::TypeMismatch {
                    field: self.name.clone(),
                    expected: format!("{} of at most {} characters", self.column_type, max),
                    got: format!("{} characters", s.chars().count()),
                });
            }
        }

        Ok(())
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Schema of one base table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    /// Table name
    pub name: TableName,
    /// Ordered column definitions
    pub columns: Vec<Column>,
    /// Ordered primary key column names
    pub primary_key: Vec<ColumnName>,
}

impl TableSchema {
    /// Create a new table schema.
    pub fn new(
        name: impl Into<TableName>,
        columns: Vec<Column>,
        primary_key: Vec<impl Into<ColumnName>>,
    ) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key: primary_key.into_iter().map(Into::into).collect(),
        }
    }

    /// Get a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Whether `name` is part of the primary key.
    pub fn is_key_column(&self, name: &str) -> bool {
        self.primary_key.iter().any(|k| k == name)
    }

    /// Primary key columns, in key order.
    pub fn key_columns(&self) -> impl Iterator<Item = &Column> {
        self.primary_key.iter().filter_map(|k| self.column(k))
    }

    /// Columns that are not part of the primary key.
    pub fn value_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !self.is_key_column(&c.name))
    }

    /// Check the structural invariants of the schema.
    ///
    /// Column names must be unique, the primary key must be non-empty, and
    /// every key column must exist and be non-nullable.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(Error::DuplicateColumn {
                    table: self.name.clone(),
                    column: column.name.clone(),
                });
            }
        }

        if self.primary_key.is_empty() {
            return Err(Error::MissingPrimaryKey(self.name.clone()));
        }

        let mut seen_keys = HashSet::new();
        for key in &self.primary_key {
            let column = self.column(key).ok_or_else(|| Error::InvalidPrimaryKey {
                table: self.name.clone(),
                column: key.clone(),
                reason: "column does not exist".into(),
            })?;
            if column.nullable {
                return Err(Error::InvalidPrimaryKey {
                    table: self.name.clone(),
                    column: key.clone(),
                    reason: "key columns must not be nullable".into(),
                });
            }
            if !seen_keys.insert(key.as_str()) {
                return Err(Error::InvalidPrimaryKey {
                    table: self.name.clone(),
                    column: key.clone(),
                    reason: "column listed twice".into(),
                });
            }
        }

        Ok(())
    }

    /// Validate a row payload against this schema.
    pub fn validate_row(&self, row: &RowData) -> Result<()> {
        for column in &self.columns {
            column.validate(row.get(&column.name)).map_err(|e| Error::InvalidRow {
                table: self.name.clone(),
                reason: e.to_string(),
            })?;
        }

        if let Some(unknown) = row.keys().find(|k| self.column(k).is_none()) {
            return Err(Error::InvalidRow {
                table: self.name.clone(),
                reason: format!("unknown column '{}'", unknown),
            });
        }

        Ok(())
    }

    /// Extract the primary key of a row.
    pub fn key_of(&self, row: &RowData) -> Result<RowKey> {
        let mut values = Vec::with_capacity(self.primary_key.len());
        for key in &self.primary_key {
            match row.get(key) {
                Some(v) if !v.is_null() => values.push(v.clone()),
                _ => {
                    return Err(Error::InvalidRow {
                        table: self.name.clone(),
                        reason: format!("missing key column '{}'", key),
                    })
                }
            }
        }
        Ok(RowKey::new(values))
    }

    /// Check that two participants describe the same logical table.
    ///
    /// Primary keys must match exactly. Every column of `self` must exist on
    /// the other side with the same semantic type.
    pub fn ensure_compatible(&self, other: &TableSchema) -> Result<()> {
        if self.primary_key != other.primary_key {
            return Err(Error::SchemaMismatch {
                table: self.name.clone(),
                detail: format!(
                    "primary key {:?} does not match {:?}",
                    self.primary_key, other.primary_key
                ),
            });
        }

        for column in &self.columns {
            match other.column(&column.name) {
                None => {
                    return Err(Error::SchemaMismatch {
                        table: self.name.clone(),
                        detail: format!("column '{}' missing on peer", column.name),
                    })
                }
                Some(theirs) if !types_compatible(column.column_type, theirs.column_type) => {
                    return Err(Error::SchemaMismatch {
                        table: self.name.clone(),
                        detail: format!(
                            "column '{}' is {} here and {} on peer",
                            column.name, column.column_type, theirs.column_type
                        ),
                    })
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}

fn types_compatible(a: ColumnType, b: ColumnType) -> bool {
    use ColumnType::*;
    a == b || matches!(
        (a, b),
        (Int32, Int64) | (Int64, Int32) | (String, FixedString) | (FixedString, String)
    )
}

/// The set of table schemas a session synchronizes, in configured order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSchema {
    pub tables: Vec<TableSchema>,
}

impl SyncSchema {
    pub fn new(tables: Vec<TableSchema>) -> Self {
        Self { tables }
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Serialize to pretty JSON for progress reporting.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidBatch(e.to_string()))
    }
}
