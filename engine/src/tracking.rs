//! Tracking table layout and DDL builders.
//!
//! Every synchronized base table gets a shadow table holding one
//! [`TrackingRow`](crate::TrackingRow) per base row. [`TrackingTable`] describes
//! that layout independently of any backend. A [`TrackingTableBuilder`] turns it
//! into statements for one dialect; builders only produce text, the caller runs
//! the statements inside a transaction.

use crate::{
    error::Result, schema::Column, ColumnName, ColumnType, Error, RowData, TableName, TableSchema,
};
use serde::{Deserialize, Serialize};

/// Suffix appended to the base table name.
pub const TRACKING_SUFFIX: &str = "_tracking";

pub const CREATE_TIMESTAMP: &str = "create_timestamp";
pub const UPDATE_TIMESTAMP: &str = "update_timestamp";
pub const CREATE_SCOPE_ID: &str = "create_scope_id";
pub const UPDATE_SCOPE_ID: &str = "update_scope_id";
pub const IS_TOMBSTONE: &str = "is_tombstone";

/// Metadata columns, in the order they follow the key columns.
pub const METADATA_COLUMNS: [&str; 5] = [
    CREATE_TIMESTAMP,
    UPDATE_TIMESTAMP,
    CREATE_SCOPE_ID,
    UPDATE_SCOPE_ID,
    IS_TOMBSTONE,
];

/// Layout of the tracking table for one base table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingTable {
    /// The base table
    pub schema: TableSchema,
    /// Base columns copied into the tracking table for scope filtering
    pub filter_columns: Vec<ColumnName>,
}

impl TrackingTable {
    /// Describe the tracking table for `schema`, validating the filter columns.
    pub fn new(schema: TableSchema, filter_columns: Vec<ColumnName>) -> Result<Self> {
        schema.validate()?;

        for (i, column) in filter_columns.iter().enumerate() {
            let reason = if schema.column(column).is_none() {
                Some("column does not exist")
            } else if schema.is_key_column(column) {
                Some("primary key columns are always tracked")
            } else if METADATA_COLUMNS.contains(&column.as_str()) {
                Some("name collides with a tracking metadata column")
            } else if filter_columns[..i].contains(column) {
                Some("column listed twice")
            } else {
                None
            };

            if let Some(reason) = reason {
                return Err(Error::InvalidFilterColumn {
                    table: schema.name.clone(),
                    column: column.clone(),
                    reason: reason.into(),
                });
            }
        }

        Ok(Self {
            schema,
            filter_columns,
        })
    }

    pub fn base_name(&self) -> &TableName {
        &self.schema.name
    }

    /// Name of the tracking table.
    pub fn name(&self) -> String {
        format!("{}{}", self.schema.name, TRACKING_SUFFIX)
    }

    /// Definitions of the filter columns, in configured order.
    pub fn filter_column_defs(&self) -> impl Iterator<Item = &Column> {
        self.filter_columns
            .iter()
            .filter_map(|c| self.schema.column(c))
    }

    /// Every column of the tracking table, in physical order.
    pub fn column_names(&self) -> Vec<ColumnName> {
        let mut names: Vec<ColumnName> = self.schema.primary_key.clone();
        names.extend(METADATA_COLUMNS.iter().map(|c| c.to_string()));
        names.extend(self.filter_columns.iter().cloned());
        names
    }

    /// Copy the filter column values out of a base row.
    pub fn filter_values(&self, row: &RowData) -> RowData {
        self.filter_columns
            .iter()
            .map(|c| {
                (
                    c.clone(),
                    row.get(c).cloned().unwrap_or(serde_json::Value::Null),
                )
            })
            .collect()
    }

    /// Whether a tracking row's filter values satisfy every parameter that
    /// names one of this table's filter columns.
    pub fn matches_filters(&self, filter_values: &RowData, parameters: &RowData) -> bool {
        self.filter_columns.iter().all(|column| match parameters.get(column) {
            Some(expected) => filter_values.get(column) == Some(expected),
            None => true,
        })
    }

    /// Subset of `parameters` that applies to this table.
    pub fn applicable_parameters(&self, parameters: &RowData) -> RowData {
        parameters
            .iter()
            .filter(|(k, _)| self.filter_columns.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Produces the statements that create and maintain a tracking table.
pub trait TrackingTableBuilder: Send + Sync {
    /// The layout being built.
    fn tracking(&self) -> &TrackingTable;

    /// Create the tracking table if it does not exist.
    fn create_table_script(&self) -> String;

    /// Create the key mirroring the base table's primary key.
    fn create_pk_script(&self) -> String;

    /// Seed tracking rows for base rows that have none, at version 0.
    fn populate_script(&self) -> String;

    /// Add one filter column to an existing tracking table.
    fn add_column_script(&self, column: &Column) -> String;

    /// Copy a newly added filter column's values from the base table.
    fn backfill_column_script(&self, column: &Column) -> String;

    /// Change-capture triggers on the base table, if the dialect has them.
    fn create_triggers_script(&self) -> Vec<String> {
        Vec::new()
    }

    fn drop_triggers_script(&self) -> Vec<String> {
        Vec::new()
    }

    /// Remove the triggers and the tracking table.
    fn drop_script(&self) -> Vec<String>;

    /// Statements bringing the tracking table to the current layout.
    ///
    /// `existing_columns` is `None` when the tracking table does not exist yet.
    /// For an existing table only missing filter columns are added; nothing is
    /// dropped or rebuilt.
    fn provision_script(&self, existing_columns: Option<&[ColumnName]>) -> Vec<String> {
        let mut statements = Vec::new();
        match existing_columns {
            None => {
                statements.push(self.create_table_script());
                statements.push(self.create_pk_script());
                statements.push(self.populate_script());
                statements.extend(self.create_triggers_script());
            }
            Some(existing) => {
                let missing: Vec<&Column> = self
                    .tracking()
                    .filter_column_defs()
                    .filter(|c| !existing.contains(&c.name))
                    .collect();
                for column in &missing {
                    statements.push(self.add_column_script(column));
                    statements.push(self.backfill_column_script(column));
                }
                if !missing.is_empty() {
                    statements.extend(self.drop_triggers_script());
                }
                statements.push(self.populate_script());
                statements.extend(self.create_triggers_script());
            }
        }
        statements
    }
}

/// Quote an identifier with double quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Standard SQL rendering of the tracking layout.
///
/// Used for dialect-neutral scripts and by providers without DDL of their own.
/// Standard SQL has no portable trigger syntax, so local change capture is
/// left to the provider.
#[derive(Debug, Clone)]
pub struct AnsiTrackingBuilder {
    tracking: TrackingTable,
}

impl AnsiTrackingBuilder {
    pub fn new(tracking: TrackingTable) -> Self {
        Self { tracking }
    }

    fn type_name(column: &Column) -> String {
        match column.column_type {
            ColumnType::Bool => "BOOLEAN".into(),
            ColumnType::Int32 => "INTEGER".into(),
            ColumnType::Int64 => "BIGINT".into(),
            ColumnType::Double => "DOUBLE PRECISION".into(),
            ColumnType::Decimal => match (column.precision, column.scale) {
                (Some(p), Some(s)) => format!("DECIMAL({}, {})", p, s),
                (Some(p), None) => format!("DECIMAL({})", p),
                _ => "DECIMAL".into(),
            },
            ColumnType::String => match column.max_length {
                Some(n) => format!("VARCHAR({})", n),
                None => "VARCHAR(4000)".into(),
            },
            ColumnType::FixedString => format!("CHAR({})", column.max_length.unwrap_or(1)),
            ColumnType::Guid => "CHAR(36)".into(),
            ColumnType::DateTime => "TIMESTAMP".into(),
            ColumnType::Json => "CLOB".into(),
        }
    }

    fn key_join(&self, left: &str, right: &str) -> String {
        self.tracking
            .schema
            .primary_key
            .iter()
            .map(|k| {
                let k = quote_identifier(k);
                format!("{}.{} = {}.{}", left, k, right, k)
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

impl TrackingTableBuilder for AnsiTrackingBuilder {
    fn tracking(&self) -> &TrackingTable {
        &self.tracking
    }

    fn create_table_script(&self) -> String {
        let mut columns: Vec<String> = self
            .tracking
            .schema
            .key_columns()
            .map(|c| format!("{} {} NOT NULL", quote_identifier(&c.name), Self::type_name(c)))
            .collect();
        columns.push(format!("{} BIGINT NOT NULL", quote_identifier(CREATE_TIMESTAMP)));
        columns.push(format!("{} BIGINT NOT NULL", quote_identifier(UPDATE_TIMESTAMP)));
        columns.push(format!("{} CHAR(36) NULL", quote_identifier(CREATE_SCOPE_ID)));
        columns.push(format!("{} CHAR(36) NULL", quote_identifier(UPDATE_SCOPE_ID)));
        columns.push(format!(
            "{} BOOLEAN NOT NULL DEFAULT FALSE",
            quote_identifier(IS_TOMBSTONE)
        ));
        columns.extend(
            self.tracking
                .filter_column_defs()
                .map(|c| format!("{} {} NULL", quote_identifier(&c.name), Self::type_name(c))),
        );

        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            quote_identifier(&self.tracking.name()),
            columns.join(",\n    ")
        )
    }

    fn create_pk_script(&self) -> String {
        let table = self.tracking.name();
        let keys: Vec<String> = self
            .tracking
            .schema
            .primary_key
            .iter()
            .map(|k| quote_identifier(k))
            .collect();
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
            quote_identifier(&table),
            quote_identifier(&format!("PK_{}", table)),
            keys.join(", ")
        )
    }

    fn populate_script(&self) -> String {
        let keys: Vec<String> = self
            .tracking
            .schema
            .primary_key
            .iter()
            .map(|k| quote_identifier(k))
            .collect();
        let filters: Vec<String> = self
            .tracking
            .filter_columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect();

        let mut targets = keys.clone();
        targets.extend(METADATA_COLUMNS.iter().map(|c| quote_identifier(c)));
        targets.extend(filters.iter().cloned());

        let mut values: Vec<String> = keys.iter().map(|k| format!("b.{}", k)).collect();
        values.extend(["0", "0", "NULL", "NULL", "FALSE"].map(String::from));
        values.extend(filters.iter().map(|f| format!("b.{}", f)));

        format!(
            "INSERT INTO {tracking} ({targets})\nSELECT {values}\nFROM {base} b\nWHERE NOT EXISTS (SELECT 1 FROM {tracking} t WHERE {join})",
            tracking = quote_identifier(&self.tracking.name()),
            base = quote_identifier(self.tracking.base_name()),
            targets = targets.join(", "),
            values = values.join(", "),
            join = self.key_join("t", "b"),
        )
    }

    fn add_column_script(&self, column: &Column) -> String {
        format!(
            "ALTER TABLE {} ADD {} {} NULL",
            quote_identifier(&self.tracking.name()),
            quote_identifier(&column.name),
            Self::type_name(column)
        )
    }

    fn backfill_column_script(&self, column: &Column) -> String {
        let tracking = quote_identifier(&self.tracking.name());
        let col = quote_identifier(&column.name);
        format!(
            "UPDATE {tracking} SET {col} = (SELECT b.{col} FROM {base} b WHERE {join})",
            base = quote_identifier(self.tracking.base_name()),
            join = self.key_join("b", &tracking),
        )
    }

    fn drop_script(&self) -> Vec<String> {
        vec![format!(
            "DROP TABLE {}",
            quote_identifier(&self.tracking.name())
        )]
    }
}
