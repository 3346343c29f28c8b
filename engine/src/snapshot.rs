//! Snapshot of an in-memory participant.
//!
//! Snapshots hold everything a [`MemoryProvider`](crate::MemoryProvider)
//! stores: base tables, tracking tables, clock and scope metadata. They use
//! `BTreeMap`s throughout so serialization is deterministic, which lets tests
//! compare whole participants byte for byte.

use crate::{
    error::Result, ColumnName, Error, LogicalClock, PeerScope, RowData, ScopeId, ScopeInfo,
    ScopeName, TableName, TableSchema, TrackingRow,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Tracking table of one base table, keyed by encoded row key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingState {
    pub filter_columns: Vec<ColumnName>,
    pub rows: BTreeMap<String, TrackingRow>,
}

/// One base table with its rows keyed by encoded row key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableState {
    pub schema: TableSchema,
    pub rows: BTreeMap<String, RowData>,
    /// `None` until the table is provisioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking: Option<TrackingState>,
}

impl TableState {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: BTreeMap::new(),
            tracking: None,
        }
    }
}

/// A point-in-time snapshot of one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// The participant's clock
    pub clock: LogicalClock,
    pub tables: BTreeMap<TableName, TableState>,
    pub scopes: BTreeMap<ScopeName, ScopeInfo>,
    /// Peer watermarks, by scope then peer id
    pub peers: BTreeMap<ScopeName, BTreeMap<ScopeId, PeerScope>>,
}

impl Default for StoreSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreSnapshot {
    /// Create a new empty snapshot.
    pub fn new() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            clock: LogicalClock::new(),
            tables: BTreeMap::new(),
            scopes: BTreeMap::new(),
            peers: BTreeMap::new(),
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableState> {
        self.tables.get(name)
    }

    pub fn table_mut(&mut self, name: &str) -> Result<&mut TableState> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    /// Check rows against their schemas and tracking rows against base rows.
    pub fn validate(&self) -> Result<()> {
        for (name, table) in &self.tables {
            if &table.schema.name != name {
                return Err(Error::InvalidSnapshot(format!(
                    "table {} is stored under {}",
                    table.schema.name, name
                )));
            }
            table.schema.validate()?;
            for row in table.rows.values() {
                table.schema.validate_row(row)?;
            }

            let Some(tracking) = &table.tracking else {
                continue;
            };
            for (key, row) in &tracking.rows {
                if row.is_live() != table.rows.contains_key(key) {
                    return Err(Error::InvalidSnapshot(format!(
                        "tracking row {} on {} does not match the base table",
                        key, name
                    )));
                }
            }
            if let Some(untracked) = table.rows.keys().find(|k| !tracking.rows.contains_key(*k)) {
                return Err(Error::InvalidSnapshot(format!(
                    "row {} on {} has no tracking row",
                    untracked, name
                )));
            }
        }
        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}
