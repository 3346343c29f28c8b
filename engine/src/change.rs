//! Change batches exchanged between participants.
//!
//! A [`ChangeBatch`] is produced by one selection and consumed by one
//! application. It carries copies of the tracking rows and base rows, never
//! cursors, so it stays valid after the selecting transaction is gone.

use crate::{error::Result, Error, RowData, ScopeId, ScopeName, TableName, TrackingRow, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What happened to a row since the watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    /// Classify a tracking row relative to `since`.
    ///
    /// With no watermark every row is new to the receiver.
    pub fn of(tracking: &TrackingRow, since: Option<Version>) -> Self {
        if tracking.is_tombstone {
            ChangeKind::Delete
        } else {
            match since {
                Some(since) if tracking.create_timestamp <= since => ChangeKind::Update,
                _ => ChangeKind::Insert,
            }
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        })
    }
}

/// One changed row: its tracking metadata plus the current base row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowChange {
    pub tracking: TrackingRow,
    pub kind: ChangeKind,
    /// Base row values; `None` for deletes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<RowData>,
}

impl RowChange {
    pub fn new(tracking: TrackingRow, kind: ChangeKind, row: Option<RowData>) -> Self {
        Self {
            tracking,
            kind,
            row,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.kind == ChangeKind::Delete
    }
}

/// Changes of one table, in selection order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableChanges {
    pub table: TableName,
    pub changes: Vec<RowChange>,
}

impl TableChanges {
    pub fn new(table: impl Into<TableName>) -> Self {
        Self {
            table: table.into(),
            changes: Vec::new(),
        }
    }

    pub fn counts(&self) -> ChangeCounts {
        let mut counts = ChangeCounts::default();
        for change in &self.changes {
            counts.add(change.kind);
        }
        counts
    }
}

/// A self-contained set of changes selected from one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeBatch {
    pub scope_name: ScopeName,
    /// Scope id of the participant the changes were selected from
    pub source: ScopeId,
    /// Watermark the selection started from (`None` = initial synchronization)
    pub since: Option<Version>,
    /// Source clock value at selection time; every selected change is at or below it
    pub watermark: Version,
    /// Per-table changes, in scope table order
    pub tables: Vec<TableChanges>,
}

impl ChangeBatch {
    pub fn new(
        scope_name: impl Into<ScopeName>,
        source: ScopeId,
        since: Option<Version>,
        watermark: Version,
    ) -> Self {
        Self {
            scope_name: scope_name.into(),
            source,
            since,
            watermark,
            tables: Vec::new(),
        }
    }

    /// Total number of row changes.
    pub fn len(&self) -> usize {
        self.tables.iter().map(|t| t.changes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn table(&self, name: &str) -> Option<&TableChanges> {
        self.tables.iter().find(|t| t.table == name)
    }

    /// Per-table and total change counts.
    pub fn summary(&self) -> BatchSummary {
        let mut summary = BatchSummary {
            scope_name: self.scope_name.clone(),
            source: self.source,
            since: self.since,
            watermark: self.watermark,
            tables: BTreeMap::new(),
            total: ChangeCounts::default(),
        };
        for table in &self.tables {
            let counts = table.counts();
            summary.total.merge(&counts);
            summary.tables.insert(table.table.clone(), counts);
        }
        summary
    }

    /// Check the batch is internally consistent before applying it.
    ///
    /// Deletes carry no row, live changes carry one, and no change is newer
    /// than the batch watermark.
    pub fn validate(&self) -> Result<()> {
        for table in &self.tables {
            for change in &table.changes {
                let tracking = &change.tracking;
                if tracking.update_timestamp > self.watermark {
                    return Err(Error::InvalidBatch(format!(
                        "change {} on {} at version {} is past the batch watermark {}",
                        tracking.key, table.table, tracking.update_timestamp, self.watermark
                    )));
                }
                match (change.kind, change.row.is_some(), tracking.is_tombstone) {
                    (ChangeKind::Delete, false, true) => {}
                    (ChangeKind::Insert | ChangeKind::Update, true, false) => {}
                    _ => {
                        return Err(Error::InvalidBatch(format!(
                            "{} change {} on {} has inconsistent payload",
                            change.kind, tracking.key, table.table
                        )))
                    }
                }
            }
        }
        Ok(())
    }
}

/// Counts of inserts, updates and deletes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeCounts {
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
}

impl ChangeCounts {
    pub fn add(&mut self, kind: ChangeKind) {
        match kind {
            ChangeKind::Insert => self.inserts += 1,
            ChangeKind::Update => self.updates += 1,
            ChangeKind::Delete => self.deletes += 1,
        }
    }

    pub fn merge(&mut self, other: &ChangeCounts) {
        self.inserts += other.inserts;
        self.updates += other.updates;
        self.deletes += other.deletes;
    }

    pub fn total(&self) -> u64 {
        self.inserts + self.updates + self.deletes
    }
}

/// Compact description of a batch for progress reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub scope_name: ScopeName,
    pub source: ScopeId,
    pub since: Option<Version>,
    pub watermark: Version,
    pub tables: BTreeMap<TableName, ChangeCounts>,
    pub total: ChangeCounts,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RowKey;
    use serde_json::json;
    use uuid::Uuid;

    fn tracking(id: i64, created: Version, updated: Version, tombstone: bool) -> TrackingRow {
        let mut row = TrackingRow::local_insert(RowKey::new(vec![json!(id)]), created, RowData::new());
        row.update_timestamp = updated;
        row.is_tombstone = tombstone;
        row
    }

    fn row(id: i64) -> Option<RowData> {
        json!({"Id": id, "name": "A"}).as_object().cloned()
    }

    #[test]
    fn change_kind_classification() {
        assert_eq!(ChangeKind::of(&tracking(1, 5, 5, false), Some(3)), ChangeKind::Insert);
        assert_eq!(ChangeKind::of(&tracking(1, 2, 5, false), Some(3)), ChangeKind::Update);
        assert_eq!(ChangeKind::of(&tracking(1, 2, 5, true), Some(3)), ChangeKind::Delete);
        assert_eq!(ChangeKind::of(&tracking(1, 0, 0, false), None), ChangeKind::Insert);
    }

    #[test]
    fn summary_counts_per_table() {
        let mut batch = ChangeBatch::new("DefaultScope", Uuid::new_v4(), Some(0), 9);
        let mut products = TableChanges::new("Products");
        products.changes.push(RowChange::new(tracking(1, 1, 1, false), ChangeKind::Insert, row(1)));
        products.changes.push(RowChange::new(tracking(2, 1, 4, true), ChangeKind::Delete, None));
        batch.tables.push(products);
        batch.tables.push(TableChanges::new("Orders"));

        let summary = batch.summary();
        assert_eq!(batch.len(), 2);
        assert_eq!(summary.total.inserts, 1);
        assert_eq!(summary.total.deletes, 1);
        assert_eq!(summary.tables["Orders"].total(), 0);
        assert!(batch.validate().is_ok());
    }

    #[test]
    fn validation_rejects_inconsistent_changes() {
        let mut batch = ChangeBatch::new("DefaultScope", Uuid::new_v4(), None, 9);
        let mut table = TableChanges::new("Products");
        table.changes.push(RowChange::new(tracking(1, 1, 1, false), ChangeKind::Insert, None));
        batch.tables.push(table);
        assert!(matches!(batch.validate(), Err(Error::InvalidBatch(_))));

        batch.tables[0].changes[0] = RowChange::new(tracking(1, 1, 12, false), ChangeKind::Insert, row(1));
        assert!(matches!(batch.validate(), Err(Error::InvalidBatch(_))));
    }

    #[test]
    fn batch_serializes_without_cursors() {
        let mut batch = ChangeBatch::new("DefaultScope", Uuid::new_v4(), Some(2), 5);
        let mut table = TableChanges::new("Products");
        table.changes.push(RowChange::new(tracking(3, 1, 4, true), ChangeKind::Delete, None));
        batch.tables.push(table);

        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(json["scopeName"], "DefaultScope");
        assert!(json["tables"][0]["changes"][0].get("row").is_none());
        let parsed: ChangeBatch = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, batch);
    }
}
