//! Change application and conflict routing.
//!
//! # Algorithm
//!
//! For every incoming change, look up the local tracking row by key:
//!
//! 1. No tracking row: the row is new here, write it.
//! 2. Local row and tombstone flag already equal the incoming change: nothing
//!    to do.
//! 3. Tracking row not modified locally since the version the sender knows
//!    of: the remote change is strictly newer, overwrite.
//! 4. Otherwise both sides changed the row: build a [`Conflict`], ask the
//!    resolver and execute its decision.
//!
//! Every write records the sender as `update_scope_id` and a fresh local
//! version, so the change is not echoed back to the sender and is visible to
//! any other peer.

use crate::{
    error::Result, provider::SyncTransaction, ChangeBatch, ChangeKind, Conflict, ConflictAction,
    ConflictResolver, ConflictType, Error, RowChange, RowData, RowKey, ScopeId, TableName,
    TrackingRow, TrackingTable, Version,
};
use serde::{Deserialize, Serialize};

/// Who sent a batch and what they already know about this participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyContext {
    /// Scope id of the participant applying the batch
    pub local_scope: ScopeId,
    /// Scope id of the participant the batch was selected from
    pub origin: ScopeId,
    /// Local clock value up to which the origin has every local change.
    /// `None` when the origin never received anything from here.
    pub known_by_origin: Option<Version>,
}

/// The three ordered passes over a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApplyPhase {
    Deletes,
    Inserts,
    Updates,
}

impl ApplyPhase {
    pub const ALL: [ApplyPhase; 3] = [ApplyPhase::Deletes, ApplyPhase::Inserts, ApplyPhase::Updates];

    fn kind(self) -> ChangeKind {
        match self {
            ApplyPhase::Deletes => ChangeKind::Delete,
            ApplyPhase::Inserts => ChangeKind::Insert,
            ApplyPhase::Updates => ChangeKind::Update,
        }
    }
}

/// Outcome counts of applying changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyCounts {
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    /// Conflicts detected, whatever their resolution
    pub conflicts: u64,
    /// Changes skipped by a `Continue` decision
    pub skipped: u64,
    /// Changes already present here
    pub unchanged: u64,
}

impl ApplyCounts {
    /// Rows actually written.
    pub fn applied(&self) -> u64 {
        self.inserts + self.updates + self.deletes
    }

    pub fn merge(&mut self, other: &ApplyCounts) {
        self.inserts += other.inserts;
        self.updates += other.updates;
        self.deletes += other.deletes;
        self.conflicts += other.conflicts;
        self.skipped += other.skipped;
        self.unchanged += other.unchanged;
    }

    fn add(&mut self, kind: ChangeKind) {
        match kind {
            ChangeKind::Insert => self.inserts += 1,
            ChangeKind::Update => self.updates += 1,
            ChangeKind::Delete => self.deletes += 1,
        }
    }
}

/// A conflict and the decision taken on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub table: TableName,
    pub key: RowKey,
    pub conflict_type: ConflictType,
    pub action: ConflictAction,
}

/// Result of applying a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    pub counts: ApplyCounts,
    pub conflicts: Vec<ConflictRecord>,
}

/// Applies change batches to one participant.
pub struct ChangeApplier<'a> {
    tables: &'a [TrackingTable],
    resolver: &'a dyn ConflictResolver,
}

impl<'a> ChangeApplier<'a> {
    /// `tables` are the local tracking layouts, in scope order.
    pub fn new(tables: &'a [TrackingTable], resolver: &'a dyn ConflictResolver) -> Self {
        Self { tables, resolver }
    }

    /// Check a batch can be applied here.
    pub fn check(&self, batch: &ChangeBatch) -> Result<()> {
        batch.validate()?;
        for table in &batch.tables {
            if self.tracking(&table.table).is_none() {
                return Err(Error::InvalidBatch(format!(
                    "table {} is not part of scope {}",
                    table.table, batch.scope_name
                )));
            }
        }
        Ok(())
    }

    /// Apply the whole batch: deletes, then inserts, then updates.
    pub async fn apply(
        &self,
        tx: &mut dyn SyncTransaction,
        batch: &ChangeBatch,
        ctx: ApplyContext,
    ) -> Result<ApplyResult> {
        self.check(batch)?;
        let mut result = ApplyResult::default();
        for phase in ApplyPhase::ALL {
            self.apply_phase(tx, batch, ctx, phase, &mut result).await?;
        }
        Ok(result)
    }

    /// Apply the changes of one phase, accumulating into `result`.
    ///
    /// Deletes run over tables in reverse scope order so children go before
    /// parents; inserts and updates run in scope order.
    pub async fn apply_phase(
        &self,
        tx: &mut dyn SyncTransaction,
        batch: &ChangeBatch,
        ctx: ApplyContext,
        phase: ApplyPhase,
        result: &mut ApplyResult,
    ) -> Result<()> {
        let ordered: Vec<&TrackingTable> = match phase {
            ApplyPhase::Deletes => self.tables.iter().rev().collect(),
            _ => self.tables.iter().collect(),
        };

        for tracking in ordered {
            let Some(changes) = batch.table(tracking.base_name()) else {
                continue;
            };
            for change in changes.changes.iter().filter(|c| c.kind == phase.kind()) {
                self.apply_change(tx, tracking, change, ctx, result).await?;
            }
        }
        Ok(())
    }

    fn tracking(&self, table: &str) -> Option<&TrackingTable> {
        self.tables.iter().find(|t| t.base_name() == table)
    }

    async fn apply_change(
        &self,
        tx: &mut dyn SyncTransaction,
        tracking: &TrackingTable,
        change: &RowChange,
        ctx: ApplyContext,
        result: &mut ApplyResult,
    ) -> Result<()> {
        let key = &change.tracking.key;
        if let Some(row) = &change.row {
            tracking.schema.validate_row(row)?;
            if tracking.schema.key_of(row)? != *key {
                return Err(Error::InvalidBatch(format!(
                    "row key does not match tracking key {} on {}",
                    key,
                    tracking.base_name()
                )));
            }
        }

        let Some(local) = tx.read_tracking(tracking, key).await? else {
            return write_remote(tx, tracking, change, None, ctx, result).await;
        };

        let local_row = if local.is_tombstone {
            None
        } else {
            tx.read_row(&tracking.schema, key).await?
        };

        // Same state on both sides, e.g. a change that already arrived here
        // through a third participant.
        if local.is_tombstone == change.is_delete() && local_row == change.row {
            result.counts.unchanged += 1;
            return Ok(());
        }

        let known = ctx.known_by_origin.unwrap_or(0);
        if !local.changed_since(known, ctx.origin) {
            return write_remote(tx, tracking, change, Some(local), ctx, result).await;
        }

        let local_kind = match &local_row {
            None => ChangeKind::Delete,
            Some(_) if local.create_timestamp > known => ChangeKind::Insert,
            Some(_) => ChangeKind::Update,
        };

        let conflict = Conflict {
            table: tracking.base_name().clone(),
            conflict_type: ConflictType::classify(local_kind, change.kind),
            local_change: RowChange::new(local.clone(), local_kind, local_row),
            remote_change: change.clone(),
        };
        let action = self.resolver.resolve(&conflict);

        tracing::debug!(
            table = %conflict.table,
            key = %key,
            conflict_type = %conflict.conflict_type,
            ?action,
            "resolved conflict"
        );
        result.counts.conflicts += 1;
        result.conflicts.push(ConflictRecord {
            table: conflict.table.clone(),
            key: key.clone(),
            conflict_type: conflict.conflict_type,
            action: action.clone(),
        });

        match action {
            ConflictAction::ApplyRemote => {
                write_remote(tx, tracking, change, Some(local), ctx, result).await
            }
            ConflictAction::KeepLocal => Ok(()),
            ConflictAction::Continue => {
                result.counts.skipped += 1;
                Ok(())
            }
            ConflictAction::Rollback => {
                tracing::warn!(
                    table = %conflict.table,
                    key = %key,
                    conflict_type = %conflict.conflict_type,
                    "conflict resolver requested rollback"
                );
                Err(Error::ConflictUnresolved {
                    table: conflict.table,
                    key: key.to_string(),
                    conflict_type: conflict.conflict_type,
                })
            }
            ConflictAction::Merge(row) => write_merged(tx, tracking, local, &row, result).await,
        }
    }
}

/// Scope ids in a batch are relative to the sender: `None` means the sender.
fn translate_scope(id: Option<ScopeId>, ctx: ApplyContext) -> Option<ScopeId> {
    match id {
        None => Some(ctx.origin),
        Some(id) if id == ctx.local_scope => None,
        Some(id) => Some(id),
    }
}

async fn write_remote(
    tx: &mut dyn SyncTransaction,
    tracking: &TrackingTable,
    change: &RowChange,
    local: Option<TrackingRow>,
    ctx: ApplyContext,
    result: &mut ApplyResult,
) -> Result<()> {
    let key = &change.tracking.key;
    let filter_values = match &change.row {
        Some(row) => {
            tx.write_row(&tracking.schema, row).await?;
            tracking.filter_values(row)
        }
        None => {
            tx.delete_row(&tracking.schema, key).await?;
            RowData::new()
        }
    };

    let version = tx.next_version().await?;
    let row = match local {
        Some(mut row) => {
            let revived = row.is_tombstone && !change.is_delete();
            row.mark_applied(version, Some(ctx.origin), change.is_delete(), filter_values);
            if revived {
                row.create_timestamp = version;
                row.create_scope_id = translate_scope(change.tracking.create_scope_id, ctx);
            }
            row
        }
        None => TrackingRow {
            key: key.clone(),
            create_timestamp: version,
            update_timestamp: version,
            create_scope_id: translate_scope(change.tracking.create_scope_id, ctx),
            update_scope_id: Some(ctx.origin),
            is_tombstone: change.is_delete(),
            filter_values,
        },
    };
    tx.write_tracking(tracking, &row).await?;

    result.counts.add(change.kind);
    Ok(())
}

async fn write_merged(
    tx: &mut dyn SyncTransaction,
    tracking: &TrackingTable,
    mut local: TrackingRow,
    row: &RowData,
    result: &mut ApplyResult,
) -> Result<()> {
    tracking.schema.validate_row(row)?;
    if tracking.schema.key_of(row)? != local.key {
        return Err(Error::InvalidRow {
            table: tracking.base_name().clone(),
            reason: format!("merged row changes the key {}", local.key),
        });
    }

    tx.write_row(&tracking.schema, row).await?;
    let version = tx.next_version().await?;
    if local.is_tombstone {
        local.create_timestamp = version;
        local.create_scope_id = None;
    }
    local.mark_local_update(version, tracking.filter_values(row));
    tx.write_tracking(tracking, &local).await?;

    result.counts.updates += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::MemoryProvider, provider::SyncProvider, Column, ColumnType, DefaultResolver,
        TableChanges, TableSchema,
    };
    use serde_json::{json, Value};
    use uuid::Uuid;

    fn schema() -> TableSchema {
        TableSchema::new(
            "Products",
            vec![
                Column::required("Id", ColumnType::Int32),
                Column::nullable("name", ColumnType::String),
            ],
            vec!["Id"],
        )
    }

    fn row(value: Value) -> RowData {
        value.as_object().cloned().unwrap()
    }

    async fn provider() -> (MemoryProvider, Vec<TrackingTable>) {
        let provider = MemoryProvider::new("local");
        provider.create_table(schema()).await.unwrap();
        let tracking = TrackingTable::new(schema(), vec![]).unwrap();
        let mut tx = provider.begin().await.unwrap();
        tx.ensure_tracking(&*provider.tracking_builder(tracking.clone()))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        (provider, vec![tracking])
    }

    fn remote_change(id: i64, name: &str, kind: ChangeKind, version: Version) -> RowChange {
        let key = RowKey::new(vec![json!(id)]);
        let mut tracking = TrackingRow::local_insert(key, version, RowData::new());
        if kind == ChangeKind::Update {
            tracking.create_timestamp = 1;
        }
        let data = match kind {
            ChangeKind::Delete => {
                tracking.is_tombstone = true;
                None
            }
            _ => Some(row(json!({"Id": id, "name": name}))),
        };
        RowChange::new(tracking, kind, data)
    }

    fn batch(origin: ScopeId, changes: Vec<RowChange>) -> ChangeBatch {
        let watermark = changes
            .iter()
            .map(|c| c.tracking.update_timestamp)
            .max()
            .unwrap_or(0);
        let mut batch = ChangeBatch::new("DefaultScope", origin, Some(0), watermark);
        let mut table = TableChanges::new("Products");
        table.changes = changes;
        batch.tables.push(table);
        batch
    }

    fn context(origin: ScopeId, known: Option<Version>) -> ApplyContext {
        ApplyContext {
            local_scope: Uuid::new_v4(),
            origin,
            known_by_origin: known,
        }
    }

    #[tokio::test]
    async fn new_rows_are_inserted_with_origin() {
        let (provider, tables) = provider().await;
        let origin = Uuid::new_v4();
        let resolver = DefaultResolver::new();
        let applier = ChangeApplier::new(&tables, &resolver);

        let batch = batch(origin, vec![remote_change(1, "A", ChangeKind::Insert, 3)]);
        let mut tx = provider.begin().await.unwrap();
        let result = applier.apply(&mut *tx, &batch, context(origin, None)).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(result.counts.inserts, 1);
        let tracking = provider.tracking_rows("Products").await;
        assert_eq!(tracking[0].update_scope_id, Some(origin));
        assert_eq!(tracking[0].create_scope_id, Some(origin));
        assert_eq!(provider.rows("Products").await.len(), 1);
    }

    #[tokio::test]
    async fn applying_twice_is_a_no_op() {
        let (provider, tables) = provider().await;
        let origin = Uuid::new_v4();
        let resolver = DefaultResolver::new();
        let applier = ChangeApplier::new(&tables, &resolver);
        let batch = batch(origin, vec![remote_change(1, "A", ChangeKind::Insert, 3)]);

        let mut tx = provider.begin().await.unwrap();
        applier.apply(&mut *tx, &batch, context(origin, None)).await.unwrap();
        let before = provider_state(&mut *tx, &tables[0]).await;
        let again = applier.apply(&mut *tx, &batch, context(origin, None)).await.unwrap();
        let after = provider_state(&mut *tx, &tables[0]).await;
        tx.commit().await.unwrap();

        assert_eq!(again.counts.unchanged, 1);
        assert_eq!(again.counts.applied(), 0);
        assert_eq!(before, after);
    }

    async fn provider_state(
        tx: &mut dyn SyncTransaction,
        tracking: &TrackingTable,
    ) -> Vec<(TrackingRow, Option<RowData>)> {
        let params = RowData::new();
        let query = crate::provider::ChangeQuery {
            since: Some(0),
            exclude_scope: None,
            parameters: &params,
        };
        tx.select_changes(tracking, &query).await.unwrap()
    }

    #[tokio::test]
    async fn local_edit_after_known_version_is_a_conflict() {
        let (provider, tables) = provider().await;
        provider.insert("Products", row(json!({"Id": 1, "name": "local"}))).await.unwrap();
        let origin = Uuid::new_v4();

        let resolver = DefaultResolver::new();
        let applier = ChangeApplier::new(&tables, &resolver);
        let batch = batch(origin, vec![remote_change(1, "remote", ChangeKind::Update, 4)]);

        let mut tx = provider.begin().await.unwrap();
        let result = applier.apply(&mut *tx, &batch, context(origin, Some(0))).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(result.counts.conflicts, 1);
        assert_eq!(
            result.conflicts[0].conflict_type,
            ConflictType::LocalUpdateRemoteUpdate
        );
        assert_eq!(
            provider.get("Products", &RowKey::new(vec![json!(1)])).await.unwrap()["name"],
            "remote"
        );
    }

    #[tokio::test]
    async fn identical_local_and_remote_state_is_not_a_conflict() {
        let (provider, tables) = provider().await;
        provider.insert("Products", row(json!({"Id": 1, "name": "same"}))).await.unwrap();
        provider.insert("Products", row(json!({"Id": 2, "name": "gone"}))).await.unwrap();
        provider.delete("Products", &RowKey::new(vec![json!(2)])).await.unwrap();
        let origin = Uuid::new_v4();

        let resolver = |_: &Conflict| ConflictAction::Rollback;
        let applier = ChangeApplier::new(&tables, &resolver);
        let batch = batch(
            origin,
            vec![
                remote_change(1, "same", ChangeKind::Insert, 4),
                remote_change(2, "gone", ChangeKind::Delete, 5),
            ],
        );

        let mut tx = provider.begin().await.unwrap();
        let result = applier.apply(&mut *tx, &batch, context(origin, Some(0))).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(result.counts.conflicts, 0);
        assert_eq!(result.counts.unchanged, 2);
        assert_eq!(result.counts.applied(), 0);
    }

    #[tokio::test]
    async fn edit_the_origin_already_knows_is_overwritten() {
        let (provider, tables) = provider().await;
        provider.insert("Products", row(json!({"Id": 1, "name": "local"}))).await.unwrap();
        let origin = Uuid::new_v4();

        let resolver = |_: &Conflict| ConflictAction::Rollback;
        let applier = ChangeApplier::new(&tables, &resolver);
        let batch = batch(origin, vec![remote_change(1, "remote", ChangeKind::Update, 4)]);

        let mut tx = provider.begin().await.unwrap();
        let result = applier.apply(&mut *tx, &batch, context(origin, Some(1))).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(result.counts.conflicts, 0);
        assert_eq!(result.counts.updates, 1);
    }

    #[tokio::test]
    async fn remote_update_of_locally_deleted_row_rolls_back_by_default() {
        let (provider, tables) = provider().await;
        provider.insert("Products", row(json!({"Id": 1, "name": "A"}))).await.unwrap();
        provider.delete("Products", &RowKey::new(vec![json!(1)])).await.unwrap();
        let origin = Uuid::new_v4();

        let resolver = DefaultResolver::new();
        let applier = ChangeApplier::new(&tables, &resolver);
        let batch = batch(origin, vec![remote_change(1, "B", ChangeKind::Update, 6)]);

        let mut tx = provider.begin().await.unwrap();
        let err = applier
            .apply(&mut *tx, &batch, context(origin, Some(0)))
            .await
            .unwrap_err();
        tx.rollback().await.unwrap();

        assert!(matches!(
            err,
            Error::ConflictUnresolved {
                conflict_type: ConflictType::LocalNoRowRemoteUpdate,
                ..
            }
        ));
        assert!(provider.rows("Products").await.is_empty());
    }

    #[tokio::test]
    async fn continue_skips_only_the_conflicting_row() {
        let (provider, tables) = provider().await;
        provider.insert("Products", row(json!({"Id": 1, "name": "local"}))).await.unwrap();
        let origin = Uuid::new_v4();

        let resolver = |_: &Conflict| ConflictAction::Continue;
        let applier = ChangeApplier::new(&tables, &resolver);
        let batch = batch(
            origin,
            vec![
                remote_change(1, "remote", ChangeKind::Insert, 4),
                remote_change(2, "other", ChangeKind::Insert, 5),
            ],
        );

        let mut tx = provider.begin().await.unwrap();
        let result = applier.apply(&mut *tx, &batch, context(origin, None)).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(result.counts.skipped, 1);
        assert_eq!(result.counts.inserts, 1);
        assert_eq!(
            result.conflicts[0].conflict_type,
            ConflictType::LocalInsertRemoteInsert
        );
        assert_eq!(
            provider.get("Products", &RowKey::new(vec![json!(1)])).await.unwrap()["name"],
            "local"
        );
    }

    #[tokio::test]
    async fn merge_writes_a_local_change() {
        let (provider, tables) = provider().await;
        provider.insert("Products", row(json!({"Id": 1, "name": "local"}))).await.unwrap();
        let origin = Uuid::new_v4();

        let resolver = |c: &Conflict| {
            let mut merged = c.remote_change.row.clone().unwrap_or_default();
            merged.insert("name".into(), json!("merged"));
            ConflictAction::Merge(merged)
        };
        let applier = ChangeApplier::new(&tables, &resolver);
        let batch = batch(origin, vec![remote_change(1, "remote", ChangeKind::Update, 4)]);

        let mut tx = provider.begin().await.unwrap();
        applier.apply(&mut *tx, &batch, context(origin, Some(0))).await.unwrap();
        tx.commit().await.unwrap();

        let tracking = provider.tracking_rows("Products").await;
        assert!(tracking[0].is_local());
        assert_eq!(
            provider.get("Products", &RowKey::new(vec![json!(1)])).await.unwrap()["name"],
            "merged"
        );
    }

    #[tokio::test]
    async fn remote_delete_keeps_a_tombstone() {
        let (provider, tables) = provider().await;
        let origin = Uuid::new_v4();
        let resolver = DefaultResolver::new();
        let applier = ChangeApplier::new(&tables, &resolver);

        let mut tx = provider.begin().await.unwrap();
        let insert = batch(origin, vec![remote_change(1, "A", ChangeKind::Insert, 2)]);
        applier.apply(&mut *tx, &insert, context(origin, None)).await.unwrap();
        let delete = batch(origin, vec![remote_change(1, "", ChangeKind::Delete, 5)]);
        let result = applier.apply(&mut *tx, &delete, context(origin, None)).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(result.counts.deletes, 1);
        assert!(provider.rows("Products").await.is_empty());
        let tracking = provider.tracking_rows("Products").await;
        assert!(tracking[0].is_tombstone);
        assert_eq!(tracking[0].update_scope_id, Some(origin));
    }

    #[tokio::test]
    async fn batches_for_unknown_tables_are_rejected() {
        let (_, tables) = provider().await;
        let resolver = DefaultResolver::new();
        let applier = ChangeApplier::new(&tables, &resolver);
        let mut batch = batch(Uuid::new_v4(), vec![]);
        batch.tables.push(TableChanges::new("Orders"));
        assert!(matches!(applier.check(&batch), Err(Error::InvalidBatch(_))));
    }
}
