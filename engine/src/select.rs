//! Change selection.

use crate::{
    error::Result,
    provider::{ChangeQuery, SyncTransaction},
    ChangeBatch, ChangeKind, RowChange, RowData, ScopeId, ScopeInfo, TableChanges, TrackingTable,
    Version,
};

/// Selects the changes a peer has not seen yet from one participant.
pub struct ChangeSelector<'a> {
    tables: &'a [TrackingTable],
    parameters: &'a RowData,
}

impl<'a> ChangeSelector<'a> {
    /// Select over `tables` (in scope order), restricted by `parameters`.
    pub fn new(tables: &'a [TrackingTable], parameters: &'a RowData) -> Self {
        Self { tables, parameters }
    }

    /// Select every change after `since` not last written on behalf of
    /// `exclude`.
    ///
    /// The batch watermark is the clock value read in the same transaction,
    /// so every selected change is at or below it and every later change is
    /// above it.
    pub async fn select(
        &self,
        tx: &mut dyn SyncTransaction,
        scope: &ScopeInfo,
        since: Option<Version>,
        exclude: Option<ScopeId>,
    ) -> Result<ChangeBatch> {
        let watermark = tx.current_version().await?;
        let mut batch = ChangeBatch::new(scope.name.clone(), scope.scope_id, since, watermark);

        for tracking in self.tables {
            let parameters = tracking.applicable_parameters(self.parameters);
            let query = ChangeQuery {
                since,
                exclude_scope: exclude,
                parameters: &parameters,
            };

            let mut table = TableChanges::new(tracking.base_name().clone());
            for (row, data) in tx.select_changes(tracking, &query).await? {
                let kind = ChangeKind::of(&row, since);
                let data = if row.is_tombstone { None } else { data };
                if kind != ChangeKind::Delete && data.is_none() {
                    tracing::warn!(
                        table = %tracking.base_name(),
                        key = %row.key,
                        "tracking row has no base row, skipping"
                    );
                    continue;
                }
                table.changes.push(RowChange::new(row, kind, data));
            }

            tracing::debug!(
                table = %table.table,
                changes = table.changes.len(),
                ?since,
                watermark,
                "selected changes"
            );
            batch.tables.push(table);
        }

        Ok(batch)
    }
}
