//! Storage capability boundary.
//!
//! A [`SyncProvider`] abstracts one backing store. Everything the engine does to
//! a participant goes through a [`SyncTransaction`] obtained from
//! [`SyncProvider::begin`], so a session either commits all of its reads and
//! writes on that participant or none of them.

use crate::{
    error::Result, scope::ScopeLocks, ColumnName, PeerScope, RowData, RowKey, ScopeId, ScopeInfo,
    TableSchema, TrackingRow, TrackingTable, TrackingTableBuilder, Version,
};
use async_trait::async_trait;

/// Parameters of one change selection.
#[derive(Debug, Clone, Copy)]
pub struct ChangeQuery<'a> {
    /// Only rows changed after this version. `None` selects every live row.
    pub since: Option<Version>,
    /// Rows last written on behalf of this participant are left out.
    pub exclude_scope: Option<ScopeId>,
    /// Required filter column values.
    pub parameters: &'a RowData,
}

impl ChangeQuery<'_> {
    /// Whether a tracking row belongs in the selection.
    ///
    /// Backends that filter natively must select exactly the rows this accepts.
    pub fn matches(&self, tracking: &TrackingTable, row: &TrackingRow) -> bool {
        let in_window = match self.since {
            Some(since) => row.update_timestamp > since,
            None => row.is_live(),
        };
        let foreign = match (self.exclude_scope, row.update_scope_id) {
            (Some(excluded), Some(writer)) => excluded != writer,
            _ => true,
        };
        in_window && foreign && tracking.matches_filters(&row.filter_values, self.parameters)
    }
}

/// An open transaction on one participant.
///
/// Dropping a transaction without committing discards its writes.
#[async_trait]
pub trait SyncTransaction: Send {
    /// Introspect a base table.
    async fn table_schema(&mut self, table: &str) -> Result<TableSchema>;

    /// Run DDL or DML statements in order.
    async fn execute(&mut self, statements: &[String]) -> Result<()>;

    /// Columns of an existing tracking table, or `None` if it does not exist.
    async fn tracking_columns(&mut self, tracking: &TrackingTable)
        -> Result<Option<Vec<ColumnName>>>;

    /// Create or upgrade the tracking table described by `builder`.
    async fn ensure_tracking(&mut self, builder: &dyn TrackingTableBuilder) -> Result<()> {
        let existing = self.tracking_columns(builder.tracking()).await?;
        let statements = builder.provision_script(existing.as_deref());
        self.execute(&statements).await
    }

    /// Remove the tracking table and its triggers.
    async fn drop_tracking(&mut self, builder: &dyn TrackingTableBuilder) -> Result<()> {
        self.execute(&builder.drop_script()).await
    }

    async fn load_scope(&mut self, name: &str) -> Result<Option<ScopeInfo>>;

    async fn save_scope(&mut self, scope: &ScopeInfo) -> Result<()>;

    async fn load_peer(&mut self, scope: &str, peer: ScopeId) -> Result<Option<PeerScope>>;

    async fn save_peer(&mut self, peer: &PeerScope) -> Result<()>;

    async fn list_peers(&mut self, scope: &str) -> Result<Vec<PeerScope>>;

    /// Last version handed out by this participant's clock.
    async fn current_version(&mut self) -> Result<Version>;

    /// Tick the clock and return the new version.
    async fn next_version(&mut self) -> Result<Version>;

    async fn read_tracking(
        &mut self,
        tracking: &TrackingTable,
        key: &RowKey,
    ) -> Result<Option<TrackingRow>>;

    async fn read_row(&mut self, schema: &TableSchema, key: &RowKey) -> Result<Option<RowData>>;

    /// Insert or replace a base row without touching its tracking row.
    async fn write_row(&mut self, schema: &TableSchema, row: &RowData) -> Result<()>;

    /// Delete a base row if present, without touching its tracking row.
    async fn delete_row(&mut self, schema: &TableSchema, key: &RowKey) -> Result<()>;

    /// Insert or replace a tracking row.
    async fn write_tracking(&mut self, tracking: &TrackingTable, row: &TrackingRow) -> Result<()>;

    /// Tracking rows accepted by `query`, each with its live base row, ordered
    /// by `update_timestamp` then key.
    async fn select_changes(
        &mut self,
        tracking: &TrackingTable,
        query: &ChangeQuery<'_>,
    ) -> Result<Vec<(TrackingRow, Option<RowData>)>>;

    /// Delete tombstones at or below `upto`. Returns how many were removed.
    async fn purge_tombstones(&mut self, tracking: &TrackingTable, upto: Version) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// One backing store taking part in synchronization.
#[async_trait]
pub trait SyncProvider: Send + Sync {
    /// Stable name, used for logging and lock ordering.
    fn name(&self) -> &str;

    /// Open a transaction.
    async fn begin(&self) -> Result<Box<dyn SyncTransaction>>;

    /// The dialect's tracking table builder.
    fn tracking_builder(&self, tracking: TrackingTable) -> Box<dyn TrackingTableBuilder>;

    /// Locks serializing sessions per scope on this participant.
    fn scope_locks(&self) -> &ScopeLocks;

    /// Release connections. The provider must not be used afterwards.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
