//! In-memory participant.
//!
//! [`MemoryProvider`] keeps a whole participant in a [`StoreSnapshot`] behind
//! an async mutex. A transaction holds the mutex for its whole life and works
//! on a private copy which replaces the shared state on commit, so readers
//! never observe half-applied batches.
//!
//! Application writes go through [`MemoryProvider::insert`],
//! [`MemoryProvider::update`] and [`MemoryProvider::delete`], which maintain
//! the tracking rows the way change-capture triggers do on a database.

use crate::{
    error::Result,
    provider::{ChangeQuery, SyncProvider, SyncTransaction},
    scope::ScopeLocks,
    snapshot::{StoreSnapshot, TableState, TrackingState},
    AnsiTrackingBuilder, ColumnName, Error, PeerScope, RowData, RowKey, ScopeId, ScopeInfo,
    TableSchema, TrackingRow, TrackingTable, TrackingTableBuilder, Version,
};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A participant held entirely in memory.
pub struct MemoryProvider {
    name: String,
    state: Arc<Mutex<StoreSnapshot>>,
    locks: ScopeLocks,
    fail_row_writes: Arc<AtomicBool>,
}

impl MemoryProvider {
    /// Create an empty participant.
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_snapshot(name, StoreSnapshot::new())
    }

    /// Create a participant from previously exported state.
    pub fn from_snapshot(name: impl Into<String>, snapshot: StoreSnapshot) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(snapshot)),
            locks: ScopeLocks::new(),
            fail_row_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a base table. Existing tables are left untouched.
    pub async fn create_table(&self, schema: TableSchema) -> Result<()> {
        schema.validate()?;
        let mut state = self.state.lock().await;
        state
            .tables
            .entry(schema.name.clone())
            .or_insert_with(|| TableState::new(schema));
        Ok(())
    }

    /// Insert a row as the application would. Returns its key.
    ///
    /// A missing auto-increment key column is assigned the next free value.
    pub async fn insert(&self, table: &str, mut row: RowData) -> Result<RowKey> {
        let mut state = self.state.lock().await;
        let snapshot = &mut *state;
        let table = snapshot
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?;

        assign_auto_increment(table, &mut row);
        table.schema.validate_row(&row)?;
        let key = table.schema.key_of(&row)?;
        let encoded = key.encoded();
        if table.rows.contains_key(&encoded) {
            return Err(Error::InvalidRow {
                table: table.schema.name.clone(),
                reason: format!("duplicate key {}", key),
            });
        }

        if let Some(tracking) = table.tracking.as_mut() {
            let version = snapshot.clock.tick();
            let filters = filter_values(&tracking.filter_columns, &row);
            tracking
                .rows
                .insert(encoded.clone(), TrackingRow::local_insert(key.clone(), version, filters));
        }
        table.rows.insert(encoded, row);
        Ok(key)
    }

    /// Replace an existing row as the application would.
    pub async fn update(&self, table: &str, row: RowData) -> Result<()> {
        let mut state = self.state.lock().await;
        let snapshot = &mut *state;
        let table = snapshot
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?;

        table.schema.validate_row(&row)?;
        let key = table.schema.key_of(&row)?;
        let encoded = key.encoded();
        if !table.rows.contains_key(&encoded) {
            return Err(Error::InvalidRow {
                table: table.schema.name.clone(),
                reason: format!("no row with key {}", key),
            });
        }

        if let Some(tracking) = table.tracking.as_mut() {
            let version = snapshot.clock.tick();
            let filters = filter_values(&tracking.filter_columns, &row);
            let entry = tracking
                .rows
                .entry(encoded.clone())
                .or_insert_with(|| TrackingRow::seeded(key.clone(), RowData::new()));
            entry.mark_local_update(version, filters);
        }
        table.rows.insert(encoded, row);
        Ok(())
    }

    /// Delete a row as the application would. Returns whether it existed.
    pub async fn delete(&self, table: &str, key: &RowKey) -> Result<bool> {
        let mut state = self.state.lock().await;
        let snapshot = &mut *state;
        let table = snapshot
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?;

        let encoded = key.encoded();
        if table.rows.remove(&encoded).is_none() {
            return Ok(false);
        }
        if let Some(tracking) = table.tracking.as_mut() {
            let version = snapshot.clock.tick();
            if let Some(row) = tracking.rows.get_mut(&encoded) {
                row.mark_local_delete(version);
            }
        }
        Ok(true)
    }

    pub async fn get(&self, table: &str, key: &RowKey) -> Option<RowData> {
        let state = self.state.lock().await;
        state.table(table)?.rows.get(&key.encoded()).cloned()
    }

    /// All base rows of a table, in key order.
    pub async fn rows(&self, table: &str) -> Vec<RowData> {
        let state = self.state.lock().await;
        state
            .table(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// All tracking rows of a table, in key order.
    pub async fn tracking_rows(&self, table: &str) -> Vec<TrackingRow> {
        let state = self.state.lock().await;
        state
            .table(table)
            .and_then(|t| t.tracking.as_ref())
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Make every following transaction fail its base row writes.
    pub fn fail_row_writes(&self, fail: bool) {
        self.fail_row_writes.store(fail, Ordering::SeqCst);
    }

    /// Copy the current state.
    pub async fn export_state(&self) -> StoreSnapshot {
        self.state.lock().await.clone()
    }

    /// Replace the current state after validating it.
    pub async fn import_state(&self, snapshot: StoreSnapshot) -> Result<()> {
        snapshot.validate()?;
        *self.state.lock().await = snapshot;
        Ok(())
    }
}

fn filter_values(columns: &[ColumnName], row: &RowData) -> RowData {
    columns
        .iter()
        .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(serde_json::Value::Null)))
        .collect()
}

fn assign_auto_increment(table: &TableState, row: &mut RowData) {
    for column in table.schema.columns.iter().filter(|c| c.auto_increment) {
        if row.get(&column.name).is_some_and(|v| !v.is_null()) {
            continue;
        }
        let next = table
            .rows
            .values()
            .filter_map(|r| r.get(&column.name).and_then(|v| v.as_i64()))
            .max()
            .unwrap_or(0)
            + 1;
        row.insert(column.name.clone(), serde_json::Value::from(next));
    }
}

#[async_trait]
impl SyncProvider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn begin(&self) -> Result<Box<dyn SyncTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            fail_row_writes: self.fail_row_writes.load(Ordering::SeqCst),
        }))
    }

    fn tracking_builder(&self, tracking: TrackingTable) -> Box<dyn TrackingTableBuilder> {
        Box::new(AnsiTrackingBuilder::new(tracking))
    }

    fn scope_locks(&self) -> &ScopeLocks {
        &self.locks
    }
}

/// Transaction over a private copy of the participant's state.
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<StoreSnapshot>,
    working: StoreSnapshot,
    fail_row_writes: bool,
}

impl MemoryTransaction {
    fn check_row_writes(&self) -> Result<()> {
        if self.fail_row_writes {
            return Err(Error::TransientStorage("injected row write failure".into()));
        }
        Ok(())
    }

    fn tracking_state(&mut self, tracking: &TrackingTable) -> Result<&mut TrackingState> {
        self.working
            .table_mut(tracking.base_name())?
            .tracking
            .as_mut()
            .ok_or_else(|| Error::TableNotFound(tracking.name()))
    }
}

#[async_trait]
impl SyncTransaction for MemoryTransaction {
    async fn table_schema(&mut self, table: &str) -> Result<TableSchema> {
        self.working
            .table(table)
            .map(|t| t.schema.clone())
            .ok_or_else(|| Error::TableNotFound(table.to_string()))
    }

    async fn execute(&mut self, statements: &[String]) -> Result<()> {
        if statements.is_empty() {
            return Ok(());
        }
        Err(Error::Unsupported(
            "the in-memory provider does not execute SQL".into(),
        ))
    }

    async fn tracking_columns(
        &mut self,
        tracking: &TrackingTable,
    ) -> Result<Option<Vec<ColumnName>>> {
        let table = self
            .working
            .table(tracking.base_name())
            .ok_or_else(|| Error::TableNotFound(tracking.base_name().clone()))?;
        Ok(table.tracking.as_ref().map(|state| {
            let existing = TrackingTable {
                schema: table.schema.clone(),
                filter_columns: state.filter_columns.clone(),
            };
            existing.column_names()
        }))
    }

    async fn ensure_tracking(&mut self, builder: &dyn TrackingTableBuilder) -> Result<()> {
        let layout = builder.tracking();
        let existing = self.tracking_columns(layout).await?;
        tracing::debug!(
            table = %layout.base_name(),
            script = %builder.provision_script(existing.as_deref()).join(";\n"),
            "provisioning tracking table"
        );

        let table = self.working.table_mut(layout.base_name())?;
        let state = table.tracking.get_or_insert_with(TrackingState::default);

        let added: Vec<ColumnName> = layout
            .filter_columns
            .iter()
            .filter(|c| !state.filter_columns.contains(c))
            .cloned()
            .collect();
        for column in &added {
            for (key, row) in state.rows.iter_mut() {
                let value = table
                    .rows
                    .get(key)
                    .and_then(|r| r.get(column))
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                row.filter_values.insert(column.clone(), value);
            }
        }
        state.filter_columns.extend(added);

        for (key, row) in &table.rows {
            if !state.rows.contains_key(key) {
                let seeded = TrackingRow::seeded(
                    table.schema.key_of(row)?,
                    filter_values(&state.filter_columns, row),
                );
                state.rows.insert(key.clone(), seeded);
            }
        }
        Ok(())
    }

    async fn drop_tracking(&mut self, builder: &dyn TrackingTableBuilder) -> Result<()> {
        self.working
            .table_mut(builder.tracking().base_name())?
            .tracking = None;
        Ok(())
    }

    async fn load_scope(&mut self, name: &str) -> Result<Option<ScopeInfo>> {
        Ok(self.working.scopes.get(name).cloned())
    }

    async fn save_scope(&mut self, scope: &ScopeInfo) -> Result<()> {
        self.working.scopes.insert(scope.name.clone(), scope.clone());
        Ok(())
    }

    async fn load_peer(&mut self, scope: &str, peer: ScopeId) -> Result<Option<PeerScope>> {
        Ok(self
            .working
            .peers
            .get(scope)
            .and_then(|peers| peers.get(&peer))
            .cloned())
    }

    async fn save_peer(&mut self, peer: &PeerScope) -> Result<()> {
        self.working
            .peers
            .entry(peer.scope_name.clone())
            .or_default()
            .insert(peer.peer_id, peer.clone());
        Ok(())
    }

    async fn list_peers(&mut self, scope: &str) -> Result<Vec<PeerScope>> {
        Ok(self
            .working
            .peers
            .get(scope)
            .map(|peers| peers.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn current_version(&mut self) -> Result<Version> {
        Ok(self.working.clock.current())
    }

    async fn next_version(&mut self) -> Result<Version> {
        Ok(self.working.clock.tick())
    }

    async fn read_tracking(
        &mut self,
        tracking: &TrackingTable,
        key: &RowKey,
    ) -> Result<Option<TrackingRow>> {
        Ok(self.tracking_state(tracking)?.rows.get(&key.encoded()).cloned())
    }

    async fn read_row(&mut self, schema: &TableSchema, key: &RowKey) -> Result<Option<RowData>> {
        Ok(self
            .working
            .table(&schema.name)
            .ok_or_else(|| Error::TableNotFound(schema.name.clone()))?
            .rows
            .get(&key.encoded())
            .cloned())
    }

    async fn write_row(&mut self, schema: &TableSchema, row: &RowData) -> Result<()> {
        self.check_row_writes()?;
        let key = schema.key_of(row)?;
        self.working
            .table_mut(&schema.name)?
            .rows
            .insert(key.encoded(), row.clone());
        Ok(())
    }

    async fn delete_row(&mut self, schema: &TableSchema, key: &RowKey) -> Result<()> {
        self.check_row_writes()?;
        self.working
            .table_mut(&schema.name)?
            .rows
            .remove(&key.encoded());
        Ok(())
    }

    async fn write_tracking(&mut self, tracking: &TrackingTable, row: &TrackingRow) -> Result<()> {
        self.tracking_state(tracking)?
            .rows
            .insert(row.key.encoded(), row.clone());
        Ok(())
    }

    async fn select_changes(
        &mut self,
        tracking: &TrackingTable,
        query: &ChangeQuery<'_>,
    ) -> Result<Vec<(TrackingRow, Option<RowData>)>> {
        let table = self
            .working
            .table(tracking.base_name())
            .ok_or_else(|| Error::TableNotFound(tracking.base_name().clone()))?;
        let state = table
            .tracking
            .as_ref()
            .ok_or_else(|| Error::TableNotFound(tracking.name()))?;

        let mut selected: Vec<(String, TrackingRow, Option<RowData>)> = state
            .rows
            .iter()
            .filter(|(_, row)| query.matches(tracking, row))
            .map(|(key, row)| (key.clone(), row.clone(), table.rows.get(key).cloned()))
            .collect();
        selected.sort_by(|a, b| {
            a.1.update_timestamp
                .cmp(&b.1.update_timestamp)
                .then_with(|| a.0.cmp(&b.0))
        });

        Ok(selected.into_iter().map(|(_, row, data)| (row, data)).collect())
    }

    async fn purge_tombstones(&mut self, tracking: &TrackingTable, upto: Version) -> Result<u64> {
        let state = self.tracking_state(tracking)?;
        let before = state.rows.len();
        state
            .rows
            .retain(|_, row| !(row.is_tombstone && row.update_timestamp <= upto));
        Ok((before - state.rows.len()) as u64)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
