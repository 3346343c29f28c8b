//! Scope metadata and configuration.
//!
//! A scope is a named set of tables synchronized together. Each participant
//! keeps one [`ScopeInfo`] per scope and one [`PeerScope`] per (scope, peer)
//! recording how far the exchange with that peer has progressed.

use crate::{error::Result, provider::SyncTransaction, ColumnName, RowData, ScopeId, ScopeName, TableName, Version};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Scope name used when none is configured.
pub const DEFAULT_SCOPE_NAME: &str = "DefaultScope";

/// This participant's identity within a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeInfo {
    pub name: ScopeName,
    /// Replica identity, stable across sessions
    pub scope_id: ScopeId,
    /// Local clock value at the end of the last successful session
    pub last_sync_timestamp: Option<Version>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl ScopeInfo {
    /// A new scope with a fresh random identity.
    pub fn new(name: impl Into<ScopeName>) -> Self {
        Self {
            name: name.into(),
            scope_id: Uuid::new_v4(),
            last_sync_timestamp: None,
            last_sync_at: None,
        }
    }

    /// Record a successful session ending at `version`. Never moves back.
    pub fn record_sync(&mut self, version: Version, at: DateTime<Utc>) {
        self.last_sync_timestamp = Some(self.last_sync_timestamp.map_or(version, |v| v.max(version)));
        self.last_sync_at = Some(at);
    }
}

/// What this participant knows about its exchange with one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerScope {
    pub scope_name: ScopeName,
    pub peer_id: ScopeId,
    /// Peer clock value below which every peer change has been applied here
    pub received_upto: Option<Version>,
    /// Local clock value the peer is durably known to have received
    pub peer_acked: Option<Version>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl PeerScope {
    pub fn new(scope_name: impl Into<ScopeName>, peer_id: ScopeId) -> Self {
        Self {
            scope_name: scope_name.into(),
            peer_id,
            received_upto: None,
            peer_acked: None,
            last_sync_at: None,
        }
    }

    /// Move both watermarks forward. Values below the current ones are ignored.
    pub fn advance(
        &mut self,
        received_upto: Version,
        peer_acked: Option<Version>,
        at: DateTime<Utc>,
    ) {
        self.received_upto = max_opt(self.received_upto, Some(received_upto));
        self.peer_acked = max_opt(self.peer_acked, peer_acked);
        self.last_sync_at = Some(at);
    }
}

fn max_opt(a: Option<Version>, b: Option<Version>) -> Option<Version> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// One table of a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableConfig {
    pub name: TableName,
    #[serde(default)]
    pub filter_columns: Vec<ColumnName>,
}

impl TableConfig {
    pub fn new(name: impl Into<TableName>) -> Self {
        Self {
            name: name.into(),
            filter_columns: Vec::new(),
        }
    }

    pub fn with_filter(mut self, column: impl Into<ColumnName>) -> Self {
        self.filter_columns.push(column.into());
        self
    }
}

/// The tables synchronized together under one name.
///
/// Table order matters: inserts and updates are applied in this order,
/// deletes in reverse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeConfig {
    #[serde(default = "default_scope_name")]
    pub name: ScopeName,
    pub tables: Vec<TableConfig>,
}

fn default_scope_name() -> ScopeName {
    DEFAULT_SCOPE_NAME.to_string()
}

impl ScopeConfig {
    pub fn new(name: impl Into<ScopeName>) -> Self {
        Self {
            name: name.into(),
            tables: Vec::new(),
        }
    }

    pub fn with_table(mut self, table: TableConfig) -> Self {
        self.tables.push(table);
        self
    }

    pub fn table(&self, name: &str) -> Option<&TableConfig> {
        self.tables.iter().find(|t| t.name == name)
    }
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SCOPE_NAME)
    }
}

/// Per-session options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    /// Filter column values restricting which rows the session exchanges
    #[serde(default)]
    pub parameters: RowData,
    /// Purge tombstones every known peer has received after the exchange
    #[serde(default)]
    pub cleanup_tombstones: bool,
}

impl SyncOptions {
    pub fn with_parameter(mut self, column: impl Into<ColumnName>, value: serde_json::Value) -> Self {
        self.parameters.insert(column.into(), value);
        self
    }

    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup_tombstones = cleanup;
        self
    }
}

/// Named async mutexes, one per scope.
#[derive(Debug, Default)]
pub struct ScopeLocks {
    locks: DashMap<ScopeName, Arc<Mutex<()>>>,
}

impl ScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock guarding `scope`, created on first use.
    pub fn lock_for(&self, scope: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Load the participant's scope info, creating and saving it on first use.
pub async fn ensure_local_scope(tx: &mut dyn SyncTransaction, name: &str) -> Result<ScopeInfo> {
    if let Some(scope) = tx.load_scope(name).await? {
        return Ok(scope);
    }
    let scope = ScopeInfo::new(name);
    tx.save_scope(&scope).await?;
    tracing::info!(scope = %name, scope_id = %scope.scope_id, "created scope");
    Ok(scope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_ids_are_unique() {
        assert_ne!(ScopeInfo::new("a").scope_id, ScopeInfo::new("a").scope_id);
    }

    #[test]
    fn last_sync_timestamp_never_decreases() {
        let mut scope = ScopeInfo::new(DEFAULT_SCOPE_NAME);
        scope.record_sync(10, Utc::now());
        scope.record_sync(4, Utc::now());
        assert_eq!(scope.last_sync_timestamp, Some(10));
    }

    #[test]
    fn peer_watermarks_are_monotonic() {
        let mut peer = PeerScope::new(DEFAULT_SCOPE_NAME, Uuid::new_v4());
        peer.advance(7, None, Utc::now());
        assert_eq!(peer.received_upto, Some(7));
        assert_eq!(peer.peer_acked, None);

        peer.advance(3, Some(5), Utc::now());
        assert_eq!(peer.received_upto, Some(7));
        assert_eq!(peer.peer_acked, Some(5));

        peer.advance(9, Some(2), Utc::now());
        assert_eq!(peer.received_upto, Some(9));
        assert_eq!(peer.peer_acked, Some(5));
    }

    #[test]
    fn scope_config_from_json() {
        let config: ScopeConfig = serde_json::from_str(
            r#"{"tables":[{"name":"Products","filterColumns":["clientId"]},{"name":"Orders"}]}"#,
        )
        .unwrap();
        assert_eq!(config.name, DEFAULT_SCOPE_NAME);
        assert_eq!(config.tables[0].filter_columns, vec!["clientId"]);
        assert!(config.table("Orders").unwrap().filter_columns.is_empty());
    }

    #[test]
    fn options_builder() {
        let options = SyncOptions::default()
            .with_parameter("clientId", serde_json::json!("g1"))
            .with_cleanup(true);
        assert_eq!(options.parameters["clientId"], "g1");
        assert!(options.cleanup_tombstones);
    }

    #[tokio::test]
    async fn locks_are_shared_per_scope() {
        let locks = ScopeLocks::new();
        let a = locks.lock_for("s");
        let b = locks.lock_for("s");
        assert!(Arc::ptr_eq(&a, &b));

        let _guard = a.lock().await;
        assert!(b.try_lock().is_err());
        assert!(locks.lock_for("other").try_lock().is_ok());
    }
}
