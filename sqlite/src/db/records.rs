//! Database operations for the clock, scope and peer tables.

use super::storage_error;
use chrono::{DateTime, Utc};
use ferry_engine::{Error, PeerScope, ScopeInfo, Version};
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

/// A stored scope row from the database.
#[derive(Debug)]
pub struct StoredScope {
    pub scope_name: String,
    pub scope_id: String,
    pub last_sync_timestamp: Option<i64>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for StoredScope {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(StoredScope {
            scope_name: row.try_get("scope_name")?,
            scope_id: row.try_get("scope_id")?,
            last_sync_timestamp: row.try_get("last_sync_timestamp")?,
            last_sync_at: row.try_get("last_sync_at")?,
        })
    }
}

impl StoredScope {
    /// Convert database row to a ferry-engine ScopeInfo.
    pub fn to_scope(&self) -> Result<ScopeInfo, Error> {
        Ok(ScopeInfo {
            name: self.scope_name.clone(),
            scope_id: parse_scope_id(&self.scope_id)?,
            last_sync_timestamp: self.last_sync_timestamp.map(|v| v as Version),
            last_sync_at: self.last_sync_at,
        })
    }
}

/// A stored peer row from the database.
#[derive(Debug)]
pub struct StoredPeer {
    pub scope_name: String,
    pub peer_id: String,
    pub received_upto: Option<i64>,
    pub peer_acked: Option<i64>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for StoredPeer {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(StoredPeer {
            scope_name: row.try_get("scope_name")?,
            peer_id: row.try_get("peer_id")?,
            received_upto: row.try_get("received_upto")?,
            peer_acked: row.try_get("peer_acked")?,
            last_sync_at: row.try_get("last_sync_at")?,
        })
    }
}

impl StoredPeer {
    /// Convert database row to a ferry-engine PeerScope.
    pub fn to_peer(&self) -> Result<PeerScope, Error> {
        Ok(PeerScope {
            scope_name: self.scope_name.clone(),
            peer_id: parse_scope_id(&self.peer_id)?,
            received_upto: self.received_upto.map(|v| v as Version),
            peer_acked: self.peer_acked.map(|v| v as Version),
            last_sync_at: self.last_sync_at,
        })
    }
}

/// Parse a scope id stored as text.
pub fn parse_scope_id(text: &str) -> Result<Uuid, Error> {
    Uuid::parse_str(text).map_err(|e| Error::Storage(format!("invalid scope id '{}': {}", text, e)))
}

/// Get a scope by name.
pub async fn get_scope(conn: &mut SqliteConnection, name: &str) -> Result<Option<ScopeInfo>, Error> {
    let stored = sqlx::query_as::<_, StoredScope>(
        r#"
        SELECT scope_name, scope_id, last_sync_timestamp, last_sync_at
        FROM ferry_scope_info
        WHERE scope_name = ?
        "#,
    )
    .bind(name)
    .fetch_optional(conn)
    .await
    .map_err(storage_error)?;

    stored.map(|s| s.to_scope()).transpose()
}

/// Upsert a scope.
pub async fn upsert_scope(conn: &mut SqliteConnection, scope: &ScopeInfo) -> Result<(), Error> {
    sqlx::query(
        r#"
        INSERT INTO ferry_scope_info (scope_name, scope_id, last_sync_timestamp, last_sync_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (scope_name) DO UPDATE SET
            scope_id = excluded.scope_id,
            last_sync_timestamp = excluded.last_sync_timestamp,
            last_sync_at = excluded.last_sync_at
        "#,
    )
    .bind(&scope.name)
    .bind(scope.scope_id.to_string())
    .bind(scope.last_sync_timestamp.map(|v| v as i64))
    .bind(scope.last_sync_at)
    .execute(conn)
    .await
    .map_err(storage_error)?;

    Ok(())
}

/// Get the record of one peer of a scope.
pub async fn get_peer(
    conn: &mut SqliteConnection,
    scope: &str,
    peer: Uuid,
) -> Result<Option<PeerScope>, Error> {
    let stored = sqlx::query_as::<_, StoredPeer>(
        r#"
        SELECT scope_name, peer_id, received_upto, peer_acked, last_sync_at
        FROM ferry_scope_peers
        WHERE scope_name = ? AND peer_id = ?
        "#,
    )
    .bind(scope)
    .bind(peer.to_string())
    .fetch_optional(conn)
    .await
    .map_err(storage_error)?;

    stored.map(|p| p.to_peer()).transpose()
}

/// Get every peer of a scope, ordered by peer id.
pub async fn get_peers(conn: &mut SqliteConnection, scope: &str) -> Result<Vec<PeerScope>, Error> {
    let stored = sqlx::query_as::<_, StoredPeer>(
        r#"
        SELECT scope_name, peer_id, received_upto, peer_acked, last_sync_at
        FROM ferry_scope_peers
        WHERE scope_name = ?
        ORDER BY peer_id
        "#,
    )
    .bind(scope)
    .fetch_all(conn)
    .await
    .map_err(storage_error)?;

    stored.iter().map(|p| p.to_peer()).collect()
}

/// Upsert a peer record.
pub async fn upsert_peer(conn: &mut SqliteConnection, peer: &PeerScope) -> Result<(), Error> {
    sqlx::query(
        r#"
        INSERT INTO ferry_scope_peers (scope_name, peer_id, received_upto, peer_acked, last_sync_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (scope_name, peer_id) DO UPDATE SET
            received_upto = excluded.received_upto,
            peer_acked = excluded.peer_acked,
            last_sync_at = excluded.last_sync_at
        "#,
    )
    .bind(&peer.scope_name)
    .bind(peer.peer_id.to_string())
    .bind(peer.received_upto.map(|v| v as i64))
    .bind(peer.peer_acked.map(|v| v as i64))
    .bind(peer.last_sync_at)
    .execute(conn)
    .await
    .map_err(storage_error)?;

    Ok(())
}

/// Last version handed out by the clock.
pub async fn current_version(conn: &mut SqliteConnection) -> Result<Version, Error> {
    let version: i64 = sqlx::query_scalar("SELECT version FROM ferry_clock WHERE id = 1")
        .fetch_one(conn)
        .await
        .map_err(storage_error)?;
    Ok(version as Version)
}

/// Tick the clock.
pub async fn next_version(conn: &mut SqliteConnection) -> Result<Version, Error> {
    let version: i64 =
        sqlx::query_scalar("UPDATE ferry_clock SET version = version + 1 WHERE id = 1 RETURNING version")
            .fetch_one(conn)
            .await
            .map_err(storage_error)?;
    Ok(version as Version)
}
