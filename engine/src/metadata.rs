//! Scope provisioning and tombstone cleanup.

use crate::{
    error::Result,
    provider::{SyncProvider, SyncTransaction},
    scope::ensure_local_scope,
    ScopeConfig, TrackingTable, Version,
};

/// Introspect every table of `scope` and describe its tracking layout.
pub async fn tracking_tables(
    tx: &mut dyn SyncTransaction,
    scope: &ScopeConfig,
) -> Result<Vec<TrackingTable>> {
    let mut tables = Vec::with_capacity(scope.tables.len());
    for config in &scope.tables {
        let schema = tx.table_schema(&config.name).await?;
        tables.push(TrackingTable::new(schema, config.filter_columns.clone())?);
    }
    Ok(tables)
}

/// Create or upgrade the tracking tables and scope info of `scope`.
///
/// Runs in one transaction; nothing is provisioned if any table fails.
pub async fn provision(provider: &dyn SyncProvider, scope: &ScopeConfig) -> Result<Vec<TrackingTable>> {
    let mut tx = provider.begin().await?;
    match provision_in(provider, &mut *tx, scope).await {
        Ok(tables) => {
            tx.commit().await?;
            tracing::info!(provider = provider.name(), scope = %scope.name, tables = tables.len(), "provisioned scope");
            Ok(tables)
        }
        Err(e) => {
            rollback_quietly(tx, provider.name()).await;
            Err(e)
        }
    }
}

async fn provision_in(
    provider: &dyn SyncProvider,
    tx: &mut dyn SyncTransaction,
    scope: &ScopeConfig,
) -> Result<Vec<TrackingTable>> {
    let tables = tracking_tables(tx, scope).await?;
    for tracking in &tables {
        tx.ensure_tracking(&*provider.tracking_builder(tracking.clone()))
            .await?;
    }
    ensure_local_scope(tx, &scope.name).await?;
    Ok(tables)
}

/// Drop the tracking tables and triggers of `scope`. Base tables are kept.
pub async fn deprovision(provider: &dyn SyncProvider, scope: &ScopeConfig) -> Result<()> {
    let mut tx = provider.begin().await?;
    let result = async {
        for tracking in tracking_tables(&mut *tx, scope).await? {
            tx.drop_tracking(&*provider.tracking_builder(tracking)).await?;
        }
        Ok::<(), crate::Error>(())
    }
    .await;

    match result {
        Ok(()) => {
            tx.commit().await?;
            tracing::info!(provider = provider.name(), scope = %scope.name, "deprovisioned scope");
            Ok(())
        }
        Err(e) => {
            rollback_quietly(tx, provider.name()).await;
            Err(e)
        }
    }
}

/// Highest version every known peer of `scope` has durably received.
///
/// `None` when there are no peers or one of them has received nothing yet.
pub async fn acknowledged_version(
    tx: &mut dyn SyncTransaction,
    scope: &str,
) -> Result<Option<Version>> {
    let peers = tx.list_peers(scope).await?;
    if peers.is_empty() {
        return Ok(None);
    }
    Ok(peers
        .iter()
        .map(|p| p.peer_acked)
        .try_fold(Version::MAX, |acc, acked| acked.map(|v| acc.min(v))))
}

/// Purge tombstones every known peer of `scope` has received.
pub async fn purge_acknowledged(
    tx: &mut dyn SyncTransaction,
    scope: &str,
    tables: &[TrackingTable],
) -> Result<u64> {
    let Some(upto) = acknowledged_version(tx, scope).await? else {
        return Ok(0);
    };
    let mut purged = 0;
    for tracking in tables {
        purged += tx.purge_tombstones(tracking, upto).await?;
    }
    if purged > 0 {
        tracing::debug!(scope = %scope, upto, purged, "purged tombstones");
    }
    Ok(purged)
}

/// Standalone tombstone cleanup for one participant.
pub async fn cleanup_tombstones(provider: &dyn SyncProvider, scope: &ScopeConfig) -> Result<u64> {
    let lock = provider.scope_locks().lock_for(&scope.name);
    let _guard = lock.lock().await;

    let mut tx = provider.begin().await?;
    let result = async {
        let tables = tracking_tables(&mut *tx, scope).await?;
        purge_acknowledged(&mut *tx, &scope.name, &tables).await
    }
    .await;

    match result {
        Ok(purged) => {
            tx.commit().await?;
            tracing::info!(provider = provider.name(), scope = %scope.name, purged, "cleaned up tombstones");
            Ok(purged)
        }
        Err(e) => {
            rollback_quietly(tx, provider.name()).await;
            Err(e)
        }
    }
}

pub(crate) async fn rollback_quietly(tx: Box<dyn SyncTransaction>, provider: &str) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!(provider, error = %e, "rollback failed");
    }
}
