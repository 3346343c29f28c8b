//! Session orchestration between two participants.
//!
//! One session runs these stages in order, reporting each to the observers:
//!
//! 1. `ReadingMetadata`: load or create both scope infos and peer records
//! 2. `ReadingSchema`: introspect and check every table, provision tracking
//! 3. `SelectingChanges` / `ApplyingChanges`: local changes to the remote
//! 4. `SelectingChanges` / `ApplyingChanges`: remote changes to the local side
//! 5. `WritingMetadata`: advance the peer watermarks on both sides
//! 6. `CleaningMetadata` (optional): purge acknowledged tombstones
//!
//! Both participants' transactions stay open for the whole session. They are
//! committed after the last stage, remote first, and rolled back together on
//! any error, so a failed session never advances a watermark.

use crate::{
    apply::{ApplyContext, ApplyPhase, ApplyResult, ChangeApplier},
    error::Result,
    metadata::{purge_acknowledged, rollback_quietly},
    provider::{SyncProvider, SyncTransaction},
    scope::ensure_local_scope,
    BatchSummary, ChangeBatch, ChangeSelector, ConflictResolver, DefaultResolver, Error,
    PeerScope, RowData, ScopeConfig, ScopeId, ScopeInfo, ScopeLocks, ScopeName, SyncOptions,
    SyncSchema, TrackingTable, Version,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};

/// Session stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    ReadingMetadata,
    ReadingSchema,
    SelectingChanges,
    ApplyingChanges,
    ApplyingDeletes,
    ApplyingInserts,
    ApplyingUpdates,
    WritingMetadata,
    CleaningMetadata,
    Done,
    Failed,
}

impl From<ApplyPhase> for Stage {
    fn from(phase: ApplyPhase) -> Self {
        match phase {
            ApplyPhase::Deletes => Stage::ApplyingDeletes,
            ApplyPhase::Inserts => Stage::ApplyingInserts,
            ApplyPhase::Updates => Stage::ApplyingUpdates,
        }
    }
}

/// Which participant an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Side {
    Local,
    Remote,
}

/// Scope info as reported in progress events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeSnapshot {
    pub name: ScopeName,
    pub scope_id: ScopeId,
    pub last_sync_timestamp: Option<Version>,
}

impl From<&ScopeInfo> for ScopeSnapshot {
    fn from(scope: &ScopeInfo) -> Self {
        Self {
            name: scope.name.clone(),
            scope_id: scope.scope_id,
            last_sync_timestamp: scope.last_sync_timestamp,
        }
    }
}

/// One stage transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeSnapshot>,
    /// Pretty JSON of the synchronized schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<BatchSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied: Option<ApplyResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purged: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressEvent {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            side: None,
            scope: None,
            schema: None,
            changes: None,
            applied: None,
            purged: None,
            error: None,
        }
    }

    fn on(mut self, side: Side, scope: &ScopeInfo) -> Self {
        self.side = Some(side);
        self.scope = Some(scope.into());
        self
    }
}

/// Receives progress events synchronously, in stage order.
pub trait SyncObserver: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}

impl<F> SyncObserver for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Logs every progress event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl SyncObserver for TracingObserver {
    fn on_progress(&self, event: &ProgressEvent) {
        let scope = event.scope.as_ref().map(|s| s.name.as_str()).unwrap_or("-");
        let last_sync = event.scope.as_ref().and_then(|s| s.last_sync_timestamp);
        match event.stage {
            Stage::Failed => tracing::error!(
                stage = ?event.stage,
                error = event.error.as_deref().unwrap_or("unknown"),
                "synchronization failed"
            ),
            Stage::SelectingChanges => tracing::info!(
                stage = ?event.stage,
                side = ?event.side,
                scope,
                changes = event.changes.as_ref().map(|c| c.total.total()),
                "selected changes"
            ),
            Stage::ApplyingDeletes | Stage::ApplyingInserts | Stage::ApplyingUpdates => {
                tracing::debug!(
                    stage = ?event.stage,
                    side = ?event.side,
                    applied = event.applied.as_ref().map(|a| a.counts.applied()),
                    "applying changes"
                )
            }
            Stage::ApplyingChanges if event.applied.is_some() => tracing::info!(
                stage = ?event.stage,
                side = ?event.side,
                scope,
                applied = event.applied.as_ref().map(|a| a.counts.applied()),
                conflicts = event.applied.as_ref().map(|a| a.counts.conflicts),
                "applied changes"
            ),
            _ => tracing::info!(
                stage = ?event.stage,
                side = ?event.side,
                scope,
                last_sync,
                "sync progress"
            ),
        }
    }
}

/// Retry schedule for sessions failing with a transient error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling from the initial backoff.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Outcome of a successful session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub scope_name: ScopeName,
    pub local_scope_id: ScopeId,
    pub remote_scope_id: ScopeId,
    /// Local changes selected for the remote
    pub upload: BatchSummary,
    /// Remote changes selected for the local side
    pub download: BatchSummary,
    /// Outcome of applying the upload at the remote
    pub applied_remote: ApplyResult,
    /// Outcome of applying the download locally
    pub applied_local: ApplyResult,
    /// Tombstones purged on both sides
    pub tombstones_purged: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl SyncSummary {
    /// Total conflicts detected on both sides.
    pub fn conflicts(&self) -> u64 {
        self.applied_remote.counts.conflicts + self.applied_local.counts.conflicts
    }
}

/// Drives synchronization sessions between a local and a remote participant.
pub struct SyncAgent {
    local: Arc<dyn SyncProvider>,
    remote: Arc<dyn SyncProvider>,
    scope: ScopeConfig,
    resolver: Arc<dyn ConflictResolver>,
    observers: Vec<Arc<dyn SyncObserver>>,
}

impl SyncAgent {
    /// Create an agent using the [`DefaultResolver`].
    pub fn new(local: Arc<dyn SyncProvider>, remote: Arc<dyn SyncProvider>, scope: ScopeConfig) -> Self {
        Self {
            local,
            remote,
            scope,
            resolver: Arc::new(DefaultResolver::new()),
            observers: Vec::new(),
        }
    }

    pub fn with_resolver(mut self, resolver: impl ConflictResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn with_observer(mut self, observer: impl SyncObserver + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    pub fn scope(&self) -> &ScopeConfig {
        &self.scope
    }

    /// Run one session with default options.
    pub async fn synchronize(&self) -> Result<SyncSummary> {
        self.synchronize_with(&SyncOptions::default()).await
    }

    /// Run one session.
    pub async fn synchronize_with(&self, options: &SyncOptions) -> Result<SyncSummary> {
        let started_at = Utc::now();
        let scope_name = self.scope.name.as_str();

        // Same lock set means the same participant on both sides.
        let same_participant = std::ptr::eq(self.local.scope_locks(), self.remote.scope_locks());
        if same_participant {
            return Err(self.fail(self.same_participant_error().await));
        }

        // Lock in a fixed order so two agents over the same pair cannot
        // deadlock. Names may collide, the lock set address breaks the tie.
        let local_first = lock_order(self.local.as_ref()) <= lock_order(self.remote.as_ref());
        let (first, second) = if local_first {
            (&self.local, &self.remote)
        } else {
            (&self.remote, &self.local)
        };
        let first_lock = first.scope_locks().lock_for(scope_name);
        let second_lock = second.scope_locks().lock_for(scope_name);
        let _first = first_lock.lock().await;
        let _second = second_lock.lock().await;

        tracing::info!(
            scope = %scope_name,
            local = self.local.name(),
            remote = self.remote.name(),
            "starting synchronization"
        );

        let mut local_tx = self.local.begin().await.map_err(|e| self.fail(e))?;
        let mut remote_tx = match self.remote.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                rollback_quietly(local_tx, self.local.name()).await;
                return Err(self.fail(e));
            }
        };

        let summary = match self
            .run(&mut *local_tx, &mut *remote_tx, options, started_at)
            .await
        {
            Ok(summary) => summary,
            Err(e) => {
                rollback_quietly(remote_tx, self.remote.name()).await;
                rollback_quietly(local_tx, self.local.name()).await;
                return Err(self.fail(e));
            }
        };

        // The remote's records only describe data it holds, so committing it
        // first is safe even if the local commit then fails.
        if let Err(e) = remote_tx.commit().await {
            rollback_quietly(local_tx, self.local.name()).await;
            return Err(self.fail(e));
        }
        local_tx.commit().await.map_err(|e| self.fail(e))?;

        self.emit(ProgressEvent::new(Stage::Done));
        tracing::info!(
            scope = %scope_name,
            uploaded = summary.applied_remote.counts.applied(),
            downloaded = summary.applied_local.counts.applied(),
            conflicts = summary.conflicts(),
            "synchronization complete"
        );
        Ok(summary)
    }

    /// Run sessions until one succeeds or fails with a non-transient error.
    pub async fn synchronize_with_retry(
        &self,
        options: &SyncOptions,
        policy: &RetryPolicy,
    ) -> Result<SyncSummary> {
        let mut attempt = 1;
        loop {
            match self.synchronize_with(options).await {
                Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    tracing::warn!(attempt, ?delay, error = %e, "transient failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn run(
        &self,
        local_tx: &mut dyn SyncTransaction,
        remote_tx: &mut dyn SyncTransaction,
        options: &SyncOptions,
        started_at: DateTime<Utc>,
    ) -> Result<SyncSummary> {
        let name = self.scope.name.as_str();

        // ReadingMetadata
        let mut local_scope = ensure_local_scope(local_tx, name).await?;
        let mut remote_scope = ensure_local_scope(remote_tx, name).await?;
        if local_scope.scope_id == remote_scope.scope_id {
            return Err(Error::SameReplica(local_scope.scope_id));
        }
        let local_id = local_scope.scope_id;
        let remote_id = remote_scope.scope_id;

        let local_peer = local_tx
            .load_peer(name, remote_id)
            .await?
            .unwrap_or_else(|| PeerScope::new(name, remote_id));
        let remote_peer = remote_tx
            .load_peer(name, local_id)
            .await?
            .unwrap_or_else(|| PeerScope::new(name, local_id));
        self.emit(ProgressEvent::new(Stage::ReadingMetadata).on(Side::Local, &local_scope));
        self.emit(ProgressEvent::new(Stage::ReadingMetadata).on(Side::Remote, &remote_scope));

        // ReadingSchema
        let (local_tables, remote_tables) = self.read_schema(local_tx, remote_tx, options).await?;
        let schema = SyncSchema::new(local_tables.iter().map(|t| t.schema.clone()).collect());
        let mut event = ProgressEvent::new(Stage::ReadingSchema).on(Side::Local, &local_scope);
        event.schema = Some(schema.to_json_pretty()?);
        self.emit(event);

        // Local changes to the remote. Filters only narrow what the remote
        // sends back; a row the client moved out of its partition still has
        // to reach the server.
        let unfiltered = RowData::new();
        let upload = ChangeSelector::new(&local_tables, &unfiltered)
            .select(local_tx, &local_scope, remote_peer.received_upto, Some(remote_id))
            .await?;
        self.emit_selected(Side::Local, &local_scope, &upload);

        let resolver = self.resolver.as_ref();
        let applied_remote = self
            .apply(
                Side::Remote,
                &remote_scope,
                remote_tx,
                &ChangeApplier::new(&remote_tables, resolver),
                &upload,
                ApplyContext {
                    local_scope: remote_id,
                    origin: local_id,
                    known_by_origin: local_peer.received_upto,
                },
            )
            .await?;

        // Remote changes to the local side. The remote now holds every local
        // change up to the upload watermark, so only later local writes count
        // as concurrent.
        let download = ChangeSelector::new(&remote_tables, &options.parameters)
            .select(remote_tx, &remote_scope, local_peer.received_upto, Some(local_id))
            .await?;
        self.emit_selected(Side::Remote, &remote_scope, &download);

        let applied_local = self
            .apply(
                Side::Local,
                &local_scope,
                local_tx,
                &ChangeApplier::new(&local_tables, resolver),
                &download,
                ApplyContext {
                    local_scope: local_id,
                    origin: remote_id,
                    known_by_origin: Some(upload.watermark),
                },
            )
            .await?;

        // WritingMetadata
        let now = Utc::now();
        let mut remote_record = remote_peer;
        remote_record.advance(upload.watermark, local_peer.received_upto, now);
        remote_tx.save_peer(&remote_record).await?;

        // The remote commits before the local side, so the upload is durable
        // there by the time this record is.
        let mut local_record = local_peer;
        local_record.advance(download.watermark, Some(upload.watermark), now);
        local_tx.save_peer(&local_record).await?;

        remote_scope.record_sync(remote_tx.current_version().await?, now);
        remote_tx.save_scope(&remote_scope).await?;
        local_scope.record_sync(local_tx.current_version().await?, now);
        local_tx.save_scope(&local_scope).await?;

        self.emit(ProgressEvent::new(Stage::WritingMetadata).on(Side::Local, &local_scope));
        self.emit(ProgressEvent::new(Stage::WritingMetadata).on(Side::Remote, &remote_scope));

        let mut tombstones_purged = 0;
        if options.cleanup_tombstones {
            let purged = purge_acknowledged(local_tx, name, &local_tables).await?;
            self.emit_purged(Side::Local, &local_scope, purged);
            tombstones_purged += purged;

            let purged = purge_acknowledged(remote_tx, name, &remote_tables).await?;
            self.emit_purged(Side::Remote, &remote_scope, purged);
            tombstones_purged += purged;
        }

        Ok(SyncSummary {
            scope_name: name.to_string(),
            local_scope_id: local_id,
            remote_scope_id: remote_id,
            upload: upload.summary(),
            download: download.summary(),
            applied_remote,
            applied_local,
            tombstones_purged,
            started_at,
            completed_at: Utc::now(),
        })
    }

    /// Introspect, check and provision every table on both sides.
    ///
    /// All checks run before any tracking table is touched.
    async fn read_schema(
        &self,
        local_tx: &mut dyn SyncTransaction,
        remote_tx: &mut dyn SyncTransaction,
        options: &SyncOptions,
    ) -> Result<(Vec<TrackingTable>, Vec<TrackingTable>)> {
        let mut local_tables = Vec::with_capacity(self.scope.tables.len());
        let mut remote_tables = Vec::with_capacity(self.scope.tables.len());

        for config in &self.scope.tables {
            let local = local_tx.table_schema(&config.name).await?;
            let remote = remote_tx.table_schema(&config.name).await?;
            local.ensure_compatible(&remote)?;
            remote.ensure_compatible(&local)?;
            local_tables.push(TrackingTable::new(local, config.filter_columns.clone())?);
            remote_tables.push(TrackingTable::new(remote, config.filter_columns.clone())?);
        }

        if let Some(column) = options
            .parameters
            .keys()
            .find(|p| !self.scope.tables.iter().any(|t| t.filter_columns.contains(p)))
        {
            return Err(Error::InvalidFilterColumn {
                table: self.scope.name.clone(),
                column: column.clone(),
                reason: "parameter is not a filter column of any table in the scope".into(),
            });
        }

        for tracking in &local_tables {
            local_tx
                .ensure_tracking(&*self.local.tracking_builder(tracking.clone()))
                .await?;
        }
        for tracking in &remote_tables {
            remote_tx
                .ensure_tracking(&*self.remote.tracking_builder(tracking.clone()))
                .await?;
        }

        Ok((local_tables, remote_tables))
    }

    async fn apply(
        &self,
        side: Side,
        scope: &ScopeInfo,
        tx: &mut dyn SyncTransaction,
        applier: &ChangeApplier<'_>,
        batch: &ChangeBatch,
        ctx: ApplyContext,
    ) -> Result<ApplyResult> {
        applier.check(batch)?;
        self.emit(ProgressEvent::new(Stage::ApplyingChanges).on(side, scope));

        let mut result = ApplyResult::default();
        for phase in ApplyPhase::ALL {
            applier.apply_phase(tx, batch, ctx, phase, &mut result).await?;
            let mut event = ProgressEvent::new(phase.into()).on(side, scope);
            event.applied = Some(result.clone());
            self.emit(event);
        }

        let mut event = ProgressEvent::new(Stage::ApplyingChanges).on(side, scope);
        event.applied = Some(result.clone());
        self.emit(event);
        Ok(result)
    }

    async fn same_participant_error(&self) -> Error {
        let mut tx = match self.local.begin().await {
            Ok(tx) => tx,
            Err(e) => return e,
        };
        let error = match ensure_local_scope(&mut *tx, &self.scope.name).await {
            Ok(scope) => Error::SameReplica(scope.scope_id),
            Err(e) => e,
        };
        rollback_quietly(tx, self.local.name()).await;
        error
    }

    fn emit_selected(&self, side: Side, scope: &ScopeInfo, batch: &ChangeBatch) {
        let mut event = ProgressEvent::new(Stage::SelectingChanges).on(side, scope);
        event.changes = Some(batch.summary());
        self.emit(event);
    }

    fn emit_purged(&self, side: Side, scope: &ScopeInfo, purged: u64) {
        let mut event = ProgressEvent::new(Stage::CleaningMetadata).on(side, scope);
        event.purged = Some(purged);
        self.emit(event);
    }

    fn emit(&self, event: ProgressEvent) {
        tracing::debug!(stage = ?event.stage, side = ?event.side, "stage transition");
        for observer in &self.observers {
            observer.on_progress(&event);
        }
    }

    /// Report a failure and hand the error back.
    fn fail(&self, error: Error) -> Error {
        tracing::warn!(scope = %self.scope.name, error = %error, "synchronization failed");
        let mut event = ProgressEvent::new(Stage::Failed);
        event.error = Some(error.to_string());
        self.emit(event);
        error
    }
}

fn lock_order(provider: &dyn SyncProvider) -> (&str, usize) {
    (provider.name(), provider.scope_locks() as *const ScopeLocks as usize)
}
