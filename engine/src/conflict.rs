//! Conflict detection types and resolution policy.
//!
//! A conflict exists when a remote change targets a row this participant
//! modified after the last version the sender knows of. The applier builds a
//! [`Conflict`], asks a [`ConflictResolver`] for a [`ConflictAction`] and
//! executes it. Resolvers never touch storage.

use crate::{ChangeKind, RowChange, RowData, TableName};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Shape of a conflict, by what each side did to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictType {
    /// Both sides updated the row
    LocalUpdateRemoteUpdate,
    /// Both sides inserted a row with the same key
    LocalInsertRemoteInsert,
    /// Local updated, remote deleted
    LocalUpdateRemoteDelete,
    /// Local row deleted or missing, remote updated
    LocalNoRowRemoteUpdate,
    /// Both sides deleted the row
    LocalDeleteRemoteDelete,
}

impl ConflictType {
    /// Classify a conflict from the local and remote change kinds.
    pub fn classify(local: ChangeKind, remote: ChangeKind) -> Self {
        match (local, remote) {
            (ChangeKind::Delete, ChangeKind::Delete) => ConflictType::LocalDeleteRemoteDelete,
            (ChangeKind::Delete, _) => ConflictType::LocalNoRowRemoteUpdate,
            (_, ChangeKind::Delete) => ConflictType::LocalUpdateRemoteDelete,
            (ChangeKind::Insert, ChangeKind::Insert) => ConflictType::LocalInsertRemoteInsert,
            _ => ConflictType::LocalUpdateRemoteUpdate,
        }
    }
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConflictType::LocalUpdateRemoteUpdate => "local-update/remote-update",
            ConflictType::LocalInsertRemoteInsert => "local-insert/remote-insert",
            ConflictType::LocalUpdateRemoteDelete => "local-update/remote-delete",
            ConflictType::LocalNoRowRemoteUpdate => "local-no-row/remote-update",
            ConflictType::LocalDeleteRemoteDelete => "local-delete/remote-delete",
        })
    }
}

/// A detected pair of independent changes to the same row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub table: TableName,
    pub conflict_type: ConflictType,
    /// The local row state and its tracking metadata
    pub local_change: RowChange,
    /// The incoming change
    pub remote_change: RowChange,
}

/// Decision returned by a resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "row", rename_all = "camelCase")]
pub enum ConflictAction {
    /// Overwrite the local row with the remote change
    ApplyRemote,
    /// Keep the local row; it flows back to the peer as a local change
    KeepLocal,
    /// Abort the session, rolling back both participants
    Rollback,
    /// Skip this row and carry on with the batch
    Continue,
    /// Write the given row as a new local change
    Merge(RowData),
}

impl FromStr for ConflictAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "apply-remote" | "applyremote" | "remote" => Ok(ConflictAction::ApplyRemote),
            "keep-local" | "keeplocal" | "local" => Ok(ConflictAction::KeepLocal),
            "rollback" => Ok(ConflictAction::Rollback),
            "continue" | "skip" => Ok(ConflictAction::Continue),
            other => Err(format!("unknown conflict action '{}'", other)),
        }
    }
}

/// Policy hook consulted for every conflict.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, conflict: &Conflict) -> ConflictAction;
}

impl<F> ConflictResolver for F
where
    F: Fn(&Conflict) -> ConflictAction + Send + Sync,
{
    fn resolve(&self, conflict: &Conflict) -> ConflictAction {
        self(conflict)
    }
}

/// Remote-wins resolver with a configurable action for missing local rows.
///
/// No action is assumed for [`ConflictType::LocalNoRowRemoteUpdate`]: unless one
/// is configured the resolver rolls the session back.
#[derive(Debug, Clone, Default)]
pub struct DefaultResolver {
    on_local_no_row: Option<ConflictAction>,
}

impl DefaultResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the action used when the local row is gone and the remote updated it.
    pub fn on_local_no_row(mut self, action: ConflictAction) -> Self {
        self.on_local_no_row = Some(action);
        self
    }
}

impl ConflictResolver for DefaultResolver {
    fn resolve(&self, conflict: &Conflict) -> ConflictAction {
        match conflict.conflict_type {
            ConflictType::LocalNoRowRemoteUpdate => match &self.on_local_no_row {
                Some(action) => action.clone(),
                None => {
                    tracing::warn!(
                        table = %conflict.table,
                        key = %conflict.remote_change.tracking.key,
                        "no action configured for {}, rolling back",
                        conflict.conflict_type
                    );
                    ConflictAction::Rollback
                }
            },
            _ => ConflictAction::ApplyRemote,
        }
    }
}
