//! # Ferry Engine
//!
//! A bidirectional, change-tracking synchronization engine for relational
//! stores.
//!
//! Two participants (a "local" and a "remote" store) are kept eventually
//! consistent by exchanging only the rows that changed since their previous
//! session. All the metadata needed to do so lives inside each store; there is
//! no broker.
//!
//! ## Design Principles
//!
//! - **No wall clock**: change detection uses one logical clock per participant
//! - **All or nothing**: a session commits both participants or neither
//! - **Pluggable storage**: backends implement [`SyncProvider`]
//! - **Pluggable policy**: conflicts are decided by a [`ConflictResolver`]
//!
//! ## Core Concepts
//!
//! ### Tracking rows
//!
//! Every synchronized table has a shadow tracking table with one
//! [`TrackingRow`] per live or deleted base row: its key, the local versions at
//! which it was created and last changed, which participant wrote it, and a
//! tombstone flag. A [`TrackingTableBuilder`] produces the DDL for it.
//!
//! ### Scopes and watermarks
//!
//! A scope is a named set of tables ([`ScopeConfig`]). Each participant has a
//! [`ScopeInfo`] per scope and a [`PeerScope`] per (scope, peer) recording the
//! peer-clock version up to which every change of that peer was applied.
//!
//! ### Sessions
//!
//! The [`SyncAgent`] selects local changes with a [`ChangeSelector`], applies
//! them at the remote with a [`ChangeApplier`], does the same in the other
//! direction and finally advances both watermarks.
//!
//! ## Quick Start
//!
//! ```rust
//! use ferry_engine::{
//!     Column, ColumnType, MemoryProvider, ScopeConfig, SyncAgent, TableConfig, TableSchema,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let schema = TableSchema::new(
//!     "Products",
//!     vec![
//!         Column::required("Id", ColumnType::Int32),
//!         Column::nullable("name", ColumnType::String),
//!     ],
//!     vec!["Id"],
//! );
//!
//! let server = Arc::new(MemoryProvider::new("server"));
//! let client = Arc::new(MemoryProvider::new("client"));
//! server.create_table(schema.clone()).await.unwrap();
//! client.create_table(schema).await.unwrap();
//!
//! let scope = ScopeConfig::default().with_table(TableConfig::new("Products"));
//! let agent = SyncAgent::new(client.clone(), server.clone(), scope);
//!
//! // First session provisions tracking on both sides
//! agent.synchronize().await.unwrap();
//!
//! client
//!     .insert("Products", json!({"Id": 1, "name": "A"}).as_object().cloned().unwrap())
//!     .await
//!     .unwrap();
//! let summary = agent.synchronize().await.unwrap();
//!
//! assert_eq!(summary.applied_remote.counts.inserts, 1);
//! assert_eq!(server.rows("Products").await.len(), 1);
//! # });
//! ```
//!
//! ## Persistence
//!
//! The in-memory provider can be persisted with
//! [`MemoryProvider::export_state`] and [`MemoryProvider::import_state`].
//! Snapshots serialize to JSON with deterministic ordering.

pub mod agent;
pub mod apply;
pub mod change;
pub mod clock;
pub mod conflict;
pub mod error;
pub mod memory;
pub mod metadata;
pub mod provider;
pub mod record;
pub mod schema;
pub mod scope;
pub mod select;
pub mod snapshot;
pub mod tracking;

// Re-export main types at crate root
pub use agent::{
    ProgressEvent, RetryPolicy, ScopeSnapshot, Side, Stage, SyncAgent, SyncObserver,
    SyncSummary, TracingObserver,
};
pub use apply::{ApplyContext, ApplyCounts, ApplyPhase, ApplyResult, ChangeApplier, ConflictRecord};
pub use change::{BatchSummary, ChangeBatch, ChangeCounts, ChangeKind, RowChange, TableChanges};
pub use clock::LogicalClock;
pub use conflict::{Conflict, ConflictAction, ConflictResolver, ConflictType, DefaultResolver};
pub use error::Error;
pub use memory::{MemoryProvider, MemoryTransaction};
pub use metadata::{cleanup_tombstones, deprovision, provision};
pub use provider::{ChangeQuery, SyncProvider, SyncTransaction};
pub use record::{RowKey, TrackingRow};
pub use schema::{Column, ColumnType, SyncSchema, TableSchema};
pub use scope::{
    PeerScope, ScopeConfig, ScopeInfo, ScopeLocks, SyncOptions, TableConfig, DEFAULT_SCOPE_NAME,
};
pub use select::ChangeSelector;
pub use snapshot::{StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use tracking::{AnsiTrackingBuilder, TrackingTable, TrackingTableBuilder};

/// Type aliases for clarity
pub type TableName = String;
pub type ColumnName = String;
pub type ScopeName = String;
pub type ScopeId = uuid::Uuid;
pub type Version = u64;

/// A base row: column name to JSON value.
pub type RowData = serde_json::Map<String, serde_json::Value>;
