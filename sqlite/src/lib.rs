//! # Ferry SQLite
//!
//! A [`ferry_engine::SyncProvider`] backed by SQLite through `sqlx`.
//!
//! Each database carries its own metadata tables (`ferry_clock`,
//! `ferry_scope_info`, `ferry_scope_peers`, created by the bundled
//! migrations) and one `<table>_tracking` table per synchronized table,
//! maintained by AFTER INSERT/UPDATE/DELETE triggers. Applications keep
//! writing to their tables with plain SQL; the triggers record the changes.
//!
//! ```no_run
//! use ferry_engine::{ScopeConfig, SyncAgent, TableConfig};
//! use ferry_sqlite::SqliteProvider;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), ferry_engine::Error> {
//! let server = Arc::new(SqliteProvider::connect("server", "sqlite://server.db").await?);
//! let client = Arc::new(SqliteProvider::connect("client", "sqlite://client.db").await?);
//!
//! let scope = ScopeConfig::default().with_table(TableConfig::new("Products"));
//! let summary = SyncAgent::new(client, server, scope).synchronize().await?;
//! println!("{} conflicts", summary.conflicts());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod provider;
pub mod schema;
pub mod tracking;

pub use config::{Config, ConfigError};
pub use error::{AppError, Result};
pub use provider::{SqliteProvider, SqliteTransaction};
pub use tracking::SqliteTrackingBuilder;
