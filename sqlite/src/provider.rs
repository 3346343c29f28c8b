//! [`SyncProvider`] over a SQLite database.

use crate::db::{self, bind_all, decode, get, storage_error, Pool, SqlValue};
use crate::schema;
use crate::tracking::SqliteTrackingBuilder;
use async_trait::async_trait;
use ferry_engine::tracking::{quote_identifier, IS_TOMBSTONE, UPDATE_SCOPE_ID, UPDATE_TIMESTAMP};
use ferry_engine::{
    ChangeQuery, ColumnName, Error, PeerScope, RowData, RowKey, ScopeId, ScopeInfo, ScopeLocks,
    SyncProvider, SyncTransaction, TableSchema, TrackingRow, TrackingTable,
    TrackingTableBuilder, Version,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Sqlite, SqliteConnection, Transaction};

type Result<T> = std::result::Result<T, Error>;

/// A participant stored in one SQLite database.
pub struct SqliteProvider {
    name: String,
    pool: Pool,
    locks: ScopeLocks,
}

impl SqliteProvider {
    /// Open (or create) the database at `database_url` and run migrations.
    pub async fn connect(name: impl Into<String>, database_url: &str) -> Result<Self> {
        let pool = db::create_pool(database_url).await.map_err(storage_error)?;
        Self::with_pool(name, pool).await
    }

    /// A private in-memory database.
    pub async fn in_memory(name: impl Into<String>) -> Result<Self> {
        let pool = db::create_memory_pool().await.map_err(storage_error)?;
        Self::with_pool(name, pool).await
    }

    /// Use an existing pool, running migrations on it.
    pub async fn with_pool(name: impl Into<String>, pool: Pool) -> Result<Self> {
        db::run_migrations(&pool)
            .await
            .map_err(|e| Error::Storage(format!("migration failed: {}", e)))?;
        let name = name.into();
        tracing::debug!(provider = %name, "sqlite provider ready");
        Ok(Self {
            name,
            pool,
            locks: ScopeLocks::new(),
        })
    }

    /// The underlying pool, for application reads and writes.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl SyncProvider for SqliteProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn begin(&self) -> Result<Box<dyn SyncTransaction>> {
        let tx = self.pool.begin().await.map_err(storage_error)?;
        Ok(Box::new(SqliteTransaction { tx }))
    }

    fn tracking_builder(&self, tracking: TrackingTable) -> Box<dyn TrackingTableBuilder> {
        Box::new(SqliteTrackingBuilder::new(tracking))
    }

    fn scope_locks(&self) -> &ScopeLocks {
        &self.locks
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// An open SQLite transaction.
pub struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
}

/// `"k1" = ? AND "k2" = ?`
fn key_predicate(schema: &TableSchema) -> String {
    schema
        .primary_key
        .iter()
        .map(|k| format!("{} = ?", quote_identifier(k)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn key_values(schema: &TableSchema, key: &RowKey) -> Result<Vec<SqlValue>> {
    if key.values().len() != schema.primary_key.len() {
        return Err(Error::InvalidRow {
            table: schema.name.clone(),
            reason: format!("key {} does not match the primary key", key),
        });
    }
    schema
        .key_columns()
        .zip(key.values())
        .map(|(column, value)| SqlValue::encode(column, Some(value)))
        .collect()
}

fn column_list(names: impl Iterator<Item = impl AsRef<str>>, alias: Option<&str>) -> String {
    names
        .map(|n| match alias {
            Some(a) => format!("{}.{}", a, quote_identifier(n.as_ref())),
            None => quote_identifier(n.as_ref()),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_scope(value: Option<String>) -> Result<Option<ScopeId>> {
    value.as_deref().map(db::parse_scope_id).transpose()
}

/// Decode a tracking row whose columns start at `offset`.
fn decode_tracking(tracking: &TrackingTable, row: &SqliteRow, offset: usize) -> Result<TrackingRow> {
    let schema = &tracking.schema;
    let key_count = schema.primary_key.len();

    let mut key = Vec::with_capacity(key_count);
    for (i, column) in schema.key_columns().enumerate() {
        key.push(decode(column, row, offset + i)?);
    }
    let meta = offset + key_count;

    let mut filter_values = RowData::new();
    for (i, column) in tracking.filter_column_defs().enumerate() {
        filter_values.insert(column.name.clone(), decode(column, row, meta + 5 + i)?);
    }

    Ok(TrackingRow {
        key: RowKey::new(key),
        create_timestamp: get::<i64>(row, meta)? as Version,
        update_timestamp: get::<i64>(row, meta + 1)? as Version,
        create_scope_id: parse_scope(get(row, meta + 2)?)?,
        update_scope_id: parse_scope(get(row, meta + 3)?)?,
        is_tombstone: get::<i64>(row, meta + 4)? != 0,
        filter_values,
    })
}

/// Decode a base row whose columns start at `offset`.
fn decode_row(schema: &TableSchema, row: &SqliteRow, offset: usize) -> Result<RowData> {
    let mut data = RowData::new();
    for (i, column) in schema.columns.iter().enumerate() {
        data.insert(column.name.clone(), decode(column, row, offset + i)?);
    }
    Ok(data)
}

#[async_trait]
impl SyncTransaction for SqliteTransaction {
    async fn table_schema(&mut self, table: &str) -> Result<TableSchema> {
        schema::table_schema(&mut self.tx, table).await
    }

    async fn execute(&mut self, statements: &[String]) -> Result<()> {
        for statement in statements {
            tracing::debug!(statement = %statement, "executing");
            let conn: &mut SqliteConnection = &mut self.tx;
            sqlx::Executor::execute(conn, sqlx::raw_sql(statement))
                .await
                .map_err(storage_error)?;
        }
        Ok(())
    }

    async fn tracking_columns(
        &mut self,
        tracking: &TrackingTable,
    ) -> Result<Option<Vec<ColumnName>>> {
        schema::column_names(&mut self.tx, &tracking.name()).await
    }

    async fn load_scope(&mut self, name: &str) -> Result<Option<ScopeInfo>> {
        db::get_scope(&mut self.tx, name).await
    }

    async fn save_scope(&mut self, scope: &ScopeInfo) -> Result<()> {
        db::upsert_scope(&mut self.tx, scope).await
    }

    async fn load_peer(&mut self, scope: &str, peer: ScopeId) -> Result<Option<PeerScope>> {
        db::get_peer(&mut self.tx, scope, peer).await
    }

    async fn save_peer(&mut self, peer: &PeerScope) -> Result<()> {
        db::upsert_peer(&mut self.tx, peer).await
    }

    async fn list_peers(&mut self, scope: &str) -> Result<Vec<PeerScope>> {
        db::get_peers(&mut self.tx, scope).await
    }

    async fn current_version(&mut self) -> Result<Version> {
        db::current_version(&mut self.tx).await
    }

    async fn next_version(&mut self) -> Result<Version> {
        db::next_version(&mut self.tx).await
    }

    async fn read_tracking(
        &mut self,
        tracking: &TrackingTable,
        key: &RowKey,
    ) -> Result<Option<TrackingRow>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            column_list(tracking.column_names().iter(), None),
            quote_identifier(&tracking.name()),
            key_predicate(&tracking.schema)
        );
        let values = key_values(&tracking.schema, key)?;
        let row = bind_all(sqlx::query(&sql), values)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage_error)?;

        row.map(|r| decode_tracking(tracking, &r, 0)).transpose()
    }

    async fn read_row(&mut self, schema: &TableSchema, key: &RowKey) -> Result<Option<RowData>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            column_list(schema.columns.iter().map(|c| &c.name), None),
            quote_identifier(&schema.name),
            key_predicate(schema)
        );
        let values = key_values(schema, key)?;
        let row = bind_all(sqlx::query(&sql), values)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage_error)?;

        row.map(|r| decode_row(schema, &r, 0)).transpose()
    }

    async fn write_row(&mut self, schema: &TableSchema, row: &RowData) -> Result<()> {
        let names: Vec<&ColumnName> = schema.columns.iter().map(|c| &c.name).collect();
        let updates: Vec<String> = schema
            .value_columns()
            .map(|c| {
                let col = quote_identifier(&c.name);
                format!("{col} = excluded.{col}")
            })
            .collect();
        let on_conflict = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
            quote_identifier(&schema.name),
            column_list(names.iter(), None),
            vec!["?"; names.len()].join(", "),
            column_list(schema.primary_key.iter(), None),
            on_conflict
        );
        let values = schema
            .columns
            .iter()
            .map(|c| SqlValue::encode(c, row.get(&c.name)))
            .collect::<Result<Vec<_>>>()?;

        bind_all(sqlx::query(&sql), values)
            .execute(&mut *self.tx)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn delete_row(&mut self, schema: &TableSchema, key: &RowKey) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            quote_identifier(&schema.name),
            key_predicate(schema)
        );
        let values = key_values(schema, key)?;
        bind_all(sqlx::query(&sql), values)
            .execute(&mut *self.tx)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn write_tracking(&mut self, tracking: &TrackingTable, row: &TrackingRow) -> Result<()> {
        let names = tracking.column_names();
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            quote_identifier(&tracking.name()),
            column_list(names.iter(), None),
            vec!["?"; names.len()].join(", ")
        );

        let mut values = key_values(&tracking.schema, &row.key)?;
        values.push(SqlValue::Integer(row.create_timestamp as i64));
        values.push(SqlValue::Integer(row.update_timestamp as i64));
        for scope in [row.create_scope_id, row.update_scope_id] {
            values.push(match scope {
                Some(id) => SqlValue::Text(id.to_string()),
                None => SqlValue::Null,
            });
        }
        values.push(SqlValue::Integer(i64::from(row.is_tombstone)));
        for column in tracking.filter_column_defs() {
            values.push(SqlValue::encode(column, row.filter_values.get(&column.name))?);
        }

        bind_all(sqlx::query(&sql), values)
            .execute(&mut *self.tx)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn select_changes(
        &mut self,
        tracking: &TrackingTable,
        query: &ChangeQuery<'_>,
    ) -> Result<Vec<(TrackingRow, Option<RowData>)>> {
        let schema = &tracking.schema;
        let tracking_columns = tracking.column_names();
        let first_key = quote_identifier(&schema.primary_key[0]);

        let mut conditions = Vec::new();
        let mut values = Vec::new();
        match query.since {
            Some(since) => {
                conditions.push(format!("t.{} > ?", quote_identifier(UPDATE_TIMESTAMP)));
                values.push(SqlValue::Integer(since as i64));
            }
            None => conditions.push(format!("t.{} = 0", quote_identifier(IS_TOMBSTONE))),
        }
        if let Some(excluded) = query.exclude_scope {
            let scope = quote_identifier(UPDATE_SCOPE_ID);
            conditions.push(format!("(t.{scope} IS NULL OR t.{scope} <> ?)"));
            values.push(SqlValue::Text(excluded.to_string()));
        }
        for column in tracking.filter_column_defs() {
            if let Some(expected) = query.parameters.get(&column.name) {
                // IS compares NULLs as equal, like the in-memory filter
                conditions.push(format!("t.{} IS ?", quote_identifier(&column.name)));
                values.push(SqlValue::encode(column, Some(expected))?);
            }
        }

        let join = schema
            .primary_key
            .iter()
            .map(|k| {
                let k = quote_identifier(k);
                format!("b.{k} = t.{k}")
            })
            .collect::<Vec<_>>()
            .join(" AND ");

        let sql = format!(
            "SELECT {}, {}, b.{} IS NULL AS missing\nFROM {} t LEFT JOIN {} b ON {}\nWHERE {}\nORDER BY t.{}, {}",
            column_list(tracking_columns.iter(), Some("t")),
            column_list(schema.columns.iter().map(|c| &c.name), Some("b")),
            first_key,
            quote_identifier(&tracking.name()),
            quote_identifier(&schema.name),
            join,
            conditions.join(" AND "),
            quote_identifier(UPDATE_TIMESTAMP),
            column_list(schema.primary_key.iter(), Some("t")),
        );

        let rows = bind_all(sqlx::query(&sql), values)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(storage_error)?;

        let base_offset = tracking_columns.len();
        let missing_index = base_offset + schema.columns.len();
        let mut changes = Vec::with_capacity(rows.len());
        for row in &rows {
            let tracking_row = decode_tracking(tracking, row, 0)?;
            let data = if get::<i64>(row, missing_index)? != 0 {
                None
            } else {
                Some(decode_row(schema, row, base_offset)?)
            };
            changes.push((tracking_row, data));
        }
        Ok(changes)
    }

    async fn purge_tombstones(&mut self, tracking: &TrackingTable, upto: Version) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = 1 AND {} <= ?",
            quote_identifier(&tracking.name()),
            quote_identifier(IS_TOMBSTONE),
            quote_identifier(UPDATE_TIMESTAMP)
        );
        let result = sqlx::query(&sql)
            .bind(upto as i64)
            .execute(&mut *self.tx)
            .await
            .map_err(storage_error)?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(storage_error)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(storage_error)
    }
}
