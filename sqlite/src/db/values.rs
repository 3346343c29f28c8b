//! Conversion between JSON row values and SQLite storage classes.

use ferry_engine::{Column, ColumnType, Error};
use serde_json::{Number, Value};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::{Row, TypeInfo, ValueRef};

/// A query with positional `?` parameters.
pub type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// A value ready to be bound to a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    /// Encode a row value for `column`.
    pub fn encode(column: &Column, value: Option<&Value>) -> Result<Self, Error> {
        let value = match value {
            None | Some(Value::Null) => return Ok(SqlValue::Null),
            Some(v) => v,
        };

        let encoded = match (column.column_type, value) {
            (ColumnType::Bool, Value::Bool(b)) => Some(SqlValue::Integer(i64::from(*b))),
            (ColumnType::Bool | ColumnType::Int32 | ColumnType::Int64, Value::Number(n)) => {
                n.as_i64().map(SqlValue::Integer)
            }
            (ColumnType::Double | ColumnType::Decimal, Value::Number(n)) => {
                n.as_f64().map(SqlValue::Real)
            }
            (ColumnType::Decimal, Value::String(s)) => Some(SqlValue::Text(s.clone())),
            (ColumnType::Json, v) => Some(SqlValue::Text(v.to_string())),
            (
                ColumnType::String
                | ColumnType::FixedString
                | ColumnType::Guid
                | ColumnType::DateTime,
                Value::String(s),
            ) => Some(SqlValue::Text(s.clone())),
            _ => None,
        };

        encoded.ok_or_else(|| Error::TypeMismatch {
            field: column.name.clone(),
            expected: column.column_type.to_string(),
            got: value.to_string(),
        })
    }

    pub fn bind(self, query: SqliteQuery<'_>) -> SqliteQuery<'_> {
        match self {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Integer(i) => query.bind(i),
            SqlValue::Real(f) => query.bind(f),
            SqlValue::Text(s) => query.bind(s),
        }
    }
}

/// Bind values in order.
pub fn bind_all(mut query: SqliteQuery<'_>, values: Vec<SqlValue>) -> SqliteQuery<'_> {
    for value in values {
        query = value.bind(query);
    }
    query
}

/// Decode the value at `index` as a JSON value of `column`'s type.
pub fn decode(column: &Column, row: &SqliteRow, index: usize) -> Result<Value, Error> {
    let raw = row.try_get_raw(index).map_err(storage_error)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let is_text = raw.type_info().name() == "TEXT";

    let value = match column.column_type {
        ColumnType::Bool => Value::Bool(get::<i64>(row, index)? != 0),
        ColumnType::Int32 | ColumnType::Int64 => Value::from(get::<i64>(row, index)?),
        ColumnType::Double | ColumnType::Decimal if is_text => Value::String(get(row, index)?),
        ColumnType::Double | ColumnType::Decimal => Number::from_f64(get::<f64>(row, index)?)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ColumnType::Json => {
            let text: String = get(row, index)?;
            serde_json::from_str(&text).map_err(|e| {
                Error::Storage(format!("column '{}' holds invalid JSON: {}", column.name, e))
            })?
        }
        ColumnType::String
        | ColumnType::FixedString
        | ColumnType::Guid
        | ColumnType::DateTime => Value::String(get(row, index)?),
    };
    Ok(value)
}

/// Read a column, letting SQLite convert between storage classes.
pub fn get<T>(row: &SqliteRow, index: usize) -> Result<T, Error>
where
    T: for<'r> sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get_unchecked(index).map_err(storage_error)
}

/// Map a driver error into the engine taxonomy.
///
/// Busy or locked databases, pool exhaustion and I/O failures are transient;
/// retrying the session may succeed.
pub fn storage_error(error: sqlx::Error) -> Error {
    let transient = match &error {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            // Primary result code lives in the low byte
            .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED)),
        _ => false,
    };

    if transient {
        tracing::debug!(error = %error, "transient database error");
        Error::TransientStorage(error.to_string())
    } else {
        Error::Storage(error.to_string())
    }
}

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
