//! Table introspection and SQLite type names.

use crate::db::storage_error;
use ferry_engine::{Column, ColumnName, ColumnType, Error, TableSchema};
use sqlx::{Row, SqliteConnection};

/// Declared SQLite type for a column.
///
/// The names are chosen so that [`column_type`] maps them back to the same
/// semantic type.
pub fn sql_type(column: &Column) -> String {
    match column.column_type {
        ColumnType::Bool => "BOOLEAN".into(),
        ColumnType::Int32 => "INT".into(),
        ColumnType::Int64 => "INTEGER".into(),
        ColumnType::Double => "REAL".into(),
        ColumnType::Decimal => match (column.precision, column.scale) {
            (Some(p), Some(s)) => format!("DECIMAL({}, {})", p, s),
            _ => "DECIMAL".into(),
        },
        ColumnType::String => match column.max_length {
            Some(n) => format!("VARCHAR({})", n),
            None => "TEXT".into(),
        },
        ColumnType::FixedString => format!("CHAR({})", column.max_length.unwrap_or(1)),
        ColumnType::Guid => "UUID".into(),
        ColumnType::DateTime => "DATETIME".into(),
        ColumnType::Json => "JSON".into(),
    }
}

/// Semantic type and size arguments of a declared SQLite type.
pub fn column_type(declared: &str) -> Option<(ColumnType, Vec<u32>)> {
    let upper = declared.trim().to_ascii_uppercase();
    let (base, args) = match upper.split_once('(') {
        Some((base, rest)) => (
            base.trim().to_string(),
            rest.trim_end_matches(')')
                .split(',')
                .filter_map(|a| a.trim().parse().ok())
                .collect(),
        ),
        None => (upper.clone(), Vec::new()),
    };

    let column_type = match base.as_str() {
        "BOOLEAN" | "BOOL" | "BIT" => ColumnType::Bool,
        "INT" | "SMALLINT" | "MEDIUMINT" | "TINYINT" | "INT32" => ColumnType::Int32,
        "INTEGER" | "BIGINT" | "INT64" => ColumnType::Int64,
        "REAL" | "DOUBLE" | "DOUBLE PRECISION" | "FLOAT" => ColumnType::Double,
        "DECIMAL" | "NUMERIC" | "MONEY" => ColumnType::Decimal,
        "TEXT" | "VARCHAR" | "NVARCHAR" | "CLOB" | "VARYING CHARACTER" => ColumnType::String,
        "CHAR" | "NCHAR" | "CHARACTER" => ColumnType::FixedString,
        "UUID" | "GUID" | "UNIQUEIDENTIFIER" => ColumnType::Guid,
        "DATETIME" | "TIMESTAMP" | "DATE" => ColumnType::DateTime,
        "JSON" => ColumnType::Json,
        _ => return None,
    };
    Some((column_type, args))
}

/// Introspect a base table with `pragma_table_info`.
pub async fn table_schema(conn: &mut SqliteConnection, table: &str) -> Result<TableSchema, Error> {
    let rows = sqlx::query(
        r#"SELECT name, type, "notnull", pk FROM pragma_table_info(?) ORDER BY cid"#,
    )
    .bind(table)
    .fetch_all(conn)
    .await
    .map_err(storage_error)?;

    if rows.is_empty() {
        return Err(Error::TableNotFound(table.to_string()));
    }

    let mut columns = Vec::with_capacity(rows.len());
    let mut keys: Vec<(i64, ColumnName)> = Vec::new();
    for row in &rows {
        let name: String = row.try_get("name").map_err(storage_error)?;
        let declared: String = row.try_get("type").map_err(storage_error)?;
        let not_null: i64 = row.try_get("notnull").map_err(storage_error)?;
        let pk: i64 = row.try_get("pk").map_err(storage_error)?;

        let (column_type, args) = column_type(&declared).ok_or_else(|| Error::SchemaMismatch {
            table: table.to_string(),
            detail: format!("column '{}' has unsupported type '{}'", name, declared),
        })?;

        let mut column = Column::required(name.clone(), column_type);
        // Key columns are never nullable for synchronization purposes
        column.nullable = not_null == 0 && pk == 0;
        match column_type {
            ColumnType::String | ColumnType::FixedString => column.max_length = args.first().copied(),
            ColumnType::Decimal => {
                column.precision = args.first().and_then(|p| u8::try_from(*p).ok());
                column.scale = args.get(1).and_then(|s| u8::try_from(*s).ok());
            }
            _ => {}
        }
        if pk > 0 {
            keys.push((pk, name));
        }
        columns.push(column);
    }

    keys.sort();
    let primary_key: Vec<ColumnName> = keys.into_iter().map(|(_, name)| name).collect();

    // A lone INTEGER key is an alias of the rowid
    if let [key] = primary_key.as_slice() {
        if let Some(column) = columns.iter_mut().find(|c| &c.name == key) {
            if column.column_type == ColumnType::Int64 {
                column.auto_increment = true;
            }
        }
    }

    let schema = TableSchema::new(table, columns, primary_key);
    schema.validate()?;
    Ok(schema)
}

/// Column names of a table, or `None` if it does not exist.
pub async fn column_names(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Option<Vec<ColumnName>>, Error> {
    let names: Vec<String> =
        sqlx::query_scalar("SELECT name FROM pragma_table_info(?) ORDER BY cid")
            .bind(table)
            .fetch_all(conn)
            .await
            .map_err(storage_error)?;

    Ok(if names.is_empty() { None } else { Some(names) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_types_map_back() {
        let columns = [
            Column::required("a", ColumnType::Bool),
            Column::required("b", ColumnType::Int32),
            Column::required("c", ColumnType::Int64),
            Column::required("d", ColumnType::Decimal).with_precision(6, 2),
            Column::required("e", ColumnType::String).with_max_length(40),
            Column::required("f", ColumnType::FixedString).with_max_length(150),
            Column::required("g", ColumnType::Guid),
            Column::required("h", ColumnType::Json),
        ];
        for column in &columns {
            let (mapped, _) = column_type(&sql_type(column)).unwrap();
            assert_eq!(mapped, column.column_type, "{}", sql_type(column));
        }
    }

    #[test]
    fn size_arguments_are_parsed() {
        assert_eq!(
            column_type("decimal(6, 2)"),
            Some((ColumnType::Decimal, vec![6, 2]))
        );
        assert_eq!(
            column_type("NVARCHAR(150)"),
            Some((ColumnType::String, vec![150]))
        );
        assert_eq!(column_type("BLOB"), None);
    }
}
