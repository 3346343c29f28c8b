//! SQLite tracking tables and change-capture triggers.

use crate::schema::sql_type;
use ferry_engine::tracking::{
    quote_identifier, CREATE_SCOPE_ID, CREATE_TIMESTAMP, IS_TOMBSTONE, METADATA_COLUMNS,
    UPDATE_SCOPE_ID, UPDATE_TIMESTAMP,
};
use ferry_engine::{Column, TrackingTable, TrackingTableBuilder};

/// Builds the tracking table, its key index and the three AFTER triggers that
/// capture application writes on the base table.
///
/// Triggers tick `ferry_clock` and stamp the tracking row with the new
/// version and a `NULL` update scope (a local write). Rows written by the
/// applier fire the same triggers; the applier then overwrites the tracking
/// row with the sender's scope in the same transaction.
#[derive(Debug, Clone)]
pub struct SqliteTrackingBuilder {
    tracking: TrackingTable,
}

impl SqliteTrackingBuilder {
    pub fn new(tracking: TrackingTable) -> Self {
        Self { tracking }
    }

    fn table(&self) -> String {
        quote_identifier(&self.tracking.name())
    }

    fn base(&self) -> String {
        quote_identifier(self.tracking.base_name())
    }

    fn trigger_name(&self, event: &str) -> String {
        quote_identifier(&format!("{}_ferry_{}", self.tracking.base_name(), event))
    }

    fn keys(&self) -> Vec<String> {
        self.tracking
            .schema
            .primary_key
            .iter()
            .map(|k| quote_identifier(k))
            .collect()
    }

    fn filters(&self) -> Vec<String> {
        self.tracking
            .filter_columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect()
    }

    /// `t.k = <alias>.k AND ...` over the key columns.
    fn key_match(&self, alias: &str) -> String {
        self.keys()
            .iter()
            .map(|k| format!("t.{k} = {alias}.{k}"))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn target_columns(&self) -> String {
        let mut columns = self.keys();
        columns.extend(METADATA_COLUMNS.iter().map(|c| quote_identifier(c)));
        columns.extend(self.filters());
        columns.join(", ")
    }

    /// Stamp the tracking row of `new.*` after a local insert or update.
    ///
    /// An existing row is updated in place and a missing one inserted. No
    /// statement here may hit the key index: inside a trigger the conflict
    /// policy of the outer statement wins, so `OR REPLACE` would not apply
    /// under an `ON CONFLICT DO UPDATE` upsert.
    fn stamp_new_row(&self, revive: bool) -> String {
        let version = "(SELECT version FROM ferry_clock WHERE id = 1)";
        let mut assignments = Vec::new();
        if revive {
            assignments.push(format!("{} = {}", quote_identifier(CREATE_TIMESTAMP), version));
            assignments.push(format!("{} = NULL", quote_identifier(CREATE_SCOPE_ID)));
        }
        assignments.push(format!("{} = {}", quote_identifier(UPDATE_TIMESTAMP), version));
        assignments.push(format!("{} = NULL", quote_identifier(UPDATE_SCOPE_ID)));
        assignments.push(format!("{} = 0", quote_identifier(IS_TOMBSTONE)));
        assignments.extend(self.filters().iter().map(|f| format!("{f} = new.{f}")));

        let update = format!(
            "UPDATE {} SET {}\n    WHERE {};",
            self.table(),
            assignments.join(", "),
            self.key_match_bare("new")
        );

        let mut values: Vec<String> = self.keys().iter().map(|k| format!("new.{}", k)).collect();
        values.extend(["c.version", "c.version", "NULL", "NULL", "0"].map(String::from));
        values.extend(self.filters().iter().map(|f| format!("new.{}", f)));

        let insert = format!(
            "INSERT INTO {table} ({targets})\n    SELECT {values} FROM ferry_clock c\n    WHERE c.id = 1 AND NOT EXISTS (SELECT 1 FROM {table} t WHERE {join});",
            table = self.table(),
            targets = self.target_columns(),
            values = values.join(", "),
            join = self.key_match("new"),
        );

        format!("{update}\n    {insert}")
    }

    /// `k = <alias>.k AND ...` against the unaliased tracking table.
    fn key_match_bare(&self, alias: &str) -> String {
        self.keys()
            .iter()
            .map(|k| format!("{k} = {alias}.{k}"))
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

const TICK: &str = "UPDATE ferry_clock SET version = version + 1 WHERE id = 1;";

impl TrackingTableBuilder for SqliteTrackingBuilder {
    fn tracking(&self) -> &TrackingTable {
        &self.tracking
    }

    fn create_table_script(&self) -> String {
        let mut columns: Vec<String> = self
            .tracking
            .schema
            .key_columns()
            .map(|c| format!("{} {} NOT NULL", quote_identifier(&c.name), sql_type(c)))
            .collect();
        columns.push(format!("{} INTEGER NOT NULL", quote_identifier(CREATE_TIMESTAMP)));
        columns.push(format!("{} INTEGER NOT NULL", quote_identifier(UPDATE_TIMESTAMP)));
        columns.push(format!("{} TEXT NULL", quote_identifier(CREATE_SCOPE_ID)));
        columns.push(format!("{} TEXT NULL", quote_identifier(UPDATE_SCOPE_ID)));
        columns.push(format!(
            "{} INTEGER NOT NULL DEFAULT 0",
            quote_identifier(IS_TOMBSTONE)
        ));
        columns.extend(
            self.tracking
                .filter_column_defs()
                .map(|c| format!("{} {} NULL", quote_identifier(&c.name), sql_type(c))),
        );

        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.table(),
            columns.join(",\n    ")
        )
    }

    /// SQLite cannot add a primary key to an existing table; a unique index on
    /// the key columns gives upserts the same conflict target.
    fn create_pk_script(&self) -> String {
        let table = self.tracking.name();
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({});\nCREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_identifier(&format!("PK_{}", table)),
            self.table(),
            self.keys().join(", "),
            quote_identifier(&format!("IX_{}_{}", table, UPDATE_TIMESTAMP)),
            self.table(),
            quote_identifier(UPDATE_TIMESTAMP),
        )
    }

    fn populate_script(&self) -> String {
        let mut values: Vec<String> = self.keys().iter().map(|k| format!("b.{}", k)).collect();
        values.extend(["0", "0", "NULL", "NULL", "0"].map(String::from));
        values.extend(self.filters().iter().map(|f| format!("b.{}", f)));

        format!(
            "INSERT INTO {table} ({targets})\nSELECT {values}\nFROM {base} b\nWHERE NOT EXISTS (SELECT 1 FROM {table} t WHERE {join})",
            table = self.table(),
            targets = self.target_columns(),
            values = values.join(", "),
            base = self.base(),
            join = self.key_match("b"),
        )
    }

    fn add_column_script(&self, column: &Column) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {} {} NULL",
            self.table(),
            quote_identifier(&column.name),
            sql_type(column)
        )
    }

    fn backfill_column_script(&self, column: &Column) -> String {
        let col = quote_identifier(&column.name);
        let join = self
            .keys()
            .iter()
            .map(|k| format!("b.{k} = {}.{k}", self.table()))
            .collect::<Vec<_>>()
            .join(" AND ");
        format!(
            "UPDATE {table} SET {col} = (SELECT b.{col} FROM {base} b WHERE {join})",
            table = self.table(),
            base = self.base(),
        )
    }

    fn create_triggers_script(&self) -> Vec<String> {
        let insert = format!(
            "CREATE TRIGGER IF NOT EXISTS {name} AFTER INSERT ON {base} FOR EACH ROW\nBEGIN\n    {TICK}\n    {stamp}\nEND",
            name = self.trigger_name("insert"),
            base = self.base(),
            stamp = self.stamp_new_row(true),
        );

        let update = format!(
            "CREATE TRIGGER IF NOT EXISTS {name} AFTER UPDATE ON {base} FOR EACH ROW\nBEGIN\n    {TICK}\n    {stamp}\nEND",
            name = self.trigger_name("update"),
            base = self.base(),
            stamp = self.stamp_new_row(false),
        );

        let delete = format!(
            "CREATE TRIGGER IF NOT EXISTS {name} AFTER DELETE ON {base} FOR EACH ROW\nBEGIN\n    {TICK}\n    UPDATE {table} SET {ts} = (SELECT version FROM ferry_clock WHERE id = 1), {scope} = NULL, {tomb} = 1\n    WHERE {join};\nEND",
            name = self.trigger_name("delete"),
            base = self.base(),
            table = self.table(),
            ts = quote_identifier(UPDATE_TIMESTAMP),
            scope = quote_identifier(UPDATE_SCOPE_ID),
            tomb = quote_identifier(IS_TOMBSTONE),
            join = self.key_match_bare("old"),
        );

        vec![insert, update, delete]
    }

    fn drop_triggers_script(&self) -> Vec<String> {
        ["insert", "update", "delete"]
            .iter()
            .map(|event| format!("DROP TRIGGER IF EXISTS {}", self.trigger_name(event)))
            .collect()
    }

    fn drop_script(&self) -> Vec<String> {
        let mut statements = self.drop_triggers_script();
        statements.push(format!("DROP TABLE IF EXISTS {}", self.table()));
        statements
    }
}
