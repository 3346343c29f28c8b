//! Edge case tests for ferry-engine
//!
//! These tests cover boundary conditions and unusual inputs.

use ferry_engine::{
    deprovision, provision, Column, ColumnType, MemoryProvider, RowData, RowKey, ScopeConfig,
    StoreSnapshot, SyncAgent, TableConfig, TableSchema,
};
use serde_json::{json, Value};
use std::sync::Arc;

fn create_test_schema() -> TableSchema {
    TableSchema::new(
        "items",
        vec![
            Column::required("id", ColumnType::Int64),
            Column::nullable("name", ColumnType::String),
            Column::nullable("count", ColumnType::Int32),
            Column::nullable("data", ColumnType::Json),
        ],
        vec!["id"],
    )
}

fn create_scope() -> ScopeConfig {
    ScopeConfig::default().with_table(TableConfig::new("items"))
}

fn item(value: Value) -> RowData {
    value.as_object().cloned().unwrap()
}

fn key(id: i64) -> RowKey {
    RowKey::new(vec![json!(id)])
}

async fn pair() -> (Arc<MemoryProvider>, Arc<MemoryProvider>, SyncAgent) {
    let client = Arc::new(MemoryProvider::new("client"));
    let server = Arc::new(MemoryProvider::new("server"));
    client.create_table(create_test_schema()).await.unwrap();
    server.create_table(create_test_schema()).await.unwrap();
    let agent = SyncAgent::new(client.clone(), server.clone(), create_scope());
    agent.synchronize().await.unwrap();
    (client, server, agent)
}

// ============================================================================
// Value Edge Cases
// ============================================================================

#[tokio::test]
async fn unicode_strings_survive_a_session() {
    let (client, server, agent) = pair().await;
    let names = [
        "日本語テスト",
        "Привет мир",
        "مرحبا بالعالم",
        "🎉🚀💯",
        "Hello\nWorld\tTab",
        "",
        "'; DROP TABLE items; --",
    ];
    for (i, name) in names.iter().enumerate() {
        client
            .insert("items", item(json!({"id": i, "name": name})))
            .await
            .unwrap();
    }

    agent.synchronize().await.unwrap();

    for (i, name) in names.iter().enumerate() {
        let row = server.get("items", &key(i as i64)).await.unwrap();
        assert_eq!(row["name"], *name);
    }
}

#[tokio::test]
async fn null_and_nested_values() {
    let (client, server, agent) = pair().await;
    client
        .insert(
            "items",
            item(json!({
                "id": 1,
                "name": null,
                "data": {"tags": ["a", "b"], "nested": {"deep": [1, 2, {"x": null}]}}
            })),
        )
        .await
        .unwrap();

    agent.synchronize().await.unwrap();

    let row = server.get("items", &key(1)).await.unwrap();
    assert!(row["name"].is_null());
    assert_eq!(row["data"]["nested"]["deep"][2]["x"], Value::Null);
}

#[tokio::test]
async fn extreme_integers() {
    let (client, server, agent) = pair().await;
    client
        .insert("items", item(json!({"id": i64::MAX, "count": i32::MIN})))
        .await
        .unwrap();
    client
        .insert("items", item(json!({"id": i64::MIN, "count": i32::MAX})))
        .await
        .unwrap();

    agent.synchronize().await.unwrap();

    assert_eq!(server.get("items", &key(i64::MAX)).await.unwrap()["count"], i32::MIN);
    assert_eq!(server.get("items", &key(i64::MIN)).await.unwrap()["count"], i32::MAX);
}

#[tokio::test]
async fn composite_keys() {
    let schema = TableSchema::new(
        "lines",
        vec![
            Column::required("order", ColumnType::Guid),
            Column::required("line", ColumnType::Int32),
            Column::nullable("qty", ColumnType::Int32),
        ],
        vec!["order", "line"],
    );
    let client = Arc::new(MemoryProvider::new("client"));
    let server = Arc::new(MemoryProvider::new("server"));
    client.create_table(schema.clone()).await.unwrap();
    server.create_table(schema).await.unwrap();
    let scope = ScopeConfig::default().with_table(TableConfig::new("lines"));
    let agent = SyncAgent::new(client.clone(), server.clone(), scope);
    agent.synchronize().await.unwrap();

    let order = "0c6a4a5e-2b8d-4c41-9f6e-0d6f2b5c1a10";
    for line in 1..=3 {
        client
            .insert("lines", item(json!({"order": order, "line": line, "qty": line * 10})))
            .await
            .unwrap();
    }
    client
        .delete("lines", &RowKey::new(vec![json!(order), json!(2)]))
        .await
        .unwrap();
    agent.synchronize().await.unwrap();

    let rows = server.rows("lines").await;
    assert_eq!(rows.len(), 2);
    assert!(server
        .get("lines", &RowKey::new(vec![json!(order), json!(3)]))
        .await
        .is_some());
}

// ============================================================================
// Row Lifecycle Edge Cases
// ============================================================================

#[tokio::test]
async fn insert_then_delete_before_sync() {
    let (client, server, agent) = pair().await;
    client.insert("items", item(json!({"id": 1}))).await.unwrap();
    client.delete("items", &key(1)).await.unwrap();

    let summary = agent.synchronize().await.unwrap();

    assert_eq!(summary.upload.total.deletes, 1);
    assert!(server.get("items", &key(1)).await.is_none());
    // The tombstone is kept so later peers learn about the delete too
    assert_eq!(server.tracking_rows("items").await.len(), 1);
}

#[tokio::test]
async fn deleted_key_is_revived() {
    let (client, server, agent) = pair().await;
    client
        .insert("items", item(json!({"id": 1, "name": "first"})))
        .await
        .unwrap();
    agent.synchronize().await.unwrap();

    client.delete("items", &key(1)).await.unwrap();
    agent.synchronize().await.unwrap();
    assert!(server.get("items", &key(1)).await.is_none());

    client
        .insert("items", item(json!({"id": 1, "name": "second"})))
        .await
        .unwrap();
    agent.synchronize().await.unwrap();

    assert_eq!(server.get("items", &key(1)).await.unwrap()["name"], "second");
    let tracking = server.tracking_rows("items").await;
    assert!(!tracking[0].is_tombstone);
}

#[tokio::test]
async fn delete_of_unknown_row_is_recorded() {
    let (client, server, agent) = pair().await;
    client.insert("items", item(json!({"id": 7}))).await.unwrap();
    agent.synchronize().await.unwrap();

    // The server loses the row outside of tracking
    let mut state = server.export_state().await;
    let table = state.tables.get_mut("items").unwrap();
    table.rows.clear();
    table.tracking.as_mut().unwrap().rows.clear();
    server.import_state(state).await.unwrap();

    client.delete("items", &key(7)).await.unwrap();
    let summary = agent.synchronize().await.unwrap();

    assert_eq!(summary.applied_remote.counts.deletes, 1);
    let tracking = server.tracking_rows("items").await;
    assert!(tracking[0].is_tombstone);
}

#[tokio::test]
async fn many_rows_in_one_session() {
    let (client, server, agent) = pair().await;
    for id in 0..500 {
        client
            .insert("items", item(json!({"id": id, "count": id % 7})))
            .await
            .unwrap();
    }

    let summary = agent.synchronize().await.unwrap();

    assert_eq!(summary.applied_remote.counts.inserts, 500);
    assert_eq!(server.rows("items").await, client.rows("items").await);
}

// ============================================================================
// Provisioning Edge Cases
// ============================================================================

#[tokio::test]
async fn pre_existing_rows_are_exchanged_on_first_session() {
    let client = Arc::new(MemoryProvider::new("client"));
    let server = Arc::new(MemoryProvider::new("server"));
    client.create_table(create_test_schema()).await.unwrap();
    server.create_table(create_test_schema()).await.unwrap();
    client
        .insert("items", item(json!({"id": 1, "name": "client copy"})))
        .await
        .unwrap();
    client
        .insert("items", item(json!({"id": 2, "name": "client only"})))
        .await
        .unwrap();
    server
        .insert("items", item(json!({"id": 1, "name": "server copy"})))
        .await
        .unwrap();
    server
        .insert("items", item(json!({"id": 3, "name": "server only"})))
        .await
        .unwrap();

    let agent = SyncAgent::new(client.clone(), server.clone(), create_scope());
    agent.synchronize().await.unwrap();

    assert_eq!(client.rows("items").await, server.rows("items").await);
    assert_eq!(client.rows("items").await.len(), 3);
    assert_eq!(server.get("items", &key(1)).await.unwrap()["name"], "client copy");
}

#[tokio::test]
async fn tables_missing_on_one_side_abort_the_session() {
    let client = Arc::new(MemoryProvider::new("client"));
    let server = Arc::new(MemoryProvider::new("server"));
    client.create_table(create_test_schema()).await.unwrap();

    let agent = SyncAgent::new(client.clone(), server.clone(), create_scope());
    let err = agent.synchronize().await.unwrap_err();

    assert!(err.is_schema_error());
    assert!(client.export_state().await.scopes.is_empty());
}

#[tokio::test]
async fn adding_a_filter_column_backfills_tracking() {
    let (client, _, _) = pair().await;
    client
        .insert("items", item(json!({"id": 1, "count": 3})))
        .await
        .unwrap();

    let filtered = ScopeConfig::default().with_table(TableConfig::new("items").with_filter("count"));
    provision(client.as_ref(), &filtered).await.unwrap();

    let tracking = client.tracking_rows("items").await;
    assert_eq!(tracking[0].filter_values["count"], 3);
}

#[tokio::test]
async fn deprovisioned_scope_can_be_provisioned_again() {
    let (client, _, _) = pair().await;
    client.insert("items", item(json!({"id": 1}))).await.unwrap();

    deprovision(client.as_ref(), &create_scope()).await.unwrap();
    assert!(client.tracking_rows("items").await.is_empty());

    provision(client.as_ref(), &create_scope()).await.unwrap();
    let tracking = client.tracking_rows("items").await;
    assert_eq!(tracking.len(), 1);
    assert_eq!(tracking[0].update_timestamp, 0);
}

// ============================================================================
// Snapshot Edge Cases
// ============================================================================

#[tokio::test]
async fn restored_participant_keeps_its_identity() {
    let (client, server, agent) = pair().await;
    client.insert("items", item(json!({"id": 1}))).await.unwrap();
    agent.synchronize().await.unwrap();

    let json = client.export_state().await.to_json().unwrap();
    let restored = Arc::new(MemoryProvider::from_snapshot(
        "restored",
        StoreSnapshot::from_json(&json).unwrap(),
    ));
    let agent = SyncAgent::new(restored.clone(), server.clone(), create_scope());

    let summary = agent.synchronize().await.unwrap();
    assert_eq!(summary.upload.total.total(), 0);
    assert_eq!(summary.download.total.total(), 0);

    restored
        .update("items", item(json!({"id": 1, "name": "after restore"})))
        .await
        .unwrap();
    agent.synchronize().await.unwrap();
    assert_eq!(server.get("items", &key(1)).await.unwrap()["name"], "after restore");
}

#[test]
fn snapshot_with_unknown_format_is_rejected() {
    let json = r#"{"formatVersion": 999, "clock": {"counter": 0}, "tables": {}, "scopes": {}, "peers": {}}"#;
    assert!(StoreSnapshot::from_json(json).is_err());
}

#[test]
fn malformed_snapshot_json_is_rejected() {
    assert!(StoreSnapshot::from_json("{not json").is_err());
    assert!(StoreSnapshot::from_json("").is_err());
}
