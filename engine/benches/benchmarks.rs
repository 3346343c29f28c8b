//! Performance benchmarks for ferry-engine

use ferry_engine::{
    ApplyContext, ChangeApplier, ChangeSelector, Column, ColumnType, DefaultResolver,
    MemoryProvider, RowData, ScopeConfig, ScopeInfo, StoreSnapshot, SyncAgent, SyncProvider,
    TableConfig, TableSchema,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;
use uuid::Uuid;

fn create_test_schema() -> TableSchema {
    TableSchema::new(
        "users",
        vec![
            Column::required("id", ColumnType::Int64),
            Column::nullable("name", ColumnType::String),
            Column::nullable("email", ColumnType::String),
            Column::nullable("age", ColumnType::Int32),
        ],
        vec!["id"],
    )
}

fn create_scope() -> ScopeConfig {
    ScopeConfig::default().with_table(TableConfig::new("users"))
}

fn user(id: usize) -> RowData {
    json!({"id": id, "name": format!("User {}", id), "email": format!("user{}@example.com", id), "age": id % 90})
        .as_object()
        .cloned()
        .unwrap()
}

/// A provisioned participant holding `size` local inserts.
async fn populated(size: usize) -> Arc<MemoryProvider> {
    let provider = Arc::new(MemoryProvider::new("bench"));
    provider.create_table(create_test_schema()).await.unwrap();
    ferry_engine::provision(provider.as_ref(), &create_scope())
        .await
        .unwrap();
    for id in 0..size {
        provider.insert("users", user(id)).await.unwrap();
    }
    provider
}

fn bench_selection(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("selection");

    for size in [100, 1000, 5000].iter() {
        let provider = rt.block_on(populated(*size));
        let tables = rt.block_on(async {
            let mut tx = provider.begin().await.unwrap();
            let tables = ferry_engine::metadata::tracking_tables(&mut *tx, &create_scope())
                .await
                .unwrap();
            tx.rollback().await.unwrap();
            tables
        });
        let scope = ScopeInfo::new("DefaultScope");
        let parameters = RowData::new();

        group.bench_with_input(BenchmarkId::new("select_changes", size), size, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let mut tx = provider.begin().await.unwrap();
                    let batch = ChangeSelector::new(&tables, &parameters)
                        .select(&mut *tx, &scope, black_box(Some(0)), None)
                        .await
                        .unwrap();
                    tx.rollback().await.unwrap();
                    batch
                })
            })
        });
    }

    group.finish();
}

fn bench_application(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("application");
    group.sample_size(20);

    for size in [100, 1000].iter() {
        let source = rt.block_on(populated(*size));
        let target = rt.block_on(populated(0));
        let (tables, batch) = rt.block_on(async {
            let mut tx = source.begin().await.unwrap();
            let tables = ferry_engine::metadata::tracking_tables(&mut *tx, &create_scope())
                .await
                .unwrap();
            let batch = ChangeSelector::new(&tables, &RowData::new())
                .select(&mut *tx, &ScopeInfo::new("DefaultScope"), Some(0), None)
                .await
                .unwrap();
            tx.rollback().await.unwrap();
            (tables, batch)
        });
        let resolver = DefaultResolver::new();
        let ctx = ApplyContext {
            local_scope: Uuid::new_v4(),
            origin: batch.source,
            known_by_origin: None,
        };

        group.bench_with_input(BenchmarkId::new("apply_batch", size), size, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let mut tx = target.begin().await.unwrap();
                    let result = ChangeApplier::new(&tables, &resolver)
                        .apply(&mut *tx, black_box(&batch), ctx)
                        .await
                        .unwrap();
                    // Leave the target empty for the next iteration
                    tx.rollback().await.unwrap();
                    result
                })
            })
        });
    }

    group.finish();
}

fn bench_session(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("session");
    group.sample_size(10);

    for size in [100, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("first_sync", size), size, |b, &size| {
            b.iter(|| {
                rt.block_on(async {
                    let client = populated(size).await;
                    let server = Arc::new(MemoryProvider::new("server"));
                    server.create_table(create_test_schema()).await.unwrap();
                    SyncAgent::new(client, server, create_scope())
                        .synchronize()
                        .await
                        .unwrap()
                })
            })
        });
    }

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("snapshot");

    for size in [100, 1000].iter() {
        let provider = rt.block_on(populated(*size));
        let snapshot = rt.block_on(provider.export_state());
        let json = snapshot.to_json().unwrap();

        group.bench_with_input(BenchmarkId::new("to_json", size), size, |b, _| {
            b.iter(|| black_box(&snapshot).to_json().unwrap())
        });

        group.bench_with_input(BenchmarkId::new("from_json", size), size, |b, _| {
            b.iter(|| StoreSnapshot::from_json(black_box(&json)).unwrap())
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_selection,
    bench_application,
    bench_session,
    bench_snapshot
);
criterion_main!(benches);
