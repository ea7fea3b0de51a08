use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use logjam_importer::increments::{Increments, QuantCounts};
use logjam_importer::store::{StoreConnector, WriteConcern};
use logjam_importer::testing::MemoryStore;
use logjam_importer::updater::{StatsUpdater, TaskKind, TaskPayload, UpdateTask};
use logjam_importer::{Error, ImporterConfig, StreamInfo};
use serde_json::json;
use tokio::sync::mpsc;

const DB: &str = "logjam-shop-production-2024-03-01";

fn config(max_attempts: u32) -> Arc<ImporterConfig> {
    Arc::new(
        ImporterConfig::builder()
            .database_url("memory://shard-0")
            .retry(max_attempts, Duration::ZERO)
            .build()
            .expect("valid config"),
    )
}

async fn updater(store: &MemoryStore, config: Arc<ImporterConfig>) -> Result<StatsUpdater> {
    let connector: Arc<dyn StoreConnector> = Arc::new(store.clone());
    Ok(StatsUpdater::connect(0, config, &connector).await?)
}

fn stream() -> Arc<StreamInfo> {
    Arc::new(StreamInfo::new("shop", "production", 0))
}

fn totals_task(page: &str, backend: u64) -> UpdateTask {
    let inc = Increments {
        backend_request_count: backend,
        ..Default::default()
    };
    UpdateTask::new(
        DB,
        stream(),
        TaskPayload::Totals(HashMap::from([(page.to_string(), inc)])),
    )
}

#[tokio::test]
async fn contention_below_budget_is_retried_and_applied() -> Result<()> {
    let store = MemoryStore::new();
    let mut updater = updater(&store, config(3)).await?;
    store.fail_upserts_with_contention(2);

    let report = updater.process_task(totals_task("orders#show", 5)).await?;

    assert_eq!(report.kind, TaskKind::Totals);
    assert_eq!(report.applied, 1);
    assert_eq!(report.retried, 2);
    assert_eq!(report.dropped, 0);
    assert_eq!(store.upsert_attempts(), 3);
    let doc = store
        .document(DB, "totals", &json!({"page": "orders#show"}))
        .expect("document written");
    assert_eq!(doc["count"], json!(5));
    Ok(())
}

#[tokio::test]
async fn contention_at_budget_drops_exactly_once() -> Result<()> {
    for failures in [3, 5] {
        let store = MemoryStore::new();
        let mut updater = updater(&store, config(3)).await?;
        store.fail_upserts_with_contention(failures);

        let report = updater.process_task(totals_task("orders#show", 5)).await?;

        assert_eq!(report.applied, 0);
        assert_eq!(report.dropped, 1);
        assert_eq!(store.upsert_attempts(), 3, "{failures} failures");
        assert!(store.documents(DB, "totals").is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn non_contention_errors_are_not_retried() -> Result<()> {
    let store = MemoryStore::new();
    let mut updater = updater(&store, config(3)).await?;
    store.fail_upserts(1);

    let report = updater.process_task(totals_task("orders#show", 1)).await?;

    assert_eq!(report.dropped, 1);
    assert_eq!(store.upsert_attempts(), 1);
    Ok(())
}

#[tokio::test]
async fn applying_twice_doubles_counters() -> Result<()> {
    let store = MemoryStore::new();
    let mut updater = updater(&store, config(3)).await?;

    let mut inc = Increments {
        page_request_count: 2,
        ajax_request_count: 1,
        ..Default::default()
    };
    inc.add_metric("total_time", 10.0);
    let task = UpdateTask::new(
        DB,
        stream(),
        TaskPayload::Minutes(HashMap::from([("42-orders#show".to_string(), inc)])),
    );

    updater.process_task(task.clone()).await?;
    updater.process_task(task).await?;

    let doc = store
        .document(DB, "minutes", &json!({"page": "orders#show", "minute": 42}))
        .expect("document written");
    assert_eq!(doc["page_count"], json!(4));
    assert_eq!(doc["ajax_count"], json!(2));
    assert_eq!(doc["frontend_count"], json!(6));
    assert_eq!(doc["total_time"], json!(20.0));
    assert_eq!(doc["total_time_sq"], json!(200.0));
    assert!(doc.get("count").is_none());
    Ok(())
}

#[tokio::test]
async fn selectors_match_collection_shape() -> Result<()> {
    let store = MemoryStore::new();
    let mut updater = updater(&store, config(3)).await?;

    updater.process_task(totals_task("all_pages", 1)).await?;
    updater
        .process_task(UpdateTask::new(
            DB,
            stream(),
            TaskPayload::Minutes(HashMap::from([(
                "7-all_pages".to_string(),
                Increments {
                    backend_request_count: 1,
                    ..Default::default()
                },
            )])),
        ))
        .await?;
    let counts: QuantCounts = [("total_time", 3u64)].into_iter().collect();
    updater
        .process_task(UpdateTask::new(
            DB,
            stream(),
            TaskPayload::Quants(HashMap::from([("t-100-all_pages".to_string(), counts)])),
        ))
        .await?;

    let field_count = |collection: &str| {
        let docs = store.documents(DB, collection);
        assert_eq!(docs.len(), 1, "{collection}");
        docs[0].as_object().map(|o| o.len()).unwrap_or(0)
    };
    // selector fields plus one counter
    assert_eq!(field_count("totals"), 1 + 1);
    assert_eq!(field_count("minutes"), 2 + 1);
    assert_eq!(field_count("quants"), 3 + 1);

    let quant = store
        .document(
            DB,
            "quants",
            &json!({"page": "all_pages", "kind": "t", "quant": 100}),
        )
        .expect("quant written");
    assert_eq!(quant["total_time"], json!(3));
    Ok(())
}

#[tokio::test]
async fn malformed_keys_are_skipped() -> Result<()> {
    let store = MemoryStore::new();
    let mut updater = updater(&store, config(3)).await?;
    let inc = Increments {
        backend_request_count: 1,
        ..Default::default()
    };
    let task = UpdateTask::new(
        DB,
        stream(),
        TaskPayload::Minutes(HashMap::from([
            ("orders#show".to_string(), inc.clone()),
            ("12-orders#show".to_string(), inc),
        ])),
    );

    let report = updater.process_task(task).await?;

    assert_eq!(report.skipped, 1);
    assert_eq!(report.applied, 1);
    assert_eq!(store.documents(DB, "minutes").len(), 1);
    Ok(())
}

#[tokio::test]
async fn collections_are_prepared_and_writes_do_not_wait() -> Result<()> {
    let store = MemoryStore::new();
    let mut updater = updater(&store, config(3)).await?;

    updater.process_task(totals_task("a", 1)).await?;

    assert_eq!(store.collections(DB), vec!["minutes", "quants", "totals"]);
    assert_eq!(store.write_concerns(), vec![WriteConcern::Local]);
    Ok(())
}

#[tokio::test]
async fn failed_preparation_is_repeated_by_the_next_task() -> Result<()> {
    let store = MemoryStore::new();
    let mut updater = updater(&store, config(3)).await?;
    store.fail_prepares(1);

    updater.process_task(totals_task("a", 1)).await?;
    assert_eq!(store.prepare_calls(), 3);

    updater.process_task(totals_task("a", 1)).await?;
    assert_eq!(store.prepare_calls(), 6);

    updater.process_task(totals_task("a", 1)).await?;
    assert_eq!(store.prepare_calls(), 6);
    assert_eq!(store.collections(DB), vec!["minutes", "quants", "totals"]);
    Ok(())
}

#[tokio::test]
async fn collection_handles_are_rebuilt_on_generation_change() -> Result<()> {
    let store = MemoryStore::new();
    let config = Arc::new(
        ImporterConfig::builder()
            .database_url("memory://shard-0")
            .refresh_interval(2)
            .build()?,
    );
    let mut updater = updater(&store, config).await?;

    updater.process_task(totals_task("a", 1)).await?;
    updater.process_task(totals_task("a", 1)).await?;
    assert_eq!(store.prepare_calls(), 3);

    // worker 0 with a refresh interval of 2 changes generation on the first tick
    updater.tick().await;
    updater.process_task(totals_task("a", 1)).await?;
    assert_eq!(store.prepare_calls(), 6);

    updater.tick().await;
    updater.process_task(totals_task("a", 1)).await?;
    assert_eq!(store.prepare_calls(), 6);
    Ok(())
}

#[tokio::test]
async fn dry_run_issues_no_store_commands() -> Result<()> {
    let store = MemoryStore::new();
    let config = Arc::new(
        ImporterConfig::builder()
            .database_url("memory://shard-0")
            .dry_run(true)
            .build()?,
    );
    let mut updater = updater(&store, config).await?;

    let report = updater.process_task(totals_task("a", 1)).await?;

    assert_eq!(report.applied, 1);
    assert_eq!(store.upsert_attempts(), 0);
    assert!(store.databases().is_empty());
    Ok(())
}

#[tokio::test]
async fn unknown_shard_fails_the_task() -> Result<()> {
    let store = MemoryStore::new();
    let mut updater = updater(&store, config(3)).await?;
    let task = UpdateTask::new(
        DB,
        Arc::new(StreamInfo::new("shop", "production", 3)),
        TaskPayload::Totals(HashMap::new()),
    );

    let err = updater.process_task(task).await.unwrap_err();
    assert!(matches!(err, Error::UnknownShard { shard: 3, .. }));
    Ok(())
}

#[tokio::test]
async fn run_loop_processes_tasks_until_terminated() -> Result<()> {
    let store = MemoryStore::new();
    let updater = updater(&store, config(3)).await?;
    let (control, control_rx) = mpsc::channel(8);
    let (tasks, tasks_rx) = flume::unbounded();
    let worker = tokio::spawn(updater.run(control_rx, tasks_rx));

    tasks.send_async(totals_task("a", 1)).await?;
    for _ in 0..200 {
        if !store.documents(DB, "totals").is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    control.send("tick".to_string()).await?;
    control.send("$TERM".to_string()).await?;

    worker.await??;
    assert_eq!(store.documents(DB, "totals").len(), 1);
    assert!(store.ping_count() >= 1);
    Ok(())
}

#[tokio::test]
async fn unknown_control_command_is_fatal() -> Result<()> {
    let store = MemoryStore::new();
    let updater = updater(&store, config(3)).await?;
    let (control, control_rx) = mpsc::channel(8);
    let (_tasks, tasks_rx) = flume::unbounded::<UpdateTask>();
    let worker = tokio::spawn(updater.run(control_rx, tasks_rx));

    control.send("reload".to_string()).await?;

    let result = worker.await?;
    assert!(matches!(result, Err(Error::Protocol(_))));
    Ok(())
}

#[tokio::test]
async fn closed_control_channel_terminates() -> Result<()> {
    let store = MemoryStore::new();
    let updater = updater(&store, config(3)).await?;
    let (control, control_rx) = mpsc::channel::<String>(8);
    let (_tasks, tasks_rx) = flume::unbounded::<UpdateTask>();
    let worker = tokio::spawn(updater.run(control_rx, tasks_rx));

    drop(control);

    worker.await??;
    Ok(())
}
