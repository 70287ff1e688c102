//! Consumer service runs against the in-process broker and store

use chrono::{TimeZone, Utc};
use idempotent_consumer::MemoryTransactionStore;
use message_broker::memory::MemoryBroker;
use pipeline_metrics::PipelineContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use transaction_consumer::config::Config;
use transaction_schema::Transaction;

const QUEUE: &str = "transactions_queue";

fn config(extra: &[(&str, &str)]) -> Config {
    let mut vars = vec![("RABBITMQ_URL".to_string(), "amqp://unused".to_string())];
    vars.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    Config::from_vars(vars).unwrap()
}

fn publish(broker: &MemoryBroker, count: usize) {
    for i in 0..count {
        let tx = Transaction {
            id: format!("tx-{i}"),
            date: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
            document: "123.456.789-00".to_string(),
            name: "Maria Silva".to_string(),
            age: 34,
            amount: 250.75,
            installments: 3,
        };
        broker.publish_raw(QUEUE, transaction_schema::encode(&tx).unwrap());
    }
}

#[tokio::test]
async fn test_run_drains_queue_until_shutdown() {
    let broker = Arc::new(MemoryBroker::new());
    publish(&broker, 500);
    publish(&broker, 20);
    let store = Arc::new(MemoryTransactionStore::new());
    let pipeline = PipelineContext::new("consumer-test");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let config = config(&[("WORKERS", "4"), ("FLUSH_INTERVAL_MS", "50")]);
    let run = tokio::spawn({
        let (broker, store, pipeline) = (broker.clone(), store.clone(), pipeline.clone());
        async move { transaction_consumer::run(broker, store, pipeline, &config, shutdown_rx).await }
    });

    tokio::time::timeout(Duration::from_secs(30), async {
        while broker.acked_count() < 520 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue not drained");

    shutdown_tx.send(true).unwrap();
    let summary = run.await.unwrap();

    assert_eq!(summary.workers_started, 4);
    assert_eq!(summary.workers_failed, 0);
    assert_eq!(store.row_count(), 500);
    let counters = pipeline.counters.snapshot();
    assert_eq!(counters.processed, 500);
    assert_eq!(counters.duplicate, 20);
    assert_eq!(counters.error, 0);
}

#[tokio::test]
async fn test_run_returns_when_broker_goes_away() {
    let broker = Arc::new(MemoryBroker::new());
    let store = Arc::new(MemoryTransactionStore::new());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let config = config(&[("WORKERS", "2")]);
    let run = tokio::spawn({
        let broker = broker.clone();
        let pipeline = PipelineContext::new("consumer-test");
        async move { transaction_consumer::run(broker, store, pipeline, &config, shutdown_rx).await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.close();

    let summary = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("consumer did not stop")
        .unwrap();
    assert_eq!(summary.workers_started, 2);
}

#[tokio::test]
async fn test_run_reports_failed_workers() {
    let broker = Arc::new(MemoryBroker::new());
    broker.fail_channel_setup(true);
    let pipeline = PipelineContext::new("consumer-test");
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let summary = transaction_consumer::run(
        broker,
        Arc::new(MemoryTransactionStore::new()),
        pipeline.clone(),
        &config(&[("WORKERS", "3")]),
        shutdown_rx,
    )
    .await;

    assert_eq!(summary.workers_started, 0);
    assert_eq!(summary.workers_failed, 3);
    assert!(!pipeline.health.is_healthy());
}
