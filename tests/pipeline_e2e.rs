use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use advanced_metrics::aggregator::Aggregator;
use advanced_metrics::config::Config;
use advanced_metrics::export::health::HealthMetrics;
use advanced_metrics::ingester::ingest_frame;
use advanced_metrics::pipeline::Pipeline;
use advanced_metrics::publisher::{Dimension, MetricSet, MetricValue, Publisher};
use advanced_metrics::reader::{Frame, Reader};
use advanced_metrics::tables::{Limits, Metric, Schema, SchemaBuilder, StagingTable};

fn schema() -> Schema {
    SchemaBuilder::new()
        .dimension("dim1", 16)
        .metric("m1")
        .build()
        .expect("schema")
}

fn config(address: &Path) -> Config {
    Config {
        address: address.to_path_buf(),
        aggregation_period: Duration::from_millis(50),
        publishing_period: Duration::from_millis(200),
        publish_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

async fn connect(path: &Path) -> UnixStream {
    for _ in 0..200 {
        if let Ok(stream) = UnixStream::connect(path).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("socket {} never came up", path.display());
}

fn metric_set(dim: &str, values: Metric) -> MetricSet {
    MetricSet {
        dimensions: vec![Dimension {
            name: "dim1".to_string(),
            value: dim.to_string(),
        }],
        metrics: vec![MetricValue {
            name: "m1".to_string(),
            values,
        }],
    }
}

fn sorted(mut batch: Vec<MetricSet>) -> Vec<MetricSet> {
    batch.sort_by(|a, b| a.dimensions.cmp(&b.dimensions));
    batch
}

#[tokio::test]
async fn test_socket_to_published_batch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let address = dir.path().join("advanced-metrics.sock");
    let health = Arc::new(HealthMetrics::new("127.0.0.1:0").expect("health"));

    let mut pipeline =
        Pipeline::new(&config(&address), schema(), Some(Arc::clone(&health))).expect("pipeline");
    let mut output = pipeline.take_output().expect("output");
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(pipeline.run(cancel.clone()));

    let mut conn = connect(&address).await;
    conn.write_all(b"\"A\" 1;\"A\" 2;\"B\" 3;").await.expect("write");
    conn.flush().await.expect("flush");

    // Windows published before the writes landed are empty; wait for ours.
    let batch = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let batch = output.recv().await.expect("output open");
            if !batch.is_empty() {
                return batch;
            }
        }
    })
    .await
    .expect("batch in time");

    assert_eq!(
        sorted(batch),
        vec![
            metric_set(
                "A",
                Metric {
                    count: 2.0,
                    sum: 3.0,
                    min: 1.0,
                    max: 2.0,
                    last: 2.0,
                },
            ),
            metric_set("B", Metric::observed(3.0)),
        ]
    );

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("pipeline stopped")
        .expect("join")
        .expect("pipeline result");

    // Publisher dropped with the pipeline.
    while output.recv().await.is_some() {}

    assert_eq!(health.messages_ingested.get(), 3.0);
    assert_eq!(health.connections_accepted.get(), 1.0);
    assert!(health.publishes.get() >= 1.0);
    assert!(!address.exists());
}

#[tokio::test]
async fn test_malformed_messages_do_not_stop_pipeline() {
    let dir = tempfile::tempdir().expect("tempdir");
    let address = dir.path().join("malformed.sock");
    let health = Arc::new(HealthMetrics::new("127.0.0.1:0").expect("health"));

    let mut pipeline =
        Pipeline::new(&config(&address), schema(), Some(Arc::clone(&health))).expect("pipeline");
    let mut output = pipeline.take_output().expect("output");
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(pipeline.run(cancel.clone()));

    let mut conn = connect(&address).await;
    conn.write_all(b"too 5 extra fields;\"A\" not-hex;\"A\" a;")
        .await
        .expect("write");

    let batch = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let batch = output.recv().await.expect("output open");
            if !batch.is_empty() {
                return batch;
            }
        }
    })
    .await
    .expect("batch in time");

    // Trailing fields past the schema are ignored.
    assert_eq!(
        sorted(batch),
        vec![
            metric_set("A", Metric::observed(10.0)),
            metric_set("too", Metric::observed(5.0)),
        ]
    );
    assert_eq!(health.messages_dropped.get(), 1.0);

    cancel.cancel();
    handle.await.expect("join").expect("pipeline result");
}

#[tokio::test]
async fn test_oversized_message_tears_down_only_its_connection() {
    let dir = tempfile::tempdir().expect("tempdir");
    let address = dir.path().join("oversized.sock");
    let mut cfg = config(&address);
    cfg.reader.max_buffer_size = 16;

    let mut pipeline = Pipeline::new(&cfg, schema(), None).expect("pipeline");
    let mut output = pipeline.take_output().expect("output");
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(pipeline.run(cancel.clone()));

    let mut bad = connect(&address).await;
    bad.write_all(b"\"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA\" 1;")
        .await
        .expect("write");

    let mut good = connect(&address).await;
    good.write_all(b"\"B\" 2;").await.expect("write");

    let batch = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let batch = output.recv().await.expect("output open");
            if !batch.is_empty() {
                return batch;
            }
        }
    })
    .await
    .expect("batch in time");

    assert_eq!(batch, vec![metric_set("B", Metric::observed(2.0))]);

    cancel.cancel();
    handle.await.expect("join").expect("pipeline result");
}

/// Drives the stages by hand instead of through timers.
#[tokio::test]
async fn test_manual_aggregation_and_publish() {
    let dir = tempfile::tempdir().expect("tempdir");
    let address = dir.path().join("manual.sock");
    let schema = Arc::new(schema());
    let staging = Arc::new(StagingTable::new(
        Arc::clone(&schema),
        Limits::new(100, 100).expect("limits"),
    ));

    let (frames_tx, mut frames_rx) = tokio::sync::mpsc::channel::<Frame>(8);
    let (out_tx, mut out_rx) = tokio::sync::mpsc::channel(1);
    let cancel = CancellationToken::new();
    let reader = tokio::spawn(Reader::new(&address, 1024, frames_tx, None).run(cancel.clone()));

    let mut conn = connect(&address).await;
    conn.write_all(b"\"A\" 1;").await.expect("write");
    conn.write_all(b"\"A\" 2;\"B\" 3;").await.expect("write");

    let mut ingested = 0;
    while ingested < 3 {
        let frame = frames_rx.recv().await.expect("frame");
        ingested += ingest_frame(&staging, &frame).ingested;
        frame.release();
    }

    let mut aggregator = Aggregator::new(
        Arc::clone(&staging),
        Publisher::new(out_tx, Duration::from_secs(1), None),
        schema,
        Limits::new(100, 100).expect("limits"),
        None,
    );
    aggregator.aggregate(false);
    assert_eq!(aggregator.priority_table().len(), 2);

    aggregator.publish(&cancel).await.expect("publish");
    let batch = sorted(out_rx.recv().await.expect("batch"));
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].metrics[0].values.sum, 3.0);
    assert_eq!(batch[1].metrics[0].values.sum, 3.0);

    cancel.cancel();
    reader.await.expect("join").expect("reader result");
}
