use kandi::broker::memory::record;
use kandi::broker::{MemoryConsumer, PartitionKey};
use kandi::config::{BackfillConfig, BackoffConfig, BatchConfig, KandiConfig};
use kandi::parser::LineProtocolParser;
use kandi::pipeline::{Pipeline, PipelineMode, PipelineState, PipelineSummary};
use kandi::sink::{FieldValue, MemorySink, WriteClassifier};
use std::sync::Arc;
use std::time::Duration;

fn kandi_config(batch_size: usize, batch_duration: Duration) -> KandiConfig {
    KandiConfig {
        batch: BatchConfig {
            size: batch_size,
            duration: batch_duration,
        },
        backoff: BackoffConfig {
            interval: Some(Duration::from_millis(100)),
            max: Duration::from_secs(5),
            reset: Duration::ZERO,
        },
        backfill: BackfillConfig {
            idle_timeout: Duration::from_millis(500),
        },
        ..KandiConfig::default()
    }
}

fn build_pipeline(
    consumer: &Arc<MemoryConsumer>,
    sink: &Arc<MemorySink>,
    config: KandiConfig,
) -> Pipeline {
    Pipeline::new(
        config,
        consumer.clone(),
        sink.clone(),
        Arc::new(LineProtocolParser::new()),
    )
}

/// Run until `done` holds, then stop and wait for the pipeline to finish
async fn run_until(pipeline: Pipeline, done: impl Fn() -> bool) -> PipelineSummary {
    let stop = pipeline.stop_handle();
    let handle = tokio::spawn(async move { pipeline.start().await });

    for _ in 0..10_000 {
        if done() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(done(), "pipeline never reached the expected state");

    stop.stop();
    handle.await.unwrap().unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_valid_records_written_once_and_committed() {
    let consumer = Arc::new(MemoryConsumer::from_payloads(
        "metrics",
        0,
        &[
            "cpu,host=a value=1 1700000000000000000",
            "cpu,host=b value=2 1700000000000000000",
            "cpu,host=c value=3 1700000000000000000",
        ],
    ));
    let sink = Arc::new(MemorySink::new());
    let pipeline = build_pipeline(&consumer, &sink, kandi_config(3, Duration::from_secs(100)));
    let metrics = pipeline.metrics();

    let c = consumer.clone();
    let summary = run_until(pipeline, move || c.committed().len() == 3).await;

    assert_eq!(sink.write_count(), 1);
    assert_eq!(sink.attempts()[0].len(), 3);
    assert_eq!(consumer.committed_offsets(), vec![0, 1, 2]);
    assert!(consumer.is_closed());

    assert_eq!(summary.batches_committed, 1);
    assert_eq!(summary.records_committed, 3);
    assert_eq!(summary.points_written, 3);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.records_consumed, 3);
    assert_eq!(snapshot.write_successes, 1);
    assert_eq!(snapshot.points_written, 3);
    assert_eq!(snapshot.batches_processed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unparseable_record_committed_but_not_written() {
    let consumer = Arc::new(MemoryConsumer::from_payloads(
        "metrics",
        0,
        &["cpu,host=a value=1", "fake", "cpu,host=b value=2"],
    ));
    let sink = Arc::new(MemorySink::new());
    let pipeline = build_pipeline(&consumer, &sink, kandi_config(3, Duration::from_secs(100)));
    let metrics = pipeline.metrics();

    let c = consumer.clone();
    let summary = run_until(pipeline, move || c.committed().len() == 3).await;

    let attempts = sink.attempts();
    assert_eq!(attempts.len(), 1);
    let hosts: Vec<&str> = attempts[0]
        .points()
        .iter()
        .map(|p| p.tags["host"].as_str())
        .collect();
    assert_eq!(hosts, vec!["a", "b"]);
    assert!(attempts[0]
        .points()
        .iter()
        .all(|p| p.fields.values().all(|v| matches!(v, FieldValue::Float(_)))));

    assert_eq!(consumer.committed_offsets(), vec![0, 1, 2]);
    assert_eq!(summary.parse_failures, 1);
    assert_eq!(metrics.snapshot().parse_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_partial_write_counts_as_committed() {
    let consumer = Arc::new(MemoryConsumer::from_payloads(
        "metrics",
        0,
        &["cpu value=1", "cpu value=2", "cpu value=3"],
    ));
    let sink = Arc::new(MemorySink::new());
    sink.push_failure(
        400,
        r#"{"error":"partial write: points beyond retention policy dropped=1"}"#,
    );
    let pipeline = build_pipeline(&consumer, &sink, kandi_config(3, Duration::from_secs(100)));
    let metrics = pipeline.metrics();

    let c = consumer.clone();
    run_until(pipeline, move || c.committed().len() == 3).await;

    assert_eq!(sink.write_count(), 1);
    assert_eq!(consumer.committed_offsets(), vec![0, 1, 2]);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.partial_writes, 1);
    assert_eq!(snapshot.degradations(), 1);
    assert_eq!(snapshot.write_failures, 0);
    assert_eq!(snapshot.backoff_count("sink"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_configured_accepted_error_commits() {
    let consumer = Arc::new(MemoryConsumer::from_payloads("metrics", 0, &["cpu value=1"]));
    let sink = Arc::new(MemorySink::new());
    sink.push_failure(404, "database not found: \"metrics\"");
    let pipeline = build_pipeline(&consumer, &sink, kandi_config(1, Duration::from_secs(1)))
        .with_classifier(WriteClassifier::new(vec!["database not found".to_string()]));
    let metrics = pipeline.metrics();

    let c = consumer.clone();
    run_until(pipeline, move || c.committed().len() == 1).await;

    assert_eq!(sink.write_count(), 1);
    assert_eq!(metrics.snapshot().accepted_errors, 1);
}

#[tokio::test(start_paused = true)]
async fn test_server_error_retries_same_batch_after_backoff() {
    let consumer = Arc::new(MemoryConsumer::from_payloads(
        "metrics",
        0,
        &["cpu value=1", "cpu value=2", "cpu value=3"],
    ));
    let sink = Arc::new(MemorySink::new());
    sink.push_failure(500, "internal server error");
    let pipeline = build_pipeline(&consumer, &sink, kandi_config(3, Duration::from_secs(100)));
    let metrics = pipeline.metrics();

    let c = consumer.clone();
    let summary = run_until(pipeline, move || c.committed().len() == 3).await;

    let attempts = sink.attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0], attempts[1]);
    assert_eq!(attempts[0].len(), 3);

    // committed once, after the retry
    assert_eq!(consumer.committed_offsets(), vec![0, 1, 2]);
    assert_eq!(summary.batches_committed, 1);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.write_failures, 1);
    assert_eq!(snapshot.write_successes, 1);
    assert_eq!(snapshot.backoff_count("sink"), 1);
    assert_eq!(snapshot.backoff_count("broker"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retries_keep_identical_points_and_growing_waits() {
    let consumer = Arc::new(MemoryConsumer::from_payloads(
        "metrics",
        0,
        &["disk,path=/ used=1i", "disk,path=/var used=2i"],
    ));
    let sink = Arc::new(MemorySink::new());
    for _ in 0..3 {
        sink.push_failure(503, "service unavailable");
    }
    let pipeline = build_pipeline(&consumer, &sink, kandi_config(2, Duration::from_secs(100)));
    let metrics = pipeline.metrics();

    let started = tokio::time::Instant::now();
    let c = consumer.clone();
    run_until(pipeline, move || c.committed().len() == 2).await;

    let attempts = sink.attempts();
    assert_eq!(attempts.len(), 4);
    assert!(attempts.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(metrics.snapshot().backoff_count("sink"), 3);
    // 100ms + 200ms + 400ms of backoff
    assert!(started.elapsed() >= Duration::from_millis(700));
}

#[tokio::test(start_paused = true)]
async fn test_nothing_committed_while_sink_keeps_failing() {
    let consumer = Arc::new(MemoryConsumer::from_payloads(
        "metrics",
        0,
        &["cpu value=1", "cpu value=2"],
    ));
    let sink = Arc::new(MemorySink::new());
    for _ in 0..1000 {
        sink.push_failure(500, "internal server error");
    }
    let pipeline = build_pipeline(&consumer, &sink, kandi_config(2, Duration::from_secs(1)));

    let s = sink.clone();
    let summary = run_until(pipeline, move || s.write_count() >= 5).await;

    assert!(consumer.committed().is_empty());
    assert_eq!(summary.records_committed, 0);
    assert_eq!(summary.batches_committed, 0);
    assert!(consumer.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_broker_error_keeps_partial_batch_and_backs_off() {
    let consumer = Arc::new(MemoryConsumer::from_payloads(
        "metrics",
        0,
        &["cpu value=1", "cpu value=2"],
    ));
    consumer.push_error("broker transport failure");
    consumer.push_record(record("metrics", 0, 2, "cpu value=3"));
    let sink = Arc::new(MemorySink::new());
    let pipeline = build_pipeline(&consumer, &sink, kandi_config(3, Duration::from_secs(1)));
    let metrics = pipeline.metrics();

    let c = consumer.clone();
    run_until(pipeline, move || c.committed().len() == 3).await;

    assert_eq!(consumer.committed_offsets(), vec![0, 1, 2]);
    assert_eq!(sink.write_count(), 2);
    assert_eq!(sink.attempts()[0].len(), 2);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.broker_errors, 1);
    assert_eq!(snapshot.backoff_count("broker"), 1);
    assert_eq!(snapshot.backoff_count("sink"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_per_partition_order_preserved() {
    let consumer = Arc::new(MemoryConsumer::new());
    for offset in 0..5 {
        consumer.push_record(record("metrics", 0, offset, &format!("m,p=0 v={}i", offset)));
        consumer.push_record(record("metrics", 1, offset, &format!("m,p=1 v={}i", offset)));
    }
    let sink = Arc::new(MemorySink::new());
    let pipeline = build_pipeline(&consumer, &sink, kandi_config(3, Duration::from_millis(200)));

    let c = consumer.clone();
    run_until(pipeline, move || c.committed().len() == 10).await;

    for partition in 0..2 {
        let offsets: Vec<i64> = consumer
            .committed()
            .iter()
            .filter(|r| r.partition == partition)
            .map(|r| r.offset)
            .collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    }

    let written: Vec<FieldValue> = sink
        .attempts()
        .iter()
        .flat_map(|b| b.points().to_vec())
        .filter(|p| p.tags["p"] == "1")
        .map(|p| p.fields["v"].clone())
        .collect();
    assert_eq!(written, (0..5).map(FieldValue::Integer).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_backfill_stops_once_every_partition_passes_watermark() {
    let consumer = Arc::new(MemoryConsumer::new());
    consumer.set_end_offset(PartitionKey::new("metrics", 0), 1);
    consumer.set_end_offset(PartitionKey::new("metrics", 1), 0);
    for (partition, offset) in [(0, 0), (1, 0), (0, 1), (0, 2), (1, 1), (0, 3), (0, 4)] {
        consumer.push_record(record("metrics", partition, offset, "cpu value=1"));
    }
    let sink = Arc::new(MemorySink::new());
    let pipeline = build_pipeline(&consumer, &sink, kandi_config(2, Duration::from_secs(1)))
        .with_mode(PipelineMode::Backfill);

    let summary = tokio::time::timeout(Duration::from_secs(60), pipeline.start())
        .await
        .expect("backfill should stop by itself")
        .unwrap();

    assert!(summary.backfill_complete);
    assert_eq!(summary.batches_committed, 3);
    assert_eq!(consumer.committed().len(), 6);
    assert!(!consumer.committed_offsets().contains(&4));
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert!(consumer.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_backfill_idle_timeout_drains_queue_and_stops() {
    let consumer = Arc::new(MemoryConsumer::from_payloads(
        "metrics",
        0,
        &["cpu value=1", "cpu value=2", "cpu value=3"],
    ));
    consumer.set_end_offset(PartitionKey::new("metrics", 0), 100);
    let sink = Arc::new(MemorySink::new());
    let pipeline = build_pipeline(&consumer, &sink, kandi_config(2, Duration::ZERO))
        .with_mode(PipelineMode::Backfill);

    let summary = tokio::time::timeout(Duration::from_secs(60), pipeline.start())
        .await
        .expect("idle backfill should stop by itself")
        .unwrap();

    assert!(!summary.backfill_complete);
    assert_eq!(consumer.committed_offsets(), vec![0, 1, 2]);
    assert_eq!(summary.records_consumed, 3);
    assert!(consumer.is_closed());
}
