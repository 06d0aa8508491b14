pub mod server;

use crate::sink::DegradationKind;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub use server::{metrics_router, run_metrics_server};

const RECORDS_CONSUMED: &str = "kandi_kafka_messages_consumed_total";
const CONSUME_DURATION: &str = "kandi_kafka_consume_duration_seconds";
const BROKER_ERRORS: &str = "kandi_kafka_consume_errors_total";
const COMMIT_FAILURES: &str = "kandi_kafka_commit_failures_total";
const PARSE_FAILURES: &str = "kandi_parse_failures_total";
const POINTS_WRITTEN: &str = "kandi_influx_points_written_total";
const WRITE_SUCCESSES: &str = "kandi_influx_write_success_total";
const WRITE_FAILURES: &str = "kandi_influx_write_failure_total";
const DEGRADED_WRITES: &str = "kandi_influx_degraded_writes_total";
const BATCH_DURATION: &str = "kandi_batch_duration_seconds";
const BACKOFFS: &str = "kandi_backoffs_total";
const BACKOFF_INTERVAL: &str = "kandi_backoff_interval_seconds";

/// Register descriptions with whatever recorder is installed
pub fn describe_metrics() {
    describe_counter!(RECORDS_CONSUMED, "Records read from kafka and queued for writing");
    describe_histogram!(CONSUME_DURATION, Unit::Seconds, "Time spent filling one batch");
    describe_counter!(BROKER_ERRORS, "Failed kafka reads");
    describe_counter!(COMMIT_FAILURES, "Offset commits kafka rejected");
    describe_counter!(PARSE_FAILURES, "Records dropped as unparseable line protocol");
    describe_counter!(POINTS_WRITTEN, "Points influx accepted");
    describe_counter!(WRITE_SUCCESSES, "Successful influx writes");
    describe_counter!(WRITE_FAILURES, "Influx writes that will be retried");
    describe_counter!(DEGRADED_WRITES, "Influx errors accepted as written, by kind");
    describe_histogram!(BATCH_DURATION, Unit::Seconds, "Time from parse to commit for one batch");
    describe_counter!(BACKOFFS, "Backoff waits, by operation");
    describe_gauge!(BACKOFF_INTERVAL, Unit::Seconds, "Interval the next backoff wait will use");
}

/// Counters for one pipeline instance.
///
/// Every signal goes to the global `metrics` recorder and to a local atomic,
/// which backs the `/debug/vars` snapshot. Shared as `Arc<Metrics>`.
#[derive(Debug, Default)]
pub struct Metrics {
    records_consumed: AtomicU64,
    consume_duration_ns: AtomicU64,
    broker_errors: AtomicU64,
    parse_failures: AtomicU64,
    points_written: AtomicU64,
    write_successes: AtomicU64,
    write_failures: AtomicU64,
    partial_writes: AtomicU64,
    field_type_conflicts: AtomicU64,
    accepted_errors: AtomicU64,
    commit_failures: AtomicU64,
    batches_processed: AtomicU64,
    last_batch_duration_ns: AtomicU64,
    backoffs: Mutex<BTreeMap<String, BackoffGauge>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackoffGauge {
    /// Number of waits performed under this name
    pub count: u64,
    /// Interval the next wait will use, in milliseconds
    pub current_ms: u64,
}

/// Point-in-time copy of [`Metrics`], serialized with expvar-style names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    #[serde(rename = "kafkaMessagesConsumed")]
    pub records_consumed: u64,
    #[serde(rename = "kafkaConsumptionDuration")]
    pub consume_duration_ns: u64,
    #[serde(rename = "kafkaConsumptionError")]
    pub broker_errors: u64,
    #[serde(rename = "influxParseFailure")]
    pub parse_failures: u64,
    #[serde(rename = "influxPointsWritten")]
    pub points_written: u64,
    #[serde(rename = "influxWriteSuccess")]
    pub write_successes: u64,
    #[serde(rename = "influxWriteFailure")]
    pub write_failures: u64,
    #[serde(rename = "influxPartialWrite")]
    pub partial_writes: u64,
    #[serde(rename = "influxFieldTypeConflict")]
    pub field_type_conflicts: u64,
    #[serde(rename = "influxAcceptedError")]
    pub accepted_errors: u64,
    #[serde(rename = "kafkaCommitFailure")]
    pub commit_failures: u64,
    pub batches_processed: u64,
    #[serde(rename = "batchDurationTaken")]
    pub last_batch_duration_ns: u64,
    pub backoffs: BTreeMap<String, BackoffGauge>,
}

impl MetricsSnapshot {
    /// Total degraded-but-accepted writes
    pub fn degradations(&self) -> u64 {
        self.partial_writes + self.field_type_conflicts + self.accepted_errors
    }

    pub fn backoff_count(&self, name: &str) -> u64 {
        self.backoffs.get(name).map(|g| g.count).unwrap_or(0)
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records_consumed(&self, count: u64, elapsed: Duration) {
        counter!(RECORDS_CONSUMED).increment(count);
        histogram!(CONSUME_DURATION).record(elapsed.as_secs_f64());
        self.records_consumed.fetch_add(count, Ordering::Relaxed);
        self.consume_duration_ns
            .fetch_add(duration_ns(elapsed), Ordering::Relaxed);
    }

    pub fn broker_error(&self) {
        counter!(BROKER_ERRORS).increment(1);
        self.broker_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn parse_failure(&self) {
        counter!(PARSE_FAILURES).increment(1);
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn write_success(&self, points: u64) {
        counter!(WRITE_SUCCESSES).increment(1);
        counter!(POINTS_WRITTEN).increment(points);
        self.write_successes.fetch_add(1, Ordering::Relaxed);
        self.points_written.fetch_add(points, Ordering::Relaxed);
    }

    pub fn write_failure(&self) {
        counter!(WRITE_FAILURES).increment(1);
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn degraded(&self, kind: &DegradationKind) {
        let (local, label) = match kind {
            DegradationKind::PartialWrite => (&self.partial_writes, "partial_write"),
            DegradationKind::FieldTypeConflict => {
                (&self.field_type_conflicts, "field_type_conflict")
            }
            DegradationKind::Accepted(_) => (&self.accepted_errors, "accepted"),
        };
        counter!(DEGRADED_WRITES, "kind" => label).increment(1);
        local.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commit_failure(&self) {
        counter!(COMMIT_FAILURES).increment(1);
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batch_processed(&self, elapsed: Duration) {
        histogram!(BATCH_DURATION).record(elapsed.as_secs_f64());
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
        self.last_batch_duration_ns
            .store(duration_ns(elapsed), Ordering::Relaxed);
    }

    /// Record one backoff wait for `name` and the interval queued for the next one
    pub fn backoff(&self, name: &str, next: Duration) {
        counter!(BACKOFFS, "name" => name.to_string()).increment(1);
        gauge!(BACKOFF_INTERVAL, "name" => name.to_string()).set(next.as_secs_f64());
        if let Ok(mut backoffs) = self.backoffs.lock() {
            let gauge = backoffs.entry(name.to_string()).or_default();
            gauge.count += 1;
            gauge.current_ms = next.as_millis() as u64;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_consumed: self.records_consumed.load(Ordering::Relaxed),
            consume_duration_ns: self.consume_duration_ns.load(Ordering::Relaxed),
            broker_errors: self.broker_errors.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            points_written: self.points_written.load(Ordering::Relaxed),
            write_successes: self.write_successes.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            partial_writes: self.partial_writes.load(Ordering::Relaxed),
            field_type_conflicts: self.field_type_conflicts.load(Ordering::Relaxed),
            accepted_errors: self.accepted_errors.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            last_batch_duration_ns: self.last_batch_duration_ns.load(Ordering::Relaxed),
            backoffs: self
                .backoffs
                .lock()
                .map(|b| b.clone())
                .unwrap_or_default(),
        }
    }
}

fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
