use crate::broker::{BrokerError, Consumer, Record};
use crate::config::BatchConfig;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Records in broker arrival order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    records: Vec<Record>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl From<Vec<Record>> for Batch {
    fn from(records: Vec<Record>) -> Self {
        Self { records }
    }
}

/// A broker read failed part way through a batch
#[derive(Debug, Error)]
#[error("broker read failed: {source}")]
pub struct AccumulateError {
    /// Records read before the failure, still owed to the sink
    pub partial: Batch,
    pub source: BrokerError,
}

const MAX_PREALLOCATED: usize = 4096;

/// Pulls records from a [`Consumer`] until a size or time bound is hit
pub struct BatchAccumulator {
    consumer: Arc<dyn Consumer>,
    size: usize,
    /// Zero means no time bound
    duration: Duration,
    idle_timeout: Option<Duration>,
    last_record: Instant,
    stop: CancellationToken,
}

impl BatchAccumulator {
    pub fn new(consumer: Arc<dyn Consumer>, config: &BatchConfig) -> Self {
        Self {
            consumer,
            size: config.size,
            duration: config.duration,
            idle_timeout: None,
            last_record: Instant::now(),
            stop: CancellationToken::new(),
        }
    }

    /// End accumulation early once nothing was read for `timeout`
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// End accumulation early once `stop` is cancelled
    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    /// No record arrived within the idle timeout
    pub fn is_idle(&self) -> bool {
        matches!(self.idle_timeout, Some(limit) if self.last_record.elapsed() >= limit)
    }

    /// Poll the broker up to `size` times, or until `duration` has passed.
    ///
    /// Empty polls count toward `size`, so an idle broker yields a short or
    /// empty batch. The time bound is checked between polls, so a batch can
    /// overrun it by at most one broker poll.
    pub async fn accumulate(&mut self) -> Result<Batch, AccumulateError> {
        let started = Instant::now();
        let mut batch = Batch::with_capacity(self.size.min(MAX_PREALLOCATED));

        for _ in 0..self.size {
            if !self.duration.is_zero() && started.elapsed() >= self.duration {
                break;
            }
            if self.stop.is_cancelled() || self.is_idle() {
                break;
            }

            match self.consumer.consume_one().await {
                Ok(Some(record)) => {
                    self.last_record = Instant::now();
                    batch.push(record);
                }
                Ok(None) => {}
                Err(source) => {
                    return Err(AccumulateError {
                        partial: batch,
                        source,
                    })
                }
            }
        }

        Ok(batch)
    }
}
