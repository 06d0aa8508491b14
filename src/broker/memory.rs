use crate::broker::{BrokerError, Consumer, PartitionKey, Record};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// One scripted answer to `consume_one`
#[derive(Debug, Clone)]
pub enum Delivery {
    Record(Record),
    Empty,
    Error(String),
}

/// In-process [`Consumer`] that replays a script.
///
/// Once the script runs out every poll waits `poll_timeout` and yields
/// `Ok(None)`, like an idle topic.
#[derive(Debug)]
pub struct MemoryConsumer {
    poll_timeout: Duration,
    script: Mutex<VecDeque<Delivery>>,
    committed: Mutex<Vec<Record>>,
    end_offsets: Mutex<HashMap<PartitionKey, i64>>,
    /// Number of upcoming `mark_committed` calls that fail
    commit_failures: AtomicUsize,
    polls: AtomicUsize,
    closed: AtomicBool,
}

impl Default for MemoryConsumer {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            script: Mutex::new(VecDeque::new()),
            committed: Mutex::new(Vec::new()),
            end_offsets: Mutex::new(HashMap::new()),
            commit_failures: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }
}

impl MemoryConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Records on one partition with offsets counting up from zero
    pub fn from_payloads(topic: &str, partition: i32, payloads: &[&str]) -> Self {
        let consumer = Self::new();
        for (offset, payload) in payloads.iter().enumerate() {
            consumer.push_record(record(topic, partition, offset as i64, payload));
        }
        consumer
    }

    pub fn push_record(&self, record: Record) {
        self.push(Delivery::Record(record));
    }

    pub fn push_empty(&self) {
        self.push(Delivery::Empty);
    }

    pub fn push_error(&self, message: impl Into<String>) {
        self.push(Delivery::Error(message.into()));
    }

    pub fn push(&self, delivery: Delivery) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(delivery);
        }
    }

    pub fn set_end_offset(&self, key: PartitionKey, offset: i64) {
        if let Ok(mut end_offsets) = self.end_offsets.lock() {
            end_offsets.insert(key, offset);
        }
    }

    pub fn fail_next_commits(&self, count: usize) {
        self.commit_failures.store(count, Ordering::SeqCst);
    }

    /// Every record passed to a successful `mark_committed`, in call order
    pub fn committed(&self) -> Vec<Record> {
        self.committed
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn committed_offsets(&self) -> Vec<i64> {
        self.committed().iter().map(|r| r.offset).collect()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn take_commit_failure(&self) -> bool {
        self.commit_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn consume_one(&self) -> Result<Option<Record>, BrokerError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());

        match next {
            Some(Delivery::Record(record)) => Ok(Some(record)),
            Some(Delivery::Error(message)) => Err(BrokerError::Other(message)),
            Some(Delivery::Empty) | None => {
                tokio::time::sleep(self.poll_timeout).await;
                Ok(None)
            }
        }
    }

    async fn mark_committed(&self, records: &[Record]) -> Result<(), BrokerError> {
        if self.take_commit_failure() {
            return Err(BrokerError::Other("commit rejected".to_string()));
        }
        if let Ok(mut committed) = self.committed.lock() {
            committed.extend_from_slice(records);
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn current_end_offsets(&self) -> Result<HashMap<PartitionKey, i64>, BrokerError> {
        Ok(self
            .end_offsets
            .lock()
            .map(|o| o.clone())
            .unwrap_or_default())
    }
}

/// Build a record stamped with the current time
pub fn record(topic: &str, partition: i32, offset: i64, payload: &str) -> Record {
    Record {
        payload: payload.as_bytes().to_vec(),
        topic: topic.to_string(),
        partition,
        offset,
        timestamp: Utc::now(),
    }
}
