pub mod kafka;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

pub use kafka::KafkaConsumer;
pub use memory::MemoryConsumer;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("broker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("topic '{0}' has no partitions")]
    UnknownTopic(String),

    #[error("broker error: {0}")]
    Other(String),
}

/// A partition is only unique together with its topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub topic: String,
    pub partition: i32,
}

impl PartitionKey {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// One message read from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub payload: Vec<u8>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: DateTime<Utc>,
}

impl Record {
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::new(self.topic.clone(), self.partition)
    }
}

/// Capabilities the pipeline needs from a message broker.
///
/// `consume_one` is called only from the consume stage; `mark_committed`
/// only from the process stage.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Next record, or `None` when nothing arrived within the client's poll timeout
    async fn consume_one(&self) -> Result<Option<Record>, BrokerError>;

    /// Mark every record as processed so its offset gets committed
    async fn mark_committed(&self, records: &[Record]) -> Result<(), BrokerError>;

    /// Flush pending commits and release the client
    async fn close(&self);

    /// High-water offset of every partition of the subscribed topics
    async fn current_end_offsets(&self) -> Result<HashMap<PartitionKey, i64>, BrokerError>;
}

/// Highest `offset + 1` per partition, the position Kafka expects to be committed
pub fn commit_positions(records: &[Record]) -> HashMap<PartitionKey, i64> {
    let mut positions: HashMap<PartitionKey, i64> = HashMap::new();
    for record in records {
        let next = record.offset + 1;
        positions
            .entry(record.partition_key())
            .and_modify(|pos| *pos = (*pos).max(next))
            .or_insert(next);
    }
    positions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(topic: &str, partition: i32, offset: i64) -> Record {
        Record {
            payload: Vec::new(),
            topic: topic.to_string(),
            partition,
            offset,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_commit_positions_take_highest_offset_per_partition() {
        let records = vec![
            record("metrics", 0, 4),
            record("metrics", 1, 9),
            record("metrics", 0, 7),
            record("metrics", 0, 5),
            record("events", 0, 1),
        ];

        let positions = commit_positions(&records);
        assert_eq!(positions.len(), 3);
        assert_eq!(positions[&PartitionKey::new("metrics", 0)], 8);
        assert_eq!(positions[&PartitionKey::new("metrics", 1)], 10);
        assert_eq!(positions[&PartitionKey::new("events", 0)], 2);
    }

    #[test]
    fn test_partition_key_display() {
        assert_eq!(PartitionKey::new("metrics", 3).to_string(), "metrics/3");
    }
}
