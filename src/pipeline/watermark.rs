use crate::broker::{BrokerError, Consumer, PartitionKey, Record};
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionWatermark {
    /// End offset captured when the backfill started
    pub mark: i64,
    /// Never reverts once set
    pub finished: bool,
}

/// Decides when a backfill has read past the data that existed at its start
#[derive(Debug, Clone, Default)]
pub struct WatermarkTracker {
    partitions: HashMap<PartitionKey, PartitionWatermark>,
}

impl WatermarkTracker {
    /// Snapshot the current end offset of every subscribed partition
    pub async fn capture(consumer: &dyn Consumer) -> Result<Self, BrokerError> {
        let marks = consumer.current_end_offsets().await?;
        for (partition, mark) in &marks {
            debug!(partition = %partition, mark = mark, "Captured backfill watermark");
        }
        info!(partitions = marks.len(), "Captured backfill watermarks");
        Ok(Self::from_marks(marks))
    }

    pub fn from_marks(marks: HashMap<PartitionKey, i64>) -> Self {
        let partitions = marks
            .into_iter()
            .map(|(key, mark)| {
                (
                    key,
                    PartitionWatermark {
                        mark,
                        finished: false,
                    },
                )
            })
            .collect();
        Self { partitions }
    }

    /// Mark partitions whose records passed their watermark.
    ///
    /// Returns true once every partition has finished. Records from
    /// partitions that were not captured are ignored.
    pub fn observe(&mut self, records: &[Record]) -> bool {
        for record in records {
            let key = record.partition_key();
            if let Some(watermark) = self.partitions.get_mut(&key) {
                if !watermark.finished && record.offset > watermark.mark {
                    watermark.finished = true;
                    debug!(
                        partition = %key,
                        mark = watermark.mark,
                        offset = record.offset,
                        "Partition passed backfill watermark"
                    );
                }
            }
        }
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.partitions.values().all(|w| w.finished)
    }

    pub fn get(&self, key: &PartitionKey) -> Option<&PartitionWatermark> {
        self.partitions.get(key)
    }

    pub fn remaining(&self) -> usize {
        self.partitions.values().filter(|w| !w.finished).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{record, MemoryConsumer};

    fn tracker(marks: &[(i32, i64)]) -> WatermarkTracker {
        WatermarkTracker::from_marks(
            marks
                .iter()
                .map(|(p, mark)| (PartitionKey::new("metrics", *p), *mark))
                .collect(),
        )
    }

    #[test]
    fn test_completes_only_after_every_partition_passes_mark() {
        let mut tracker = tracker(&[(0, 10), (1, 5)]);

        assert!(!tracker.observe(&[record("metrics", 0, 10, ""), record("metrics", 1, 5, "")]));
        assert!(!tracker.observe(&[record("metrics", 0, 11, "")]));
        assert_eq!(tracker.remaining(), 1);
        assert!(tracker.observe(&[record("metrics", 1, 6, "")]));
    }

    #[test]
    fn test_interleaving_does_not_matter() {
        let mut tracker = tracker(&[(0, 10), (1, 5)]);

        assert!(!tracker.observe(&[record("metrics", 1, 6, "")]));
        assert!(tracker.observe(&[record("metrics", 0, 3, ""), record("metrics", 0, 12, "")]));
    }

    #[test]
    fn test_finished_is_monotonic() {
        let mut tracker = tracker(&[(0, 10), (1, 5)]);
        tracker.observe(&[record("metrics", 0, 11, "")]);

        // an older offset replayed after a rebalance must not unfinish the partition
        tracker.observe(&[record("metrics", 0, 2, "")]);
        assert!(tracker.get(&PartitionKey::new("metrics", 0)).unwrap().finished);
    }

    #[test]
    fn test_unknown_partitions_are_ignored() {
        let mut tracker = tracker(&[(0, 10)]);

        assert!(!tracker.observe(&[record("metrics", 7, 100, ""), record("other", 0, 100, "")]));
        assert_eq!(tracker.remaining(), 1);
    }

    #[tokio::test]
    async fn test_capture_reads_end_offsets() {
        let consumer = MemoryConsumer::new();
        consumer.set_end_offset(PartitionKey::new("metrics", 0), 10);
        consumer.set_end_offset(PartitionKey::new("metrics", 1), 5);

        let tracker = WatermarkTracker::capture(&consumer).await.unwrap();
        assert_eq!(
            tracker.get(&PartitionKey::new("metrics", 1)),
            Some(&PartitionWatermark {
                mark: 5,
                finished: false
            })
        );
        assert_eq!(tracker.remaining(), 2);
        assert!(!tracker.is_complete());
    }
}
