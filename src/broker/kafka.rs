use crate::broker::{commit_positions, BrokerError, Consumer, PartitionKey, Record};
use crate::config::{KafkaConfig, OffsetsInitial};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::{CommitMode, Consumer as RdConsumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// [`Consumer`] backed by librdkafka.
///
/// Offsets are stored locally by `mark_committed` and flushed to the group
/// coordinator by librdkafka's auto-commit timer, plus a final synchronous
/// commit on `close`.
pub struct KafkaConsumer {
    consumer: Arc<StreamConsumer>,
    topics: Vec<String>,
    poll_timeout: Duration,
    /// Partitions were assigned manually (backfill) instead of through a group subscription
    assigned: bool,
    closed: AtomicBool,
}

impl KafkaConsumer {
    /// Join the consumer group and subscribe to the configured topics
    pub fn subscribe(config: &KafkaConfig) -> Result<Self, BrokerError> {
        let consumer = create_consumer(config, config.offsets_initial)?;
        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics)?;

        info!(
            brokers = %config.brokers.join(","),
            topics = %config.topics.join(","),
            group = %config.consumer_group,
            "Subscribed kafka consumer"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            topics: config.topics.clone(),
            poll_timeout: config.poll_timeout,
            assigned: false,
            closed: AtomicBool::new(false),
        })
    }

    /// Assign every partition of the configured topics starting at the oldest retained offset
    pub async fn backfill(config: &KafkaConfig) -> Result<Self, BrokerError> {
        let consumer = Arc::new(create_consumer(config, OffsetsInitial::Oldest)?);

        let assign_consumer = Arc::clone(&consumer);
        let topics = config.topics.clone();
        let assigned_partitions = tokio::task::spawn_blocking(move || {
            let mut tpl = TopicPartitionList::new();
            for topic in &topics {
                for partition in topic_partitions(&assign_consumer, topic)? {
                    tpl.add_partition_offset(topic, partition, Offset::Beginning)?;
                }
            }
            assign_consumer.assign(&tpl)?;
            Ok::<usize, BrokerError>(tpl.count())
        })
        .await??;

        info!(
            brokers = %config.brokers.join(","),
            topics = %config.topics.join(","),
            partitions = assigned_partitions,
            "Assigned kafka partitions for backfill"
        );

        Ok(Self {
            consumer,
            topics: config.topics.clone(),
            poll_timeout: config.poll_timeout,
            assigned: true,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Consumer for KafkaConsumer {
    async fn consume_one(&self) -> Result<Option<Record>, BrokerError> {
        let message = match tokio::time::timeout(self.poll_timeout, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(result) => result?,
        };

        let timestamp = message
            .timestamp()
            .to_millis()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        Ok(Some(Record {
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            timestamp,
        }))
    }

    async fn mark_committed(&self, records: &[Record]) -> Result<(), BrokerError> {
        let positions = commit_positions(records);
        if positions.is_empty() {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        for (key, position) in &positions {
            tpl.add_partition_offset(&key.topic, key.partition, Offset::Offset(*position))?;
        }
        self.consumer.store_offsets(&tpl)?;

        debug!(partitions = positions.len(), "Stored offsets for commit");
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("Closing kafka consumer");
        let consumer = Arc::clone(&self.consumer);
        let assigned = self.assigned;
        let result = tokio::task::spawn_blocking(move || {
            match consumer.commit_consumer_state(CommitMode::Sync) {
                Ok(()) => {}
                Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {
                    debug!("No stored offsets to commit on close");
                }
                Err(e) => warn!(error = %e, "Final offset commit failed"),
            }
            if assigned {
                consumer.unassign()
            } else {
                consumer.unsubscribe();
                Ok(())
            }
        })
        .await;

        match result {
            Ok(Ok(())) => info!("Kafka consumer closed"),
            Ok(Err(e)) => warn!(error = %e, "Failed to release kafka partitions"),
            Err(e) => warn!(error = %e, "Kafka close task failed"),
        }
    }

    async fn current_end_offsets(&self) -> Result<HashMap<PartitionKey, i64>, BrokerError> {
        let consumer = Arc::clone(&self.consumer);
        let topics = self.topics.clone();

        tokio::task::spawn_blocking(move || {
            let mut offsets = HashMap::new();
            for topic in &topics {
                for partition in topic_partitions(&consumer, topic)? {
                    let (_low, high) =
                        consumer.fetch_watermarks(topic, partition, METADATA_TIMEOUT)?;
                    offsets.insert(PartitionKey::new(topic.clone(), partition), high);
                }
            }
            Ok(offsets)
        })
        .await?
    }
}

fn create_consumer(
    config: &KafkaConfig,
    offsets_initial: OffsetsInitial,
) -> Result<StreamConsumer, BrokerError> {
    let client_id = config.client_id.clone().unwrap_or_else(default_client_id);
    let consumer = client_config(config, &client_id, offsets_initial).create()?;
    Ok(consumer)
}

fn client_config(
    config: &KafkaConfig,
    client_id: &str,
    offsets_initial: OffsetsInitial,
) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.brokers.join(","))
        .set("group.id", &config.consumer_group)
        .set("client.id", client_id)
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false")
        .set(
            "auto.commit.interval.ms",
            config.commit_interval.as_millis().to_string(),
        )
        .set(
            "session.timeout.ms",
            config.session_timeout.as_millis().to_string(),
        )
        .set("auto.offset.reset", offsets_initial.as_reset_policy());

    if config.logging_enabled {
        client_config
            .set("debug", "consumer,cgrp,topic,fetch")
            .set_log_level(RDKafkaLogLevel::Debug);
    }

    for (key, value) in &config.properties {
        client_config.set(key, value);
    }

    client_config
}

fn default_client_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.to_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "localhost".to_string());
    format!("kandi-{}-{}", host, uuid::Uuid::new_v4())
}

fn topic_partitions(consumer: &StreamConsumer, topic: &str) -> Result<Vec<i32>, BrokerError> {
    let metadata = consumer.fetch_metadata(Some(topic), METADATA_TIMEOUT)?;
    let partitions: Vec<i32> = metadata
        .topics()
        .iter()
        .filter(|t| t.name() == topic)
        .flat_map(|t| t.partitions().iter().map(|p| p.id()))
        .collect();

    if partitions.is_empty() {
        return Err(BrokerError::UnknownTopic(topic.to_string()));
    }
    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kafka_config() -> KafkaConfig {
        serde_yaml::from_str(
            r#"
brokers: [kafka-1:9092, kafka-2:9092]
topics: [metrics]
consumer_group: kandi-test
commit_interval: 2s
properties:
  fetch.min.bytes: "1024"
  enable.auto.commit: "false"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_client_config_stores_offsets_manually() {
        let config = client_config(&kafka_config(), "client-1", OffsetsInitial::Oldest);

        assert_eq!(config.get("bootstrap.servers"), Some("kafka-1:9092,kafka-2:9092"));
        assert_eq!(config.get("group.id"), Some("kandi-test"));
        assert_eq!(config.get("client.id"), Some("client-1"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("auto.commit.interval.ms"), Some("2000"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(config.get("debug"), None);
    }

    #[test]
    fn test_properties_override_defaults() {
        let config = client_config(&kafka_config(), "client-1", OffsetsInitial::Newest);

        assert_eq!(config.get("fetch.min.bytes"), Some("1024"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
    }

    #[test]
    fn test_logging_enables_debug_contexts() {
        let mut kafka = kafka_config();
        kafka.logging_enabled = true;
        let config = client_config(&kafka, "client-1", OffsetsInitial::Oldest);
        assert_eq!(config.get("debug"), Some("consumer,cgrp,topic,fetch"));
    }

    #[test]
    fn test_default_client_id_is_unique() {
        let a = default_client_id();
        let b = default_client_id();
        assert!(a.starts_with("kandi-"));
        assert_ne!(a, b);
    }
}
