use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub kandi: KandiConfig,
    pub kafka: KafkaConfig,
    pub influx: InfluxConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KandiConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Number of completed batches that may wait between the consume and process stages
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub backfill: BackfillConfig,
}

impl Default for KandiConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            queue_capacity: default_queue_capacity(),
            batch: BatchConfig::default(),
            backoff: BackoffConfig::default(),
            backfill: BackfillConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_queue_capacity() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub size: usize,
    /// Zero means the size bound alone ends a batch
    #[serde(with = "duration_format", default)]
    pub duration: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: 1000,
            duration: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// `None` disables backoff entirely
    #[serde(with = "backoff_interval", default = "default_backoff_interval")]
    pub interval: Option<Duration>,
    /// Zero means unbounded doubling
    #[serde(with = "duration_format", default)]
    pub max: Duration,
    /// Zero disables resetting
    #[serde(with = "duration_format", default)]
    pub reset: Duration,
}

fn default_backoff_interval() -> Option<Duration> {
    Some(Duration::from_millis(100))
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            interval: default_backoff_interval(),
            max: Duration::from_secs(30),
            reset: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Stop a backfill once no records arrived for this long. Zero waits forever.
    #[serde(with = "duration_format", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
        }
    }
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    #[serde(deserialize_with = "comma_list::deserialize")]
    pub brokers: Vec<String>,
    #[serde(deserialize_with = "comma_list::deserialize")]
    pub topics: Vec<String>,
    pub consumer_group: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub offsets_initial: OffsetsInitial,
    #[serde(with = "duration_format", default = "default_poll_timeout")]
    pub poll_timeout: Duration,
    #[serde(with = "duration_format", default = "default_commit_interval")]
    pub commit_interval: Duration,
    #[serde(with = "duration_format", default = "default_session_timeout")]
    pub session_timeout: Duration,
    #[serde(default)]
    pub logging_enabled: bool,
    /// Raw librdkafka settings applied last
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

fn default_poll_timeout() -> Duration {
    Duration::from_millis(100)
}

fn default_commit_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetsInitial {
    #[default]
    Oldest,
    Newest,
}

impl OffsetsInitial {
    /// Value for librdkafka's `auto.offset.reset`
    pub fn as_reset_policy(&self) -> &'static str {
        match self {
            OffsetsInitial::Oldest => "earliest",
            OffsetsInitial::Newest => "latest",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxConfig {
    pub url: String,
    pub database: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(with = "duration_format", default = "default_influx_timeout")]
    pub timeout: Duration,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub precision: String,
    #[serde(default)]
    pub retention_policy: String,
    #[serde(default)]
    pub write_consistency: String,
    /// Error substrings that still count as a completed write
    #[serde(default = "default_accepted_errors")]
    pub accepted_errors: Vec<String>,
}

fn default_influx_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_user_agent() -> String {
    format!("kandi/{}", env!("CARGO_PKG_VERSION"))
}

pub fn default_accepted_errors() -> Vec<String> {
    vec!["partial write".to_string(), "field type conflict".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> String {
    "127.0.0.1:8089".to_string()
}

/// Durations are either integer milliseconds or humantime strings ("250ms", "5s", "1m 30s").
mod duration_format {
    use humantime_serde::re::humantime;
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Millis(u64),
        Text(String),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawDuration::deserialize(deserializer)? {
            RawDuration::Millis(ms) => Ok(Duration::from_millis(ms)),
            RawDuration::Text(s) => parse_text(&s).map_err(serde::de::Error::custom),
        }
    }

    pub(super) fn parse_text(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration string".to_string());
        }
        if let Ok(ms) = s.parse::<u64>() {
            return Ok(Duration::from_millis(ms));
        }
        humantime::parse_duration(s).map_err(|e| format!("invalid duration '{}': {}", s, e))
    }
}

/// Like `duration_format`, but "disabled" or any negative value turns backoff off.
mod backoff_interval {
    use humantime_serde::re::humantime;
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawInterval {
        Millis(i64),
        Text(String),
    }

    pub fn serialize<S>(interval: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match interval {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_str("disabled"),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawInterval::deserialize(deserializer)? {
            RawInterval::Millis(ms) if ms < 0 => Ok(None),
            RawInterval::Millis(ms) => Ok(Some(Duration::from_millis(ms as u64))),
            RawInterval::Text(s) => {
                let s = s.trim();
                if s.eq_ignore_ascii_case("disabled") || s.starts_with('-') {
                    Ok(None)
                } else {
                    super::duration_format::parse_text(s)
                        .map(Some)
                        .map_err(serde::de::Error::custom)
                }
            }
        }
    }
}

/// Accepts either a YAML list or a single comma separated string ("a:9092,b:9092").
mod comma_list {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawList {
        List(Vec<String>),
        Joined(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let items = match RawList::deserialize(deserializer)? {
            RawList::List(items) => items,
            RawList::Joined(joined) => joined.split(',').map(str::to_string).collect(),
        };
        Ok(items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect())
    }
}
