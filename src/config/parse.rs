use super::types::*;
use crate::config::{expand_env_vars, unexpanded_env_vars};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

const VALID_PRECISIONS: &[&str] = &["", "ns", "n", "u", "ms", "s", "m", "h"];
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml_string = fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    load_config_str(&yaml_string)
}

/// Parse and validate a config held in memory
pub fn load_config_str(yaml: &str) -> Result<Config, ConfigError> {
    // Expand environment variables in the YAML string before parsing
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    let config: Config = serde_yaml::from_str(&yaml_string)?;
    validate_config(&config)?;

    Ok(config)
}

fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let unexpanded = unexpanded_env_vars(yaml_string);
    if unexpanded.is_empty() {
        return Ok(());
    }

    Err(ConfigError::Validation(format!(
        "environment variables are not set: {}\n\
         \n\
         Either export them or replace the $env{{...}} references in the config file",
        unexpanded.join(", ")
    )))
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    validate_kandi(&config.kandi, &mut errors);
    validate_kafka(&config.kafka, &mut errors);
    validate_influx(&config.influx, &mut errors);

    if config.metrics.enabled && config.metrics.listen.parse::<SocketAddr>().is_err() {
        errors.push(format!(
            "metrics.listen: '{}' is not a valid socket address",
            config.metrics.listen
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_kandi(kandi: &KandiConfig, errors: &mut Vec<String>) {
    if kandi.batch.size == 0 {
        errors.push("kandi.batch.size must be greater than 0".to_string());
    }
    if kandi.queue_capacity == 0 {
        errors.push("kandi.queue_capacity must be greater than 0".to_string());
    }
    if !VALID_LOG_LEVELS.contains(&kandi.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "kandi.log_level: '{}' is not one of {}",
            kandi.log_level,
            VALID_LOG_LEVELS.join(", ")
        ));
    }
    if let Some(interval) = kandi.backoff.interval {
        if !kandi.backoff.max.is_zero() && kandi.backoff.max < interval {
            errors.push(format!(
                "kandi.backoff.max ({:?}) must not be smaller than kandi.backoff.interval ({:?})",
                kandi.backoff.max, interval
            ));
        }
    }
}

fn validate_kafka(kafka: &KafkaConfig, errors: &mut Vec<String>) {
    if kafka.brokers.is_empty() {
        errors.push("kafka.brokers must contain at least one broker".to_string());
    }
    if kafka.topics.is_empty() {
        errors.push("kafka.topics must contain at least one topic".to_string());
    }
    if kafka.consumer_group.trim().is_empty() {
        errors.push("kafka.consumer_group cannot be empty".to_string());
    }
    if kafka.poll_timeout.is_zero() {
        errors.push("kafka.poll_timeout must be greater than 0".to_string());
    }
}

fn validate_influx(influx: &InfluxConfig, errors: &mut Vec<String>) {
    if influx.url.trim().is_empty() {
        errors.push("influx.url cannot be empty".to_string());
    } else if !influx.url.starts_with("http://") && !influx.url.starts_with("https://") {
        errors.push(format!(
            "influx.url: '{}' must start with http:// or https://",
            influx.url
        ));
    }
    if influx.database.trim().is_empty() {
        errors.push("influx.database cannot be empty".to_string());
    }
    if !VALID_PRECISIONS.contains(&influx.precision.as_str()) {
        errors.push(format!(
            "influx.precision: '{}' is not one of ns, n, u, ms, s, m, h",
            influx.precision
        ));
    }
}
