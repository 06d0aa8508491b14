use crate::config::InfluxConfig;
use crate::sink::{Sink, SinkBatch, SinkError};
use async_trait::async_trait;
use tracing::debug;

/// HTTP client for the InfluxDB 1.x `/write` endpoint
#[derive(Debug)]
pub struct InfluxSink {
    client: reqwest::Client,
    write_url: String,
    query: Vec<(&'static str, String)>,
    credentials: Option<(String, String)>,
}

impl InfluxSink {
    pub fn new(config: &InfluxConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.as_str())
            .build()?;

        let query = [
            ("db", &config.database),
            ("rp", &config.retention_policy),
            ("precision", &config.precision),
            ("consistency", &config.write_consistency),
        ]
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| (key, value.clone()))
        .collect();

        let credentials = if config.user.is_empty() {
            None
        } else {
            Some((config.user.clone(), config.password.clone()))
        };

        Ok(Self {
            client,
            write_url: format!("{}/write", config.url.trim_end_matches('/')),
            query,
            credentials,
        })
    }
}

#[async_trait]
impl Sink for InfluxSink {
    fn new_batch(&self) -> SinkBatch {
        SinkBatch::new()
    }

    async fn write(&self, batch: SinkBatch) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut request = self
            .client
            .post(&self.write_url)
            .query(&self.query)
            .body(batch.to_lines());
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(SinkError::Server {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        debug!(points = batch.len(), "Wrote points to influx");
        Ok(())
    }
}
