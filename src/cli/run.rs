use crate::broker::{BrokerError, Consumer, KafkaConsumer};
use crate::config::Config;
use crate::metrics::{describe_metrics, run_metrics_server, Metrics};
use crate::parser::LineProtocolParser;
use crate::pipeline::{Pipeline, PipelineError, PipelineMode, PipelineSummary};
use crate::sink::{InfluxSink, SinkError, WriteClassifier};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("invalid metrics listen address '{0}'")]
    MetricsAddress(String),

    #[error("failed to bind metrics server: {0}")]
    MetricsBind(#[source] std::io::Error),
}

/// Run the Kafka to InfluxDB pipeline until Ctrl+C, or until a backfill finishes
pub async fn run(config: Config, mode: PipelineMode) -> Result<PipelineSummary, RunError> {
    let metrics_addr = if config.metrics.enabled {
        let addr: SocketAddr = config
            .metrics
            .listen
            .parse()
            .map_err(|_| RunError::MetricsAddress(config.metrics.listen.clone()))?;
        Some(addr)
    } else {
        None
    };

    info!(url = %config.influx.url, database = %config.influx.database, "Creating influx sink");
    let sink = Arc::new(InfluxSink::new(&config.influx)?);

    let consumer: Arc<dyn Consumer> = match mode {
        PipelineMode::Normal => Arc::new(KafkaConsumer::subscribe(&config.kafka)?),
        PipelineMode::Backfill => Arc::new(KafkaConsumer::backfill(&config.kafka).await?),
    };

    describe_metrics();
    let metrics = Arc::new(Metrics::new());
    let pipeline = Pipeline::new(
        config.kandi.clone(),
        consumer.clone(),
        sink,
        Arc::new(LineProtocolParser::new()),
    )
    .with_mode(mode)
    .with_classifier(WriteClassifier::new(config.influx.accepted_errors.clone()))
    .with_metrics(metrics.clone());

    let shutdown = CancellationToken::new();
    let metrics_handle = match metrics_addr {
        Some(addr) => {
            let listener = match TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    consumer.close().await;
                    return Err(RunError::MetricsBind(e));
                }
            };
            Some(tokio::spawn(run_metrics_server(
                listener,
                metrics,
                shutdown.clone(),
            )))
        }
        None => None,
    };

    let stop = pipeline.stop_handle();
    let signal_handle = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            stop.stop();
        }
    });

    info!(mode = ?mode, "Pipeline started, press Ctrl+C to shutdown");
    let result = pipeline.start().await;

    signal_handle.abort();
    shutdown.cancel();
    if let Some(handle) = metrics_handle {
        match handle.await {
            Ok(Ok(())) => info!("Metrics server stopped"),
            Ok(Err(e)) => error!(error = %e, "Metrics server error"),
            Err(e) => error!(error = %e, "Metrics server join error"),
        }
    }

    let summary = result?;
    if mode == PipelineMode::Backfill {
        info!(
            complete = summary.backfill_complete,
            records = summary.records_committed,
            "Backfill finished"
        );
    }
    info!("Pipeline shutdown complete");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_str;

    #[tokio::test]
    async fn test_bad_metrics_address_fails_before_connecting() {
        let mut config = load_config_str(
            r#"
kafka:
  brokers: [localhost:9092]
  topics: [metrics]
  consumer_group: kandi
influx:
  url: http://localhost:8086
  database: metrics
"#,
        )
        .unwrap();
        config.metrics.listen = "not-an-address".to_string();

        let err = run(config, PipelineMode::Normal).await.unwrap_err();
        assert!(matches!(err, RunError::MetricsAddress(addr) if addr == "not-an-address"));
    }
}
