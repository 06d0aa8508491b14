use crate::config::BackoffConfig;
use crate::metrics::Metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Growing wait applied after consecutive failures of one named operation.
///
/// Each stage owns its own handler ("broker", "sink"), so the state is never
/// shared between tasks.
#[derive(Debug)]
pub struct BackoffHandler {
    name: String,
    /// `None` disables backing off
    initial: Option<Duration>,
    /// Zero means unbounded
    max: Duration,
    /// Zero means never reset
    reset: Duration,
    current: Duration,
    /// When the previous invocation started
    last: Option<Instant>,
    metrics: Option<Arc<Metrics>>,
}

impl BackoffHandler {
    pub fn new(name: impl Into<String>, config: &BackoffConfig) -> Self {
        Self {
            name: name.into(),
            initial: config.interval,
            max: config.max,
            reset: config.reset,
            current: config.interval.unwrap_or_default(),
            last: None,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.initial.is_some()
    }

    /// Interval the next call to [`handle`](Self::handle) will wait, ignoring a pending reset
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Wait out the current interval and double it for next time.
    ///
    /// More than `reset` since the previous invocation brings the interval
    /// back to its initial value first. No-op when disabled.
    pub async fn handle(&mut self) {
        let Some(initial) = self.initial else {
            return;
        };

        if !self.reset.is_zero() {
            if let Some(last) = self.last {
                if last.elapsed() > self.reset {
                    self.current = initial;
                }
            }
        }
        self.last = Some(Instant::now());

        let wait = self.current;
        info!(
            name = %self.name,
            wait_ms = wait.as_millis() as u64,
            "Backing off"
        );
        tokio::time::sleep(wait).await;

        self.current = self.next_interval(wait);

        if let Some(metrics) = &self.metrics {
            metrics.backoff(&self.name, self.current);
        }
    }

    fn next_interval(&self, wait: Duration) -> Duration {
        let doubled = wait.saturating_mul(2);
        if !self.max.is_zero() && doubled >= self.max {
            self.max
        } else {
            doubled
        }
    }
}
