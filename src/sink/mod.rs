pub mod classify;
pub mod influx;
pub mod memory;
pub mod point;

use async_trait::async_trait;
use thiserror::Error;

pub use classify::{DegradationKind, WriteClassifier, WriteOutcome};
pub use influx::InfluxSink;
pub use memory::MemorySink;
pub use point::{FieldValue, Point};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sink returned error status {status}: {message}")]
    Server { status: u16, message: String },

    #[error("sink error: {0}")]
    Other(String),
}

/// Points submitted to the sink in one write.
///
/// A batch is handed to [`Sink::write`] by value, so every retry builds a
/// fresh one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkBatch {
    points: Vec<Point>,
}

impl SinkBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
        }
    }

    pub fn add_point(&mut self, point: Point) {
        self.points.push(point);
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Line protocol body, one point per line
    pub fn to_lines(&self) -> String {
        self.points
            .iter()
            .map(Point::to_line)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Extend<Point> for SinkBatch {
    fn extend<I: IntoIterator<Item = Point>>(&mut self, iter: I) {
        self.points.extend(iter);
    }
}

/// Destination for parsed points
#[async_trait]
pub trait Sink: Send + Sync {
    /// Empty batch to fill with points for [`write`](Self::write)
    fn new_batch(&self) -> SinkBatch;

    async fn write(&self, batch: SinkBatch) -> Result<(), SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_renders_one_line_per_point() {
        let mut batch = SinkBatch::new();
        assert!(batch.is_empty());

        batch.add_point(Point::new("cpu").tag("host", "a").field("value", 1.5));
        batch.extend([Point::new("mem").field("used", 10i64).timestamp(42)]);

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.to_lines(), "cpu,host=a value=1.5\nmem used=10i 42");
    }

    #[test]
    fn test_server_error_message_keeps_body() {
        let err = SinkError::Server {
            status: 400,
            message: "partial write: points beyond retention policy dropped=1".to_string(),
        };
        assert!(err.to_string().contains("partial write"));
        assert!(err.to_string().contains("400"));
    }
}
