use crate::sink::{Sink, SinkBatch, SinkError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// In-process [`Sink`] with scripted failures.
///
/// Every write attempt is recorded, failed ones included. Once the scripted
/// failures run out, writes succeed.
#[derive(Debug, Default)]
pub struct MemorySink {
    failures: Mutex<VecDeque<(u16, String)>>,
    attempts: Mutex<Vec<SinkBatch>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next write answer with this status and body
    pub fn push_failure(&self, status: u16, message: impl Into<String>) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push_back((status, message.into()));
        }
    }

    /// Every batch passed to `write`, in call order
    pub fn attempts(&self) -> Vec<SinkBatch> {
        self.attempts
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    pub fn write_count(&self) -> usize {
        self.attempts.lock().map(|a| a.len()).unwrap_or(0)
    }

    /// Total points across all attempts, retries counted again
    pub fn point_count(&self) -> usize {
        self.attempts
            .lock()
            .map(|a| a.iter().map(SinkBatch::len).sum())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn new_batch(&self) -> SinkBatch {
        SinkBatch::new()
    }

    async fn write(&self, batch: SinkBatch) -> Result<(), SinkError> {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push(batch);
        }

        let failure = self.failures.lock().ok().and_then(|mut f| f.pop_front());
        match failure {
            Some((status, message)) => Err(SinkError::Server { status, message }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Point;

    #[tokio::test]
    async fn test_scripted_failure_then_success() {
        let sink = MemorySink::new();
        sink.push_failure(500, "timeout");

        let mut batch = sink.new_batch();
        batch.add_point(Point::new("m").field("v", 1.0));

        let err = sink.write(batch.clone()).await.unwrap_err();
        assert!(err.to_string().contains("timeout"));
        sink.write(batch.clone()).await.unwrap();

        assert_eq!(sink.write_count(), 2);
        assert_eq!(sink.point_count(), 2);
        assert_eq!(sink.attempts()[0], sink.attempts()[1]);
    }
}
