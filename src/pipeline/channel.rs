use crate::pipeline::accumulator::Batch;
use tokio::sync::mpsc;

pub type BatchSender = mpsc::Sender<Batch>;
pub type BatchReceiver = mpsc::Receiver<Batch>;

/// Bounded queue of completed batches between the consume and process stages.
///
/// Sending blocks while `capacity` batches are waiting.
pub fn batch_queue(capacity: usize) -> (BatchSender, BatchReceiver) {
    mpsc::channel(capacity.max(1))
}
