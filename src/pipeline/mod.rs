pub mod accumulator;
pub mod channel;
pub mod runner;
pub mod watermark;

pub use accumulator::{AccumulateError, Batch, BatchAccumulator};
pub use channel::{batch_queue, BatchReceiver, BatchSender};
pub use runner::{
    Pipeline, PipelineError, PipelineMode, PipelineState, PipelineSummary, StopHandle,
};
pub use watermark::{PartitionWatermark, WatermarkTracker};
