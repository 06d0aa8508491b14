use crate::backoff::BackoffHandler;
use crate::broker::{BrokerError, Consumer};
use crate::config::KandiConfig;
use crate::metrics::Metrics;
use crate::parser::Parser;
use crate::pipeline::accumulator::{AccumulateError, Batch, BatchAccumulator};
use crate::pipeline::channel::{batch_queue, BatchReceiver, BatchSender};
use crate::pipeline::watermark::WatermarkTracker;
use crate::sink::{Point, Sink, WriteClassifier, WriteOutcome};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors that end a pipeline run before or instead of a normal stop
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline was already started")]
    AlreadyStarted,

    #[error("failed to capture backfill watermarks: {0}")]
    Watermark(#[source] BrokerError),

    #[error("pipeline task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PipelineMode {
    /// Run until stopped
    #[default]
    Normal,
    /// Run until every partition passed the end offset captured at start
    Backfill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// Requests a running pipeline to stop. Cloneable and safe to trigger more than once.
#[derive(Debug, Clone)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// What one call to [`Pipeline::start`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub batches_consumed: u64,
    pub records_consumed: u64,
    pub batches_committed: u64,
    pub records_committed: u64,
    pub points_written: u64,
    pub parse_failures: u64,
    /// Backfill ended because every partition passed its watermark
    pub backfill_complete: bool,
}

#[derive(Debug, Default)]
struct ConsumeStats {
    batches: u64,
    records: u64,
}

#[derive(Debug, Default)]
struct ProcessStats {
    batches_committed: u64,
    records_committed: u64,
    points_written: u64,
    parse_failures: u64,
    backfill_complete: bool,
}

/// Broker to sink pipeline with a consume stage and a process stage joined
/// by a bounded queue of batches
pub struct Pipeline {
    config: KandiConfig,
    mode: PipelineMode,
    consumer: Arc<dyn Consumer>,
    sink: Arc<dyn Sink>,
    parser: Arc<dyn Parser>,
    classifier: WriteClassifier,
    metrics: Arc<Metrics>,
    stop: CancellationToken,
    state: watch::Sender<PipelineState>,
    started: AtomicBool,
}

impl Pipeline {
    pub fn new(
        config: KandiConfig,
        consumer: Arc<dyn Consumer>,
        sink: Arc<dyn Sink>,
        parser: Arc<dyn Parser>,
    ) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            config,
            mode: PipelineMode::Normal,
            consumer,
            sink,
            parser,
            classifier: WriteClassifier::default(),
            metrics: Arc::new(Metrics::new()),
            stop: CancellationToken::new(),
            state,
            started: AtomicBool::new(false),
        }
    }

    pub fn with_mode(mut self, mode: PipelineMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_classifier(mut self, classifier: WriteClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn mode(&self) -> PipelineMode {
        self.mode
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            token: self.stop.clone(),
        }
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Run both stages until stopped, or in backfill mode until the
    /// captured watermarks are passed or the topic goes idle.
    ///
    /// The broker collaborator is closed before this returns.
    pub async fn start(&self) -> Result<PipelineSummary, PipelineError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::AlreadyStarted);
        }

        let watermarks = match self.mode {
            PipelineMode::Normal => None,
            PipelineMode::Backfill => match WatermarkTracker::capture(&*self.consumer).await {
                Ok(tracker) => Some(tracker),
                Err(e) => {
                    self.consumer.close().await;
                    self.state.send_replace(PipelineState::Stopped);
                    return Err(PipelineError::Watermark(e));
                }
            },
        };

        info!(
            mode = ?self.mode,
            batch_size = self.config.batch.size,
            batch_duration_ms = self.config.batch.duration.as_millis() as u64,
            queue_capacity = self.config.queue_capacity,
            "Starting pipeline"
        );
        self.state.send_replace(PipelineState::Running);

        let (tx, rx) = batch_queue(self.config.queue_capacity);

        let mut accumulator = BatchAccumulator::new(self.consumer.clone(), &self.config.batch)
            .with_stop(self.stop.clone());
        if self.mode == PipelineMode::Backfill {
            accumulator = accumulator.with_idle_timeout(self.config.backfill.idle_timeout);
        }

        let consume = ConsumeStage {
            accumulator,
            output: tx,
            backoff: BackoffHandler::new("broker", &self.config.backoff)
                .with_metrics(self.metrics.clone()),
            metrics: self.metrics.clone(),
            stop: self.stop.clone(),
        };
        let process = ProcessStage {
            input: rx,
            consumer: self.consumer.clone(),
            sink: self.sink.clone(),
            parser: self.parser.clone(),
            classifier: self.classifier.clone(),
            backoff: BackoffHandler::new("sink", &self.config.backoff)
                .with_metrics(self.metrics.clone()),
            metrics: self.metrics.clone(),
            watermarks,
            stop: self.stop.clone(),
            stats: ProcessStats::default(),
        };

        let consume_handle = tokio::spawn(consume.run());
        let process_handle = tokio::spawn(process.run());

        // The consume stage ends first: on stop, on an idle backfill, or when
        // the process stage hung up.
        let consumed = consume_handle.await;
        self.state.send_replace(PipelineState::Draining);
        info!("Pipeline draining");

        let processed = process_handle.await;
        self.consumer.close().await;
        self.state.send_replace(PipelineState::Stopped);

        let consumed = consumed?;
        let processed = processed?;
        let summary = PipelineSummary {
            batches_consumed: consumed.batches,
            records_consumed: consumed.records,
            batches_committed: processed.batches_committed,
            records_committed: processed.records_committed,
            points_written: processed.points_written,
            parse_failures: processed.parse_failures,
            backfill_complete: processed.backfill_complete,
        };

        info!(
            batches = summary.batches_committed,
            records = summary.records_committed,
            points = summary.points_written,
            "Pipeline stopped"
        );
        Ok(summary)
    }
}

struct ConsumeStage {
    accumulator: BatchAccumulator,
    output: BatchSender,
    backoff: BackoffHandler,
    metrics: Arc<Metrics>,
    stop: CancellationToken,
}

impl ConsumeStage {
    async fn run(mut self) -> ConsumeStats {
        let mut stats = ConsumeStats::default();
        debug!("Consume stage started");

        while !self.stop.is_cancelled() {
            let started = Instant::now();
            match self.accumulator.accumulate().await {
                Ok(batch) => {
                    if !self.enqueue(batch, started, &mut stats).await {
                        break;
                    }
                    if self.accumulator.is_idle() {
                        info!("No records within the backfill idle timeout, treating topics as drained");
                        break;
                    }
                }
                Err(AccumulateError { partial, source }) => {
                    warn!(
                        error = %source,
                        records = partial.len(),
                        "Broker read failed"
                    );
                    self.metrics.broker_error();

                    // Hand over what was read so a later commit cannot skip it
                    if !self.enqueue(partial, started, &mut stats).await {
                        break;
                    }
                    tokio::select! {
                        _ = self.backoff.handle() => {}
                        _ = self.stop.cancelled() => {}
                    }
                }
            }
        }

        debug!(batches = stats.batches, "Consume stage finished");
        stats
    }

    /// Push a batch downstream. False once the pipeline is stopping.
    async fn enqueue(&mut self, batch: Batch, started: Instant, stats: &mut ConsumeStats) -> bool {
        if batch.is_empty() {
            return true;
        }

        let len = batch.len();
        let elapsed = started.elapsed();

        tokio::select! {
            biased;
            result = self.output.send(batch) => {
                if result.is_err() {
                    debug!("Batch queue closed");
                    return false;
                }
                self.metrics.records_consumed(len as u64, elapsed);
                stats.batches += 1;
                stats.records += len as u64;
                debug!(records = len, "Queued batch");
                true
            }
            _ = self.stop.cancelled() => false,
        }
    }
}

struct ProcessStage {
    input: BatchReceiver,
    consumer: Arc<dyn Consumer>,
    sink: Arc<dyn Sink>,
    parser: Arc<dyn Parser>,
    classifier: WriteClassifier,
    backoff: BackoffHandler,
    metrics: Arc<Metrics>,
    watermarks: Option<WatermarkTracker>,
    stop: CancellationToken,
    stats: ProcessStats,
}

impl ProcessStage {
    async fn run(mut self) -> ProcessStats {
        debug!("Process stage started");

        if matches!(&self.watermarks, Some(w) if w.is_complete()) {
            info!("No partitions to backfill");
            self.stats.backfill_complete = true;
            self.stop.cancel();
        }

        loop {
            let batch = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                batch = self.input.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };

            if !self.process_batch(&batch).await {
                break;
            }

            if let Some(watermarks) = &mut self.watermarks {
                if watermarks.observe(batch.records()) {
                    info!("Backfill passed every partition watermark");
                    self.stats.backfill_complete = true;
                    self.stop.cancel();
                    break;
                }
            }
        }

        debug!(
            batches = self.stats.batches_committed,
            "Process stage finished"
        );
        self.stats
    }

    /// Write one batch until the sink accepts it, then commit its offsets.
    ///
    /// Returns false if the pipeline stopped before the batch was committed.
    async fn process_batch(&mut self, batch: &Batch) -> bool {
        let started = Instant::now();
        let points = self.parse_points(batch);

        loop {
            let outcome = self.write(&points).await;
            if outcome.should_commit() {
                self.commit(batch).await;
                self.metrics.batch_processed(started.elapsed());
                return true;
            }

            tokio::select! {
                _ = self.backoff.handle() => {}
                _ = self.stop.cancelled() => {}
            }
            if self.stop.is_cancelled() {
                warn!(
                    records = batch.len(),
                    "Stopping with an unwritten batch, its records will be redelivered"
                );
                return false;
            }
        }
    }

    fn parse_points(&mut self, batch: &Batch) -> Vec<Point> {
        let mut points = Vec::with_capacity(batch.len());
        for record in batch.records() {
            match self.parser.parse(&record.payload) {
                Ok(Some(point)) => points.push(point),
                Ok(None) => {}
                Err(e) => {
                    debug!(
                        partition = %record.partition_key(),
                        offset = record.offset,
                        error = %e,
                        "Dropping unparseable record"
                    );
                    self.metrics.parse_failure();
                    self.stats.parse_failures += 1;
                }
            }
        }
        points
    }

    async fn write(&mut self, points: &[Point]) -> WriteOutcome {
        if points.is_empty() {
            debug!("Batch has no points, skipping write");
            return WriteOutcome::Success;
        }

        let mut sink_batch = self.sink.new_batch();
        sink_batch.extend(points.iter().cloned());

        let result = self.sink.write(sink_batch).await;
        let outcome = self.classifier.classify(&result);
        match (&outcome, &result) {
            (WriteOutcome::Success, _) => {
                self.metrics.write_success(points.len() as u64);
                self.stats.points_written += points.len() as u64;
            }
            (WriteOutcome::AcceptableDegradation(kind), result) => {
                if let Err(e) = result {
                    warn!(points = points.len(), kind = ?kind, error = %e, "Sink accepted write with errors");
                }
                self.metrics.degraded(kind);
            }
            (WriteOutcome::Retryable, result) => {
                if let Err(e) = result {
                    warn!(points = points.len(), error = %e, "Sink write failed");
                }
                self.metrics.write_failure();
            }
        }
        outcome
    }

    async fn commit(&mut self, batch: &Batch) {
        match self.consumer.mark_committed(batch.records()).await {
            Ok(()) => {
                self.stats.batches_committed += 1;
                self.stats.records_committed += batch.len() as u64;
                debug!(records = batch.len(), "Marked batch committed");
            }
            Err(e) => {
                warn!(
                    records = batch.len(),
                    error = %e,
                    "Failed to mark offsets, records will be redelivered"
                );
                self.metrics.commit_failure();
            }
        }
    }
}
