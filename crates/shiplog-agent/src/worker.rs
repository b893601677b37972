// Copyright 2025-Present Shiplog, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The streaming worker: one dedicated task per streamed file.
//!
//! # State machine
//!
//! ```text
//!            ┌────────────────────────────────────────────┐
//!            v                                            │
//!   ┌──────────────┐   manual flush or interval   ┌───────┴──────┐
//!   │     Idle     │ ───────────────────────────> │   Flushing   │
//!   └──────┬───────┘                              └───────┬──────┘
//!          │                                 failure      │
//!          │  stop requested                 (backoff)    │
//!          v                                              v
//!   ┌──────────────┐                              ┌──────────────┐
//!   │   Stopped    │ <─────────────────────────── │  RetryWait   │
//!   └──────────────┘    fatal outcome / stop      └──────────────┘
//! ```
//!
//! One flush cycle is read → segment → build → compress → deliver →
//! checkpoint. The checkpoint is persisted only after the delivery outcome
//! is `Accepted`, so the durable offset never runs ahead of delivered data.
//!
//! # Signaling
//!
//! All cross-task coordination goes through atomic counters: stop requests,
//! flush requests, completed flush operations, and successful flush
//! operations, plus a last-flush-failed flag. Flush requests are counted,
//! not boolean: N requests require N completed cycles (success or failure)
//! to satisfy. A pending manual flush is still honored after a stop request
//! so shutdown can force one last drain. Waits block on a [`Notify`] with
//! short bounded timeouts rather than spinning; the bounded-timeout
//! semantics of every wait are preserved exactly.
//!
//! All mutable cycle state (offset, failure count, scratch buffers) is owned
//! by the worker task alone.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::compression::{compress, CompressionError, CompressionMode};
use crate::config::Settings;
use crate::delivery::{DeliveryOutcome, PayloadProcessor};
use crate::payload::{common_event_json, PayloadBuilder};
use crate::progress::ProgressMarker;
use crate::segment::LineSegmenter;

/// Idle wait granularity of the worker loop.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Poll granularity of [`WorkerHandle::flush_and_wait`].
const FLUSH_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A failure of one flush cycle. Every variant is retryable from the loop's
/// perspective except [`FlushError::DeliveryFatal`], which also stops the
/// worker.
#[derive(Debug, Error)]
pub enum FlushError {
    #[error("source log i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Compression(#[from] CompressionError),
    #[error("delivery failed with a retryable outcome")]
    DeliveryRetryable,
    #[error("delivery failed with a non-retryable outcome")]
    DeliveryFatal,
}

/// Atomic signal block shared by the worker task and its handles.
#[derive(Debug)]
struct WorkerSignals {
    /// Non-zero stops the worker (after any pending manual flush).
    stop_requests: AtomicU32,
    /// Number of manual flushes requested and not yet consumed.
    flush_requests: AtomicU32,
    /// Number of completed flush cycles, success or failure.
    flush_ops: AtomicU32,
    /// Number of successfully completed flush cycles.
    flush_successes: AtomicU32,
    /// Whether the most recent flush cycle failed.
    last_flush_failed: AtomicBool,
    /// Whether the most recent successful flush drained the whole file.
    last_flush_processed_everything: AtomicBool,
    /// Whether the worker task has fully exited.
    stopped: AtomicBool,
    /// Retry backoff base in milliseconds. Shortened during shutdown.
    retry_interval_millis: AtomicU64,
    /// Wakes the worker out of its idle wait.
    wake: Notify,
    /// Notified after every completed flush cycle and on worker exit.
    progress: Notify,
}

impl WorkerSignals {
    fn new(retry_interval_secs: f64) -> Self {
        WorkerSignals {
            stop_requests: AtomicU32::new(0),
            flush_requests: AtomicU32::new(0),
            flush_ops: AtomicU32::new(0),
            flush_successes: AtomicU32::new(0),
            last_flush_failed: AtomicBool::new(false),
            last_flush_processed_everything: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            retry_interval_millis: AtomicU64::new((retry_interval_secs * 1000.0) as u64),
            wake: Notify::new(),
            progress: Notify::new(),
        }
    }
}

/// Result of a [`WorkerHandle::flush_and_wait`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushWaitOutcome {
    /// Whether every awaited flush completed successfully within the
    /// timeout (and, if a stop was initiated, the worker fully stopped).
    pub succeeded: bool,
    /// Whether the last successful flush consumed everything the source
    /// file contained at that moment. Only meaningful when `succeeded`.
    pub processed_everything: bool,
}

/// Cloneable handle for signaling a [`StreamWorker`] from other tasks.
#[derive(Clone)]
pub struct WorkerHandle {
    signals: Arc<WorkerSignals>,
    marker: ProgressMarker,
}

impl WorkerHandle {
    /// Requests the worker to stop. One pending manual flush is still
    /// honored before the loop exits.
    pub fn request_stop(&self) {
        self.signals.stop_requests.fetch_add(1, Ordering::SeqCst);
        self.signals.wake.notify_one();
    }

    /// Requests one manual flush without waiting for it.
    pub fn request_flush(&self) {
        self.signals.flush_requests.fetch_add(1, Ordering::SeqCst);
        self.signals.wake.notify_one();
    }

    /// Shortens (or restores) the retry backoff base, e.g. during shutdown
    /// so a failed drain flush can still be retried within the drain window.
    pub fn set_retry_interval_secs(&self, secs: f64) {
        self.signals
            .retry_interval_millis
            .store((secs * 1000.0) as u64, Ordering::SeqCst);
    }

    /// Whether the worker task has fully exited.
    pub fn has_stopped(&self) -> bool {
        self.signals.stopped.load(Ordering::SeqCst)
    }

    /// Whether the most recent successful flush drained the whole file.
    pub fn last_flush_processed_everything(&self) -> bool {
        self.signals
            .last_flush_processed_everything
            .load(Ordering::SeqCst)
    }

    /// Deletes the progress marker. Only call once the file has been fully
    /// drained and the worker stopped.
    pub fn delete_progress_marker(&self) {
        self.marker.delete();
    }

    /// Requests `attempts` flushes and waits for each to complete, with an
    /// overall deadline per wait. Optionally clears the retry gate first
    /// (so a manual flush is allowed even while in backoff) and initiates a
    /// stop alongside the final flush, in which case full worker
    /// termination is also awaited.
    ///
    /// Returns an unsuccessful outcome immediately if a stop was already
    /// requested, and on any timeout.
    pub async fn flush_and_wait(
        &self,
        attempts: u32,
        clear_retry_timer: bool,
        initiate_stop: bool,
        timeout: Duration,
    ) -> FlushWaitOutcome {
        let mut outcome = FlushWaitOutcome {
            succeeded: true,
            processed_everything: false,
        };

        // A flush is impossible once a stop has been requested.
        if self.signals.stop_requests.load(Ordering::SeqCst) > 0 {
            outcome.succeeded = false;
            return outcome;
        }

        if clear_retry_timer {
            self.signals.last_flush_failed.store(false, Ordering::SeqCst);
        }

        for attempt in 0..attempts {
            let start_successes = self.signals.flush_successes.load(Ordering::SeqCst);
            let start_ops = self.signals.flush_ops.load(Ordering::SeqCst);
            self.request_flush();
            // The last time around, we might initiate a stop.
            if initiate_stop && attempt == attempts - 1 {
                self.request_stop();
            }

            let deadline = Instant::now() + timeout;
            while self.signals.flush_ops.load(Ordering::SeqCst) == start_ops {
                if Instant::now() >= deadline {
                    outcome.succeeded = false;
                    return outcome;
                }
                let _ = tokio::time::timeout(
                    FLUSH_WAIT_POLL_INTERVAL,
                    self.signals.progress.notified(),
                )
                .await;
            }
            outcome.succeeded =
                self.signals.flush_successes.load(Ordering::SeqCst) != start_successes;
        }

        if outcome.succeeded {
            outcome.processed_everything = self.last_flush_processed_everything();
        }

        if initiate_stop {
            // Wait for the worker to fully stop, up to the timeout.
            let deadline = Instant::now() + timeout;
            while !self.has_stopped() {
                if Instant::now() >= deadline {
                    outcome.succeeded = false;
                    return outcome;
                }
                let _ = tokio::time::timeout(
                    FLUSH_WAIT_POLL_INTERVAL,
                    self.signals.progress.notified(),
                )
                .await;
            }
        }

        outcome
    }
}

struct ChunkInfo {
    /// Valid bytes read into the scratch buffer.
    len: usize,
    /// Offset the chunk was read from; differs from the shipped offset only
    /// after a shrink reset.
    effective_offset: u64,
    /// Bytes between the effective offset and the end of the file.
    remaining: u64,
}

struct CycleOutcome {
    new_offset: u64,
    processed_everything: bool,
}

/// Reads the source log, ships complete lines, and checkpoints progress.
pub struct StreamWorker {
    settings: Arc<Settings>,
    processor: Arc<dyn PayloadProcessor>,
    source_path: PathBuf,
    marker: ProgressMarker,
    signals: Arc<WorkerSignals>,
    compression: CompressionMode,
    max_line_length: usize,

    // Scratch buffers, reused across cycles and touched only by the worker
    // task.
    read_buf: Vec<u8>,
    builder: PayloadBuilder,

    // Mutable cycle state, owned by the worker task.
    shipped_offset: u64,
    next_flush_due: Instant,
    consecutive_failures: u32,
    last_failed_read_len: usize,
}

impl StreamWorker {
    /// Creates a worker for one source file. The worker does nothing until
    /// [`run`](Self::run) is awaited (typically on a spawned task).
    pub fn new(
        source_path: impl Into<PathBuf>,
        settings: Arc<Settings>,
        processor: Arc<dyn PayloadProcessor>,
        max_line_length: usize,
        hostname_override: Option<&str>,
    ) -> Self {
        debug_assert!(max_line_length > 0);
        let source_path = source_path.into();
        let marker = ProgressMarker::for_log_file(&source_path);
        let common = common_event_json(&settings, hostname_override, &settings.additional_attributes);
        let builder = PayloadBuilder::new(common, settings.bytes_per_request);
        let signals = Arc::new(WorkerSignals::new(settings.retry_interval_secs));

        StreamWorker {
            read_buf: vec![0; settings.bytes_per_request],
            builder,
            compression: settings.effective_compression(),
            max_line_length,
            source_path,
            marker,
            signals,
            processor,
            settings,
            shipped_offset: 0,
            next_flush_due: Instant::now(),
            consecutive_failures: 0,
            last_failed_read_len: 0,
        }
    }

    /// A handle for signaling this worker from other tasks.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            signals: Arc::clone(&self.signals),
            marker: self.marker.clone(),
        }
    }

    /// Runs the worker loop until a stop is requested and any pending
    /// manual flush has completed.
    pub async fn run(mut self) {
        self.shipped_offset = self.marker.read();
        debug!(
            "stream worker started: source={}, offset={}",
            self.source_path.display(),
            self.shipped_offset
        );

        // A pending flush will be processed before stopping.
        while self.signals.stop_requests.load(Ordering::SeqCst) == 0
            || self.signals.flush_requests.load(Ordering::SeqCst) > 0
        {
            // Only honor manual flushes when not sitting out a retry delay
            // from a failed flush.
            if !self.signals.last_flush_failed.load(Ordering::SeqCst)
                && self.signals.flush_requests.load(Ordering::SeqCst) > 0
            {
                self.signals.flush_requests.fetch_sub(1, Ordering::SeqCst);
                self.flush_once().await;
            } else if Instant::now() >= self.next_flush_due {
                // If a manual flush was pending while the retry timer ran
                // out, this attempt counts as processing it.
                if self.signals.flush_requests.load(Ordering::SeqCst) > 0 {
                    self.signals.flush_requests.fetch_sub(1, Ordering::SeqCst);
                }
                self.flush_once().await;
            } else {
                let _ = tokio::time::timeout(IDLE_POLL_INTERVAL, self.signals.wake.notified()).await;
            }
        }

        self.signals.stopped.store(true, Ordering::SeqCst);
        self.signals.progress.notify_waiters();
        debug!("stream worker stopped: source={}", self.source_path.display());
    }

    /// Runs one flush cycle and updates counters, backoff state, and the
    /// durable checkpoint.
    async fn flush_once(&mut self) {
        match self.flush_cycle().await {
            Ok(cycle) => {
                self.shipped_offset = cycle.new_offset;
                match self.marker.write(cycle.new_offset) {
                    Ok(()) => {
                        self.signals.last_flush_failed.store(false, Ordering::SeqCst);
                        self.consecutive_failures = 0;
                        self.last_failed_read_len = 0;
                        self.next_flush_due = Instant::now()
                            + Duration::from_secs_f64(self.settings.processing_interval_secs);
                        self.signals
                            .last_flush_processed_everything
                            .store(cycle.processed_everything, Ordering::SeqCst);
                        self.signals.flush_successes.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => {
                        // Delivered data stays delivered; the checkpoint
                        // write is retried after the next cycle. Until then
                        // this flush counts as failed.
                        warn!(
                            "failed to write progress marker {}: {e}",
                            self.marker.path().display()
                        );
                        self.note_flush_failure();
                    }
                }
            }
            Err(e) => {
                warn!(
                    "flush cycle failed: source={}, {e}",
                    self.source_path.display()
                );
                self.note_flush_failure();
            }
        }
        self.signals.flush_ops.fetch_add(1, Ordering::SeqCst);
        self.signals.progress.notify_waiters();
    }

    fn note_flush_failure(&mut self) {
        self.signals.last_flush_failed.store(true, Ordering::SeqCst);
        // The delay uses the failure count before this failure is recorded:
        // the first failure waits one base interval.
        self.next_flush_due = Instant::now() + self.retry_delay();
        self.signals
            .last_flush_processed_everything
            .store(false, Ordering::SeqCst);
        self.consecutive_failures += 1;
    }

    /// Retry delay after a failed flush: `base * (failures + 1)`, capped.
    fn retry_delay(&self) -> Duration {
        let base = self.signals.retry_interval_millis.load(Ordering::SeqCst) as f64 / 1000.0;
        let secs = (base * f64::from(self.consecutive_failures + 1))
            .min(self.settings.max_retry_interval_secs);
        Duration::from_secs_f64(secs)
    }

    /// One read → segment → build → compress → deliver pass. Does not touch
    /// counters or the durable checkpoint.
    async fn flush_cycle(&mut self) -> Result<CycleOutcome, FlushError> {
        let chunk = self.read_chunk().await?;
        if chunk.len == 0 {
            // Nothing more can be read. After a shrink reset this persists
            // the reset offset rather than the stale one.
            return Ok(CycleOutcome {
                new_offset: chunk.effective_offset,
                processed_everything: true,
            });
        }

        let mut segmenter = LineSegmenter::new(&self.read_buf[..chunk.len], self.max_line_length);
        self.builder.begin();
        for line in &mut segmenter {
            self.builder
                .append_message(&self.read_buf[line.start..line.start + line.len]);
        }
        let captured = segmenter.consumed();

        if self.builder.event_count() > 0 {
            let (encoded, original_len) = {
                let payload = self.builder.finish();
                (compress(self.compression, payload)?, payload.len())
            };

            let outcome = self
                .processor
                .process_payload(&encoded, original_len, self.compression)
                .await;
            match outcome {
                DeliveryOutcome::Accepted => {}
                DeliveryOutcome::Retryable => {
                    // Pin the next read to this attempt's size so the retry
                    // ships a byte-identical payload the ingest side can
                    // deduplicate.
                    self.last_failed_read_len = chunk.len;
                    return Err(FlushError::DeliveryRetryable);
                }
                DeliveryOutcome::Fatal => {
                    self.last_failed_read_len = chunk.len;
                    warn!(
                        "stopping log streaming after non-retryable delivery failure: source={}",
                        self.source_path.display()
                    );
                    self.signals.stop_requests.fetch_add(1, Ordering::SeqCst);
                    return Err(FlushError::DeliveryFatal);
                }
            }
        }

        Ok(CycleOutcome {
            new_offset: chunk.effective_offset + captured as u64,
            processed_everything: captured as u64 >= chunk.remaining,
        })
    }

    /// Re-opens the source file and reads the next chunk into the scratch
    /// buffer. Re-opening every cycle is deliberate: it is the portable way
    /// to observe truncation and the current size, and it is part of the
    /// crash/truncation-recovery contract.
    async fn read_chunk(&mut self) -> Result<ChunkInfo, FlushError> {
        let mut file = match File::open(&self.source_path).await {
            Ok(file) => file,
            Err(e) => {
                warn!("failed to open source log {}: {e}", self.source_path.display());
                return Err(FlushError::Io(e));
            }
        };
        let file_size = file.metadata().await.map_err(FlushError::Io)?.len();

        let mut effective_offset = self.shipped_offset;
        if effective_offset > file_size {
            info!(
                "source log shrank, re-reading from start: new_size={file_size}, previously_shipped={effective_offset}, source={}",
                self.source_path.display()
            );
            effective_offset = 0;
            // The whole file changed; a retried read must not be pinned to
            // the old payload size.
            self.last_failed_read_len = 0;
        }

        let remaining = file_size - effective_offset;
        let mut num_to_read = remaining.min(self.read_buf.len() as u64) as usize;
        if self.last_failed_read_len > 0 && num_to_read > self.last_failed_read_len {
            num_to_read = self.last_failed_read_len;
        }
        if num_to_read == 0 {
            return Ok(ChunkInfo {
                len: 0,
                effective_offset,
                remaining,
            });
        }

        file.seek(io::SeekFrom::Start(effective_offset))
            .await
            .map_err(FlushError::Io)?;
        if let Err(e) = file.read_exact(&mut self.read_buf[..num_to_read]).await {
            warn!(
                "failed to read source log: offset={effective_offset}, bytes={num_to_read}, source={}: {e}",
                self.source_path.display()
            );
            return Err(FlushError::Io(e));
        }

        Ok(ChunkInfo {
            len: num_to_read,
            effective_offset,
            remaining,
        })
    }
}
