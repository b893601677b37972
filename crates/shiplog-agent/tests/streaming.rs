// Copyright 2025-Present Shiplog, Inc.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests of the streaming worker: a real file on disk, a real
//! spawned worker task, and an in-memory payload processor standing in for
//! the ingestion endpoint.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use shiplog_agent::compression::{decompress, CompressionMode};
use shiplog_agent::config::{CompressionSetting, Settings};
use shiplog_agent::delivery::{DeliveryOutcome, PayloadProcessor};
use shiplog_agent::progress::ProgressMarker;
use shiplog_agent::worker::{StreamWorker, WorkerHandle};
use shiplog_agent::MAX_LINE_LENGTH;

const WAIT: Duration = Duration::from_secs(10);

/// Keeps every received payload in memory, decompressed, and returns a
/// configurable outcome.
struct MemoryProcessor {
    outcome: Mutex<DeliveryOutcome>,
    payloads: Mutex<Vec<String>>,
}

impl MemoryProcessor {
    fn new() -> Arc<Self> {
        Arc::new(MemoryProcessor {
            outcome: Mutex::new(DeliveryOutcome::Accepted),
            payloads: Mutex::new(Vec::new()),
        })
    }

    fn set_outcome(&self, outcome: DeliveryOutcome) {
        *self.outcome.lock().unwrap() = outcome;
    }

    fn payloads(&self) -> Vec<String> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl PayloadProcessor for MemoryProcessor {
    async fn process_payload(
        &self,
        payload: &[u8],
        original_len: usize,
        mode: CompressionMode,
    ) -> DeliveryOutcome {
        let decompressed =
            decompress(mode, payload, original_len).expect("payload must decompress");
        self.payloads
            .lock()
            .unwrap()
            .push(String::from_utf8(decompressed).expect("payload must be UTF-8"));
        *self.outcome.lock().unwrap()
    }
}

fn test_settings(compression: CompressionSetting) -> Settings {
    Settings {
        compression,
        processing_interval_secs: 0.05,
        retry_interval_secs: 0.05,
        include_common_metadata: false,
        add_random_instance_id: false,
        additional_attributes: BTreeMap::new(),
        ..Default::default()
    }
}

fn spawn_worker(
    source: &Path,
    settings: Settings,
    processor: Arc<MemoryProcessor>,
) -> (WorkerHandle, tokio::task::JoinHandle<()>) {
    let worker = StreamWorker::new(source, Arc::new(settings), processor, MAX_LINE_LENGTH, None);
    let handle = worker.handle();
    let task = tokio::spawn(worker.run());
    (handle, task)
}

fn source_file(dir: &TempDir, contents: &[u8]) -> PathBuf {
    let path = dir.path().join("test-shiplog.log");
    std::fs::write(&path, contents).unwrap();
    path
}

fn compression_modes() -> [CompressionSetting; 2] {
    [CompressionSetting::None, CompressionSetting::Lz4]
}

#[tokio::test(flavor = "multi_thread")]
async fn ships_complete_lines_and_checkpoints() {
    for compression in compression_modes() {
        let dir = TempDir::new().unwrap();
        let source = source_file(&dir, b"A\nB\n");
        let processor = MemoryProcessor::new();
        let (handle, task) = spawn_worker(&source, test_settings(compression), processor.clone());

        let outcome = handle.flush_and_wait(1, false, true, WAIT).await;
        assert!(outcome.succeeded, "mode {compression:?}");
        assert!(outcome.processed_everything);

        assert_eq!(
            processor.payloads(),
            vec![r#"[{"message":"A"},{"message":"B"}]"#.to_string()]
        );
        assert_eq!(ProgressMarker::for_log_file(&source).read(), 4);
        task.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn skips_byte_order_mark() {
    let dir = TempDir::new().unwrap();
    let mut contents = vec![0xEF, 0xBB, 0xBF];
    contents.extend_from_slice(b"X\n");
    let source = source_file(&dir, &contents);
    let processor = MemoryProcessor::new();
    let (handle, task) = spawn_worker(
        &source,
        test_settings(CompressionSetting::None),
        processor.clone(),
    );

    let outcome = handle.flush_and_wait(1, false, true, WAIT).await;
    assert!(outcome.succeeded);

    assert_eq!(processor.payloads(), vec![r#"[{"message":"X"}]"#.to_string()]);
    // The checkpoint advances past the BOM and the line.
    assert_eq!(ProgressMarker::for_log_file(&source).read(), 5);
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_file_flush_succeeds_without_payloads() {
    let dir = TempDir::new().unwrap();
    let source = source_file(&dir, b"");
    let processor = MemoryProcessor::new();
    let (handle, task) = spawn_worker(
        &source,
        test_settings(CompressionSetting::None),
        processor.clone(),
    );

    let outcome = handle.flush_and_wait(1, false, true, WAIT).await;
    assert!(outcome.succeeded);
    assert!(outcome.processed_everything);
    assert!(processor.payloads().is_empty());
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_reships_identical_payload() {
    let dir = TempDir::new().unwrap();
    let source = source_file(&dir, b"A\nB\n");
    let processor = MemoryProcessor::new();
    processor.set_outcome(DeliveryOutcome::Retryable);
    // Long intervals: after the initial cycle only manual flushes drive the
    // loop, keeping the delivery sequence deterministic.
    let mut settings = test_settings(CompressionSetting::Lz4);
    settings.processing_interval_secs = 3600.0;
    settings.retry_interval_secs = 3600.0;
    let (handle, task) = spawn_worker(&source, settings, processor.clone());

    // Wait for the first (failing) delivery attempt.
    let deadline = tokio::time::Instant::now() + WAIT;
    while processor.payloads().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "no delivery attempt");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // The checkpoint did not move past undelivered data.
    assert_eq!(ProgressMarker::for_log_file(&source).read(), 0);

    // The file grows while the failure persists; the retry must still ship
    // the identical byte window so the ingest side can deduplicate it.
    std::fs::write(&source, b"A\nB\nC\n").unwrap();
    processor.set_outcome(DeliveryOutcome::Accepted);
    let recovered = handle.flush_and_wait(1, true, false, WAIT).await;
    assert!(recovered.succeeded);
    assert_eq!(ProgressMarker::for_log_file(&source).read(), 4);

    let payloads = processor.payloads();
    assert!(payloads.len() >= 2);
    for payload in &payloads {
        assert_eq!(payload, r#"[{"message":"A"},{"message":"B"}]"#);
    }

    // The next flush picks up only the appended line.
    let drained = handle.flush_and_wait(1, false, true, WAIT).await;
    assert!(drained.succeeded);
    assert_eq!(
        processor.payloads().last().unwrap(),
        r#"[{"message":"C"}]"#
    );
    assert_eq!(ProgressMarker::for_log_file(&source).read(), 6);
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn flush_requests_are_counted_not_boolean() {
    let dir = TempDir::new().unwrap();
    let source = source_file(&dir, b"one\n");
    let processor = MemoryProcessor::new();
    let (handle, task) = spawn_worker(
        &source,
        test_settings(CompressionSetting::None),
        processor.clone(),
    );

    // Two requested flushes require two completed cycles.
    let outcome = handle.flush_and_wait(2, false, true, WAIT).await;
    assert!(outcome.succeeded);
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn shrunken_file_restarts_from_zero() {
    let dir = TempDir::new().unwrap();
    let long_line = format!("{}\n", "x".repeat(999));
    let source = source_file(&dir, long_line.as_bytes());
    let processor = MemoryProcessor::new();
    let (handle, _task) = spawn_worker(
        &source,
        test_settings(CompressionSetting::None),
        processor.clone(),
    );

    let first = handle.flush_and_wait(1, false, false, WAIT).await;
    assert!(first.succeeded);
    assert_eq!(ProgressMarker::for_log_file(&source).read(), 1000);

    // The host rewrote the file from scratch, smaller than the checkpoint.
    std::fs::write(&source, b"rewritten\n").unwrap();
    let second = handle.flush_and_wait(1, false, true, WAIT).await;
    assert!(second.succeeded);

    assert_eq!(
        processor.payloads().last().unwrap(),
        r#"[{"message":"rewritten"}]"#
    );
    assert_eq!(ProgressMarker::for_log_file(&source).read(), 10);
}

#[tokio::test(flavor = "multi_thread")]
async fn fatal_outcome_stops_the_worker() {
    let dir = TempDir::new().unwrap();
    let source = source_file(&dir, b"doomed\n");
    let processor = MemoryProcessor::new();
    processor.set_outcome(DeliveryOutcome::Fatal);
    let (handle, task) = spawn_worker(
        &source,
        test_settings(CompressionSetting::None),
        processor.clone(),
    );

    let outcome = handle.flush_and_wait(1, false, false, WAIT).await;
    assert!(!outcome.succeeded);

    // The worker stops on its own; no further flush cycles run.
    task.await.unwrap();
    assert!(handle.has_stopped());
    // Checkpoint and source file are left intact for a future run.
    assert_eq!(ProgressMarker::for_log_file(&source).read(), 0);
    assert!(source.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn flush_after_stop_is_refused() {
    let dir = TempDir::new().unwrap();
    let source = source_file(&dir, b"line\n");
    let processor = MemoryProcessor::new();
    let (handle, task) = spawn_worker(
        &source,
        test_settings(CompressionSetting::None),
        processor.clone(),
    );

    let drained = handle.flush_and_wait(1, false, true, WAIT).await;
    assert!(drained.succeeded);
    task.await.unwrap();

    let refused = handle.flush_and_wait(1, false, false, WAIT).await;
    assert!(!refused.succeeded);
}

#[tokio::test(flavor = "multi_thread")]
async fn drained_shutdown_allows_marker_deletion() {
    let dir = TempDir::new().unwrap();
    let source = source_file(&dir, b"only line\n");
    let processor = MemoryProcessor::new();
    let (handle, task) = spawn_worker(
        &source,
        test_settings(CompressionSetting::None),
        processor.clone(),
    );

    let drained = handle.flush_and_wait(2, true, true, WAIT).await;
    assert!(drained.succeeded);
    assert!(drained.processed_everything);
    task.await.unwrap();

    let marker = ProgressMarker::for_log_file(&source);
    assert!(marker.path().exists());
    handle.delete_progress_marker();
    assert!(!marker.path().exists());
}
