// Copyright 2025-Present Shiplog, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Payload delivery with response-code-driven outcome classification.
//!
//! The worker hands every finished payload to a [`PayloadProcessor`], a
//! capability with one operation and two concrete strategies: POST it to the
//! ingestion endpoint, or append it (decompressed) to a local NDJSON file
//! for debugging and replay. The strategy is selected by configuration.
//!
//! # Outcome classification
//!
//! | Condition                               | Outcome   |
//! |-----------------------------------------|-----------|
//! | Request dispatch fails                  | Retryable |
//! | No response before the timeout          | Retryable |
//! | HTTP 2xx                                | Accepted  |
//! | HTTP 429 or 5xx                         | Retryable |
//! | HTTP 400                                | Accepted  |
//! | Any other status                        | Fatal     |
//!
//! HTTP 400 means the endpoint considers this payload permanently
//! unprocessable: it is dropped with a warning and the offset still
//! advances, trading the rare lost batch for forward progress. This is a
//! deliberate, debatable policy choice inherited from the delivery model,
//! not an accident.
//!
//! The request wait re-reads the processor's timeout on every poll
//! iteration, so a shutdown path can shorten it while a request is in
//! flight; expiry cancels the request.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::compression::{decompress, CompressionMode};

/// How often the delivery wait re-checks the current timeout value.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The result of one delivery attempt, as seen by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The payload was durably accepted (or deliberately dropped); the
    /// offset may advance.
    Accepted,
    /// Transient failure; the same byte range will be retried after backoff.
    Retryable,
    /// Permanent failure; the worker must stop shipping for this run.
    Fatal,
}

/// Takes a (potentially compressed) JSON payload from the worker and
/// processes it.
#[async_trait]
pub trait PayloadProcessor: Send + Sync {
    /// Processes one payload. `original_len` is the uncompressed length,
    /// which non-identity encodings must communicate out of band.
    async fn process_payload(
        &self,
        payload: &[u8],
        original_len: usize,
        mode: CompressionMode,
    ) -> DeliveryOutcome;
}

/// Builds the shared HTTP client with connection pooling and keep-alive.
/// Falls back to client defaults if the builder fails, so a bad environment
/// degrades rather than aborts.
fn build_client() -> reqwest::Client {
    match reqwest::Client::builder()
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!("failed to build HTTP client: {e}, falling back to defaults");
            reqwest::Client::new()
        }
    }
}

/// Synchronously (from the worker's perspective) POSTs payloads to an
/// HTTP(S) ingestion endpoint.
pub struct HttpPayloadProcessor {
    client: reqwest::Client,
    endpoint_uri: String,
    authorization: String,
    timezone: String,
    /// Current request timeout in milliseconds. Atomic so shutdown can
    /// lower it while a request is in flight.
    timeout_millis: AtomicU64,
    log_requests: bool,
}

impl HttpPayloadProcessor {
    pub fn new(
        endpoint_uri: impl Into<String>,
        authorization: impl Into<String>,
        timezone: impl Into<String>,
        timeout_secs: f64,
        log_requests: bool,
    ) -> Self {
        let processor = HttpPayloadProcessor {
            client: build_client(),
            endpoint_uri: endpoint_uri.into(),
            authorization: authorization.into(),
            timezone: timezone.into(),
            timeout_millis: AtomicU64::new(0),
            log_requests,
        };
        processor.set_timeout_secs(timeout_secs);
        processor
    }

    /// Changes the request timeout. Takes effect immediately, including for
    /// a request currently waiting for its response.
    pub fn set_timeout_secs(&self, secs: f64) {
        self.timeout_millis
            .store((secs * 1000.0) as u64, Ordering::Relaxed);
    }

    fn current_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_millis.load(Ordering::Relaxed))
    }

    async fn classify(result: Result<reqwest::Response, reqwest::Error>) -> DeliveryOutcome {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!("delivery request failed to dispatch, will retry: {e}");
                return DeliveryOutcome::Retryable;
            }
        };

        let status = response.status();
        if status.is_success() {
            return DeliveryOutcome::Accepted;
        }

        let body = response.text().await.unwrap_or_default();
        let body = body.trim();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            warn!("retryable delivery response: status={status}, msg={body}");
            DeliveryOutcome::Retryable
        } else if status == StatusCode::BAD_REQUEST {
            // The endpoint cannot process this input. Skip the payload and
            // keep going rather than wedging the stream on it forever.
            warn!("endpoint rejected payload as unprocessable, skipping it: status={status}, msg={body}");
            DeliveryOutcome::Accepted
        } else {
            warn!("non-retryable delivery response: status={status}, msg={body}");
            DeliveryOutcome::Fatal
        }
    }
}

#[async_trait]
impl PayloadProcessor for HttpPayloadProcessor {
    async fn process_payload(
        &self,
        payload: &[u8],
        original_len: usize,
        mode: CompressionMode,
    ) -> DeliveryOutcome {
        if self.log_requests {
            debug!(
                "delivery begin: len={}, original_len={}, timeout_millis={}",
                payload.len(),
                original_len,
                self.timeout_millis.load(Ordering::Relaxed)
            );
        }

        let mut request = self
            .client
            .post(&self.endpoint_uri)
            .header(header::CONTENT_TYPE, "application/json; charset=UTF-8")
            .header(header::AUTHORIZATION, self.authorization.as_str())
            .header("X-Timezone", self.timezone.as_str());
        if let Some(encoding) = mode.content_encoding() {
            // The codec is nonstandard; the receiver needs the original
            // length to size its decompression buffer.
            request = request
                .header(header::CONTENT_ENCODING, encoding)
                .header("X-Original-Content-Length", original_len.to_string());
        }

        let started = Instant::now();
        let send = request.body(payload.to_vec()).send();
        tokio::pin!(send);

        let outcome = loop {
            tokio::select! {
                result = &mut send => break Self::classify(result).await,
                () = tokio::time::sleep(WAIT_POLL_INTERVAL) => {
                    // The timeout may have been lowered while waiting, so
                    // always compare against the current value.
                    if started.elapsed() > self.current_timeout() {
                        warn!(
                            "delivery timed out after {:.3} seconds; will retry",
                            started.elapsed().as_secs_f64()
                        );
                        // Dropping the send future cancels the request.
                        break DeliveryOutcome::Retryable;
                    }
                }
            }
        };

        if self.log_requests {
            debug!("delivery end: outcome={outcome:?}");
        }
        outcome
    }
}

/// Decompresses payloads and appends them to a local NDJSON file. Debug and
/// replay use only; never part of the HTTP delivery path.
pub struct NdjsonPayloadProcessor {
    output_path: PathBuf,
}

impl NdjsonPayloadProcessor {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        NdjsonPayloadProcessor {
            output_path: output_path.into(),
        }
    }
}

#[async_trait]
impl PayloadProcessor for NdjsonPayloadProcessor {
    async fn process_payload(
        &self,
        payload: &[u8],
        original_len: usize,
        mode: CompressionMode,
    ) -> DeliveryOutcome {
        let decompressed = match decompress(mode, payload, original_len) {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    "failed to decompress payload for ndjson sink: mode={mode:?}, len={}, original_len={original_len}: {e}",
                    payload.len()
                );
                return DeliveryOutcome::Retryable;
            }
        };

        let result: std::io::Result<()> = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.output_path)
                .await?;
            file.write_all(&decompressed).await?;
            file.write_all(b"\r\n").await?;
            file.sync_data().await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => DeliveryOutcome::Accepted,
            Err(e) => {
                warn!(
                    "failed to append payload to {}: {e}",
                    self.output_path.display()
                );
                DeliveryOutcome::Retryable
            }
        }
    }
}
