// Copyright 2025-Present Shiplog, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Synthetic log generator for stress testing the streaming pipeline.
//!
//! When enabled via the stress settings, a background task appends a batch
//! of synthetic lines to the source file on a fixed interval, so the whole
//! read → ship path can be exercised without a real workload.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const FILLER: &str = "12345678901234567890123456789012345678901234567890 \
                      1234567890123456789012345678901234567890123456 100 \
                      12345678901234567890123456789012345678901234567890 \
                      1234567890123456789012345678901234567890123456 200";

/// Background task that appends synthetic log lines to a file.
pub struct StressGenerator {
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl StressGenerator {
    /// Spawns the generator. `interval_secs` must be positive;
    /// `entries_per_tick` lines are appended every tick.
    pub fn spawn(target: impl Into<PathBuf>, interval_secs: f64, entries_per_tick: u32) -> Self {
        let target = target.into();
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();

        info!(
            "stress generator starting: interval_secs={interval_secs}, entries_per_tick={entries_per_tick}"
        );
        let task = tokio::spawn(async move {
            let interval = Duration::from_secs_f64(interval_secs.max(0.001));
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {
                        if let Err(e) = append_entries(&target, entries_per_tick).await {
                            warn!("stress generator failed to append to {}: {e}", target.display());
                        }
                    }
                }
            }
            info!("stress generator stopped");
        });

        StressGenerator { cancel_token, task }
    }

    /// Stops the generator and waits for the task to exit.
    pub async fn stop(self) {
        self.cancel_token.cancel();
        let _ = self.task.await;
    }
}

async fn append_entries(target: &Path, entries: u32) -> std::io::Result<()> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();

    let mut batch = String::new();
    for i in 0..entries {
        batch.push_str(&format!(
            "stress test message generated at unix_time={now:.3}, iteration={i}, {FILLER}\n"
        ));
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(target)
        .await?;
    file.write_all(batch.as_bytes()).await?;
    file.flush().await
}
