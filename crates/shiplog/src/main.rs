// Copyright 2025-Present Shiplog, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Standalone runner for the shiplog streaming agent.
//!
//! Reads its configuration from `SHIPLOG_*` environment variables, streams
//! the configured source log to the ingestion endpoint, and drains on
//! SIGINT/SIGTERM: the HTTP timeout and retry base are shortened, one last
//! flush pair is forced, and only a fully-drained flush deletes the
//! progress marker (and the source file, when the shipper owns it).

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use std::env;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use shiplog_agent::config::{
    Settings, SHUTDOWN_FLUSH_WAIT_SECS, SHUTDOWN_REQUEST_TIMEOUT_CAP_SECS,
    SHUTDOWN_RETRY_INTERVAL_SECS,
};
use shiplog_agent::delivery::HttpPayloadProcessor;
use shiplog_agent::stress::StressGenerator;
use shiplog_agent::worker::StreamWorker;
use shiplog_agent::MAX_LINE_LENGTH;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("SHIPLOG_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("hyper=off,reqwest=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let settings = Arc::new(Settings::from_env());

    let Some(source_log) = env::var("SHIPLOG_SOURCE_LOG").ok().filter(|v| !v.is_empty()) else {
        error!("SHIPLOG_SOURCE_LOG is not set; nothing to stream");
        return;
    };

    let Some(endpoint_uri) = settings.effective_endpoint_uri() else {
        error!(
            "no ingestion endpoint configured; set SHIPLOG_CLOUD_REGION or SHIPLOG_ENDPOINT_URI"
        );
        return;
    };
    let Some(authorization) = settings.effective_authorization() else {
        error!(
            "no credentials configured; set SHIPLOG_AGENT_ID and SHIPLOG_AGENT_AUTH_TOKEN, or SHIPLOG_AUTHORIZATION_HEADER"
        );
        return;
    };

    // Probabilistic activation, for incremental rollouts.
    let dice_roll: f64 = rand::thread_rng().gen_range(0.0..100.0);
    let active = dice_roll < settings.activation_percentage;
    info!(
        "starting up: endpoint={endpoint_uri}, activation_percentage={}, dice_roll={dice_roll:.2}, activated={active}",
        settings.activation_percentage
    );
    if !active {
        return;
    }
    info!(
        "ingestion parameters: request_timeout_secs={}, bytes_per_request={}, processing_interval_secs={}, retry_interval_secs={}",
        settings.request_timeout_secs,
        settings.bytes_per_request,
        settings.processing_interval_secs,
        settings.retry_interval_secs
    );

    let processor = Arc::new(HttpPayloadProcessor::new(
        endpoint_uri,
        authorization,
        settings.log_timezone.clone(),
        settings.request_timeout_secs,
        settings.debug_log_requests,
    ));

    let worker = StreamWorker::new(
        &source_log,
        Arc::clone(&settings),
        processor.clone(),
        MAX_LINE_LENGTH,
        None,
    );
    let handle = worker.handle();
    let worker_task = tokio::spawn(worker.run());

    let stress_generator = if settings.stress_generate_interval_secs > 0.0 {
        Some(StressGenerator::spawn(
            &source_log,
            settings.stress_generate_interval_secs,
            settings.stress_entries_per_tick,
        ))
    } else {
        None
    };

    wait_for_shutdown_signal().await;
    info!("shutting down and flushing logs to the endpoint");

    if let Some(generator) = stress_generator {
        generator.stop().await;
    }

    // Don't let a slow endpoint hold the process hostage: shorten the
    // request timeout and retry base for the final drain.
    processor.set_timeout_secs(
        settings
            .request_timeout_secs
            .min(SHUTDOWN_REQUEST_TIMEOUT_CAP_SECS),
    );
    handle.set_retry_interval_secs(SHUTDOWN_RETRY_INTERVAL_SECS);

    let drain = handle
        .flush_and_wait(
            2,
            true,
            true,
            Duration::from_secs_f64(SHUTDOWN_FLUSH_WAIT_SECS),
        )
        .await;

    if drain.succeeded {
        info!(
            "flushed logs successfully, processed_everything={}",
            drain.processed_everything
        );
        if drain.processed_everything && settings.purge_after_drain {
            info!("all logs fully shipped, removing progress marker and local logfile {source_log}");
            if let Err(e) = std::fs::remove_file(&source_log) {
                warn!("failed to remove {source_log}: {e}");
            }
            handle.delete_progress_marker();
        }
    } else {
        // The progress marker was not advanced past undelivered data, so
        // the next run resumes exactly where this one left off.
        info!("final flush failed or timed out; data remains on disk for the next run");
    }

    worker_task.abort();
    info!("shutdown complete");
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("failed to wait for ctrl-c: {e}");
                }
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to wait for ctrl-c: {e}");
        }
    }
}
