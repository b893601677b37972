// Copyright 2025-Present Shiplog, Inc.
// SPDX-License-Identifier: Apache-2.0

//! # Shiplog Agent
//!
//! This crate streams a local, ever-growing append-only log file to an HTTP
//! ingestion endpoint, designed to run embedded in a long-lived host process
//! that cannot guarantee graceful shutdown.
//!
//! ## Pipeline
//!
//! ```text
//!   Source log file
//!        │  (re-opened every cycle)
//!        v
//!   ┌──────────────┐
//!   │   Segment    │  (complete lines only, bounded length)
//!   └──────┬───────┘
//!          │
//!          v
//!   ┌──────────────┐
//!   │    Build     │  (JSON array + common metadata)
//!   └──────┬───────┘
//!          │
//!          v
//!   ┌──────────────┐
//!   │   Compress   │  (lz4-block or pass-through)
//!   └──────┬───────┘
//!          │
//!          v
//!   ┌──────────────┐
//!   │   Deliver    │  (HTTP POST, outcome-classified)
//!   └──────┬───────┘
//!          │
//!          v
//!   ┌──────────────┐
//!   │  Checkpoint  │  (durable shipped-offset marker)
//!   └──────────────┘
//! ```
//!
//! The checkpoint is only advanced after the endpoint accepts a payload, so
//! delivery is at-least-once: a crash between acceptance and checkpointing
//! re-ships the same byte range on the next run, never loses it.
//!
//! ## Modules
//!
//! - [`config`]: immutable per-run settings snapshot with constraint clamping
//! - [`progress`]: durable shipped-offset marker (read/write/delete)
//! - [`segment`]: complete-line extraction from raw read buffers
//! - [`payload`]: JSON array assembly and string escaping
//! - [`compression`]: lz4-block codec with bounded input
//! - [`delivery`]: payload processors (HTTP and local NDJSON debug sink)
//! - [`worker`]: the streaming worker state machine and its handle
//! - [`stress`]: synthetic log generator for load testing

#![deny(clippy::all)]
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

/// Configuration management - environment variables and defaults
pub mod config;

/// lz4-block compression codec with bounded input sizes
pub mod compression;

/// Payload processors - HTTP delivery and local NDJSON debug sink
pub mod delivery;

/// JSON payload assembly and common event metadata
pub mod payload;

/// Durable shipped-offset progress marker
pub mod progress;

/// Complete-line segmentation of raw read buffers
pub mod segment;

/// Synthetic log line generator for stress testing
pub mod stress;

/// Streaming worker state machine and cross-task signaling
pub mod worker;

/// Maximum length of a single captured log line in bytes.
///
/// Lines longer than this are force-broken at the nearest safe UTF-8
/// boundary at or below this length.
pub const MAX_LINE_LENGTH: usize = 16 * 1024;
