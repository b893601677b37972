// Copyright 2025-Present Shiplog, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration for the streaming agent.
//!
//! Settings are loaded once per run into an immutable [`Settings`] snapshot:
//! defaults first, then `SHIPLOG_*` environment variables, then
//! [`Settings::enforce_constraints`] clamps everything into its documented
//! range. Nothing re-reads configuration after startup; shutdown-time
//! adjustments (shorter HTTP timeout, shorter retry base) go through the
//! delivery processor and worker handle instead of mutating settings.

use std::collections::BTreeMap;
use std::env;

use tracing::warn;

use crate::compression::CompressionMode;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: f64 = 90.0;
pub const MIN_REQUEST_TIMEOUT_SECS: f64 = 30.0;
pub const MAX_REQUEST_TIMEOUT_SECS: f64 = 4.0 * 60.0;
pub const DEFAULT_ACTIVATION_PERCENTAGE: f64 = 100.0;
pub const DEFAULT_BYTES_PER_REQUEST: usize = 3 * 1024 * 1024;
pub const MIN_BYTES_PER_REQUEST: usize = 128 * 1024;
pub const MAX_BYTES_PER_REQUEST: usize = 4 * 1024 * 1024;
pub const DEFAULT_PROCESSING_INTERVAL_SECS: f64 = 2.0;
pub const MIN_PROCESSING_INTERVAL_SECS: f64 = 0.5;
pub const DEFAULT_RETRY_INTERVAL_SECS: f64 = 30.0;
pub const MIN_RETRY_INTERVAL_SECS: f64 = 15.0;
// The ingest dedup cache expires a few minutes after first sight of a
// payload, so retries must not be delayed longer than this.
pub const MAX_RETRY_INTERVAL_SECS: f64 = 5.0 * 60.0;
pub const DEFAULT_INCLUDE_COMMON_METADATA: bool = true;
pub const DEFAULT_ADD_RANDOM_INSTANCE_ID: bool = true;
pub const DEFAULT_DEBUG_LOG_REQUESTS: bool = false;

/// How long a shutdown drain may wait for the final flush to the endpoint.
pub const SHUTDOWN_FLUSH_WAIT_SECS: f64 = 15.0;
/// Cap applied to the HTTP request timeout during a shutdown drain.
pub const SHUTDOWN_REQUEST_TIMEOUT_CAP_SECS: f64 = 6.0;
/// Retry base used during a shutdown drain so a failed first flush can still
/// be retried within the drain window.
pub const SHUTDOWN_RETRY_INTERVAL_SECS: f64 = 0.2;

/// Compression selection as configured, before resolution.
///
/// `Auto` picks lz4-block when shipping to the managed cloud (credentials
/// configured) and pass-through for custom endpoints, since lz4-block is a
/// nonstandard content encoding a third-party receiver is unlikely to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionSetting {
    #[default]
    Auto,
    None,
    Lz4,
}

impl CompressionSetting {
    /// Parses a configured value. Unknown non-empty values warn and fall
    /// back to `Auto`; empty is `Auto`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "lz4" => CompressionSetting::Lz4,
            "none" => CompressionSetting::None,
            "" | "auto" => CompressionSetting::Auto,
            other => {
                warn!("unknown compression mode '{other}', using default mode instead");
                CompressionSetting::Auto
            }
        }
    }
}

/// Immutable per-run settings snapshot for one streamed file.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Cloud region shorthand, e.g. `us` or `eu`. Used to derive the
    /// ingestion endpoint when no explicit URI is configured.
    pub cloud_region: Option<String>,
    /// Overrides the URI of the endpoint to push log payloads to.
    pub endpoint_uri: Option<String>,
    /// ID of the agent when pushing logs to the cloud.
    pub agent_id: Option<String>,
    /// Auth token associated with the agent.
    pub agent_auth_token: Option<String>,
    /// Overrides the HTTP Authorization header value directly. If set, the
    /// agent id and auth token are ignored.
    pub authorization_header: Option<String>,
    /// HTTP request timeout in seconds.
    pub request_timeout_secs: f64,
    /// Desired maximum bytes to read and process in one flush cycle.
    pub bytes_per_request: usize,
    /// Desired seconds between flush cycles.
    pub processing_interval_secs: f64,
    /// Base wait after a failed flush before retrying.
    pub retry_interval_secs: f64,
    /// Cap on the computed retry backoff.
    pub max_retry_interval_secs: f64,
    /// Payload compression selection.
    pub compression: CompressionSetting,
    /// Whether each event carries the common host metadata fields.
    pub include_common_metadata: bool,
    /// Whether a random per-run `instance_id` is added to the metadata.
    pub add_random_instance_id: bool,
    /// Whether to log every delivery request at debug level.
    pub debug_log_requests: bool,
    /// Percent of runs in which shipping activates at all (0.0 to 100.0).
    pub activation_percentage: f64,
    /// Application name included in the common metadata.
    pub app_name: Option<String>,
    /// UTC offset of the timestamps inside log lines, sent as `X-Timezone`.
    pub log_timezone: String,
    /// Whether a fully-drained shutdown may delete the source file along
    /// with the progress marker. Only enable when the shipper owns the file.
    pub purge_after_drain: bool,
    /// If non-zero, generate synthetic log lines every this many seconds.
    pub stress_generate_interval_secs: f64,
    /// Number of synthetic lines generated per tick.
    pub stress_entries_per_tick: u32,
    /// Extra attributes merged into every event's common metadata.
    pub additional_attributes: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            cloud_region: None,
            endpoint_uri: None,
            agent_id: None,
            agent_auth_token: None,
            authorization_header: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            bytes_per_request: DEFAULT_BYTES_PER_REQUEST,
            processing_interval_secs: DEFAULT_PROCESSING_INTERVAL_SECS,
            retry_interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
            max_retry_interval_secs: MAX_RETRY_INTERVAL_SECS,
            compression: CompressionSetting::Auto,
            include_common_metadata: DEFAULT_INCLUDE_COMMON_METADATA,
            add_random_instance_id: DEFAULT_ADD_RANDOM_INSTANCE_ID,
            debug_log_requests: DEFAULT_DEBUG_LOG_REQUESTS,
            activation_percentage: DEFAULT_ACTIVATION_PERCENTAGE,
            app_name: None,
            log_timezone: "UTC".to_string(),
            purge_after_drain: false,
            stress_generate_interval_secs: 0.0,
            stress_entries_per_tick: 0,
            additional_attributes: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Loads settings from `SHIPLOG_*` environment variables over defaults
    /// and clamps them into range.
    pub fn from_env() -> Self {
        let mut settings = Settings {
            cloud_region: env_string("SHIPLOG_CLOUD_REGION"),
            endpoint_uri: env_string("SHIPLOG_ENDPOINT_URI"),
            agent_id: env_string("SHIPLOG_AGENT_ID"),
            agent_auth_token: env_string("SHIPLOG_AGENT_AUTH_TOKEN"),
            authorization_header: env_string("SHIPLOG_AUTHORIZATION_HEADER"),
            request_timeout_secs: env_f64("SHIPLOG_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS),
            bytes_per_request: env_usize("SHIPLOG_BYTES_PER_REQUEST", DEFAULT_BYTES_PER_REQUEST),
            processing_interval_secs: env_f64(
                "SHIPLOG_PROCESSING_INTERVAL_SECS",
                DEFAULT_PROCESSING_INTERVAL_SECS,
            ),
            retry_interval_secs: env_f64("SHIPLOG_RETRY_INTERVAL_SECS", DEFAULT_RETRY_INTERVAL_SECS),
            max_retry_interval_secs: MAX_RETRY_INTERVAL_SECS,
            compression: CompressionSetting::parse(
                &env::var("SHIPLOG_COMPRESSION_MODE").unwrap_or_default(),
            ),
            include_common_metadata: env_bool(
                "SHIPLOG_INCLUDE_COMMON_METADATA",
                DEFAULT_INCLUDE_COMMON_METADATA,
            ),
            add_random_instance_id: env_bool(
                "SHIPLOG_ADD_RANDOM_INSTANCE_ID",
                DEFAULT_ADD_RANDOM_INSTANCE_ID,
            ),
            debug_log_requests: env_bool("SHIPLOG_DEBUG_LOG_REQUESTS", DEFAULT_DEBUG_LOG_REQUESTS),
            activation_percentage: env_f64(
                "SHIPLOG_ACTIVATION_PERCENTAGE",
                DEFAULT_ACTIVATION_PERCENTAGE,
            ),
            app_name: env_string("SHIPLOG_APP_NAME"),
            log_timezone: env_string("SHIPLOG_LOG_TIMEZONE").unwrap_or_else(|| "UTC".to_string()),
            purge_after_drain: env_bool("SHIPLOG_PURGE_AFTER_DRAIN", false),
            stress_generate_interval_secs: env_f64("SHIPLOG_STRESS_GENERATE_INTERVAL_SECS", 0.0),
            stress_entries_per_tick: env_usize("SHIPLOG_STRESS_ENTRIES_PER_TICK", 0) as u32,
            additional_attributes: BTreeMap::new(),
        };
        settings.enforce_constraints();
        settings
    }

    /// Clamps every loaded value into its documented range.
    pub fn enforce_constraints(&mut self) {
        trim_in_place(&mut self.agent_id);
        trim_in_place(&mut self.agent_auth_token);
        trim_in_place(&mut self.cloud_region);
        trim_in_place(&mut self.endpoint_uri);

        self.request_timeout_secs = self
            .request_timeout_secs
            .clamp(MIN_REQUEST_TIMEOUT_SECS, MAX_REQUEST_TIMEOUT_SECS);
        self.bytes_per_request = self
            .bytes_per_request
            .clamp(MIN_BYTES_PER_REQUEST, MAX_BYTES_PER_REQUEST);
        if self.processing_interval_secs < MIN_PROCESSING_INTERVAL_SECS {
            self.processing_interval_secs = MIN_PROCESSING_INTERVAL_SECS;
        }
        self.retry_interval_secs = self
            .retry_interval_secs
            .clamp(MIN_RETRY_INTERVAL_SECS, MAX_RETRY_INTERVAL_SECS);
        self.max_retry_interval_secs = MAX_RETRY_INTERVAL_SECS;
        self.activation_percentage = self.activation_percentage.clamp(0.0, 100.0);
        if self.stress_generate_interval_secs > 0.0 && self.stress_entries_per_tick < 1 {
            self.stress_entries_per_tick = 1;
        }
    }

    /// Whether managed-cloud credentials are configured.
    pub fn has_cloud_credentials(&self) -> bool {
        matches!(&self.agent_id, Some(id) if !id.is_empty())
            && matches!(&self.agent_auth_token, Some(token) if !token.is_empty())
    }

    /// The endpoint URI payloads are POSTed to: the explicit override when
    /// set, otherwise derived from the cloud region. `None` means shipping
    /// is not configured for this run.
    pub fn effective_endpoint_uri(&self) -> Option<String> {
        if let Some(uri) = &self.endpoint_uri {
            if !uri.is_empty() {
                return Some(uri.clone());
            }
        }
        let region = self.cloud_region.as_deref()?.trim().to_ascii_lowercase();
        match region.as_str() {
            // Local DEBUG container
            "local" => Some("http://localhost:8082/ingest/v1".to_string()),
            "" => None,
            region => Some(format!("https://ingest-{region}.shiplog.cloud/ingest/v1")),
        }
    }

    /// The Authorization header value: a verbatim override when configured,
    /// otherwise `Bearer <agent_id>:<agent_auth_token>`.
    pub fn effective_authorization(&self) -> Option<String> {
        if let Some(header) = &self.authorization_header {
            if !header.is_empty() {
                return Some(header.clone());
            }
        }
        match (&self.agent_id, &self.agent_auth_token) {
            (Some(id), Some(token)) if !id.is_empty() && !token.is_empty() => {
                Some(format!("Bearer {id}:{token}"))
            }
            _ => None,
        }
    }

    /// Resolves the configured compression selection to a concrete mode.
    pub fn effective_compression(&self) -> CompressionMode {
        match self.compression {
            CompressionSetting::None => CompressionMode::None,
            CompressionSetting::Lz4 => CompressionMode::Lz4Block,
            CompressionSetting::Auto => {
                let using_cloud =
                    matches!(&self.cloud_region, Some(r) if !r.is_empty()) || self.has_cloud_credentials();
                if using_cloud {
                    CompressionMode::Lz4Block
                } else {
                    CompressionMode::None
                }
            }
        }
    }
}

fn trim_in_place(value: &mut Option<String>) {
    if let Some(v) = value {
        let trimmed = v.trim().to_string();
        *v = trimmed;
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => v.trim().to_ascii_lowercase() != "false",
        Err(_) => default,
    }
}
