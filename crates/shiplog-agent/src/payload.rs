// Copyright 2025-Present Shiplog, Inc.
// SPDX-License-Identifier: Apache-2.0

//! JSON payload assembly.
//!
//! Payloads are JSON arrays of event objects, assembled directly into a
//! reusable byte buffer rather than through a serializer: the log text is
//! already UTF-8, every event has the same shape, and the buffer is reused
//! across flush cycles. Each event is the precomputed common-metadata
//! fragment (if any) followed by a `"message"` field holding the escaped
//! line text:
//!
//! ```json
//! [{"hostname": "web-1", "pid": 4242, "message": "first line"}, ...]
//! ```
//!
//! Rebuilding from an unchanged buffer yields byte-identical output, which
//! keeps retried payloads stable for dedup on the ingest side.

use std::collections::BTreeMap;
use std::io::Write as _;

use rand::Rng;

use crate::config::Settings;

/// Appends `bytes` to `out` as a quoted, escaped JSON string.
///
/// Escapes the JSON control set (`"`, `\`, backspace, tab, newline,
/// form-feed, carriage-return) and any other byte below 0x20 as `\u00XX`.
/// Bytes at or above 0x20 pass through unchanged; the input is already
/// valid UTF-8.
pub fn append_json_escaped(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(b'"');
    for &b in bytes {
        match b {
            b'"' => out.extend_from_slice(b"\\\""),
            b'\\' => out.extend_from_slice(b"\\\\"),
            0x08 => out.extend_from_slice(b"\\b"),
            b'\t' => out.extend_from_slice(b"\\t"),
            b'\n' => out.extend_from_slice(b"\\n"),
            0x0C => out.extend_from_slice(b"\\f"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b if b < 0x20 => {
                // Rare control character
                let _ = write!(out, "\\u{:04x}", b);
            }
            b => out.push(b),
        }
    }
    out.push(b'"');
}

/// Generates a random lowercase alphanumeric identifier of `len` characters.
pub fn generate_instance_id(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// Builds the JSON object fragment common to all events: hostname, pid,
/// optional app name, optional random per-run instance id, plus any
/// caller-supplied attributes. Returns an empty fragment when everything is
/// disabled.
pub fn common_event_json(
    settings: &Settings,
    hostname_override: Option<&str>,
    additional_attributes: &BTreeMap<String, String>,
) -> Vec<u8> {
    let mut fragment = Vec::new();

    if settings.include_common_metadata {
        let effective_hostname = match hostname_override {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_default(),
        };

        fragment.extend_from_slice(b"\"hostname\": ");
        append_json_escaped(&mut fragment, effective_hostname.as_bytes());
        let _ = write!(fragment, ", \"pid\": {}", std::process::id());

        if let Some(app) = &settings.app_name {
            if !app.is_empty() {
                fragment.extend_from_slice(b", \"app\": ");
                append_json_escaped(&mut fragment, app.as_bytes());
            }
        }

        if settings.add_random_instance_id {
            let instance_id = generate_instance_id(16);
            fragment.extend_from_slice(b", \"instance_id\": ");
            append_json_escaped(&mut fragment, instance_id.as_bytes());
        }
    }

    for (key, value) in additional_attributes {
        if !fragment.is_empty() {
            fragment.push(b',');
        }
        append_json_escaped(&mut fragment, key.as_bytes());
        fragment.push(b':');
        append_json_escaped(&mut fragment, value.as_bytes());
    }

    fragment
}

/// Assembles event objects into a JSON array, reusing its buffer across
/// flush cycles.
#[derive(Debug)]
pub struct PayloadBuilder {
    common_event_json: Vec<u8>,
    buf: Vec<u8>,
    event_count: usize,
}

impl PayloadBuilder {
    /// Creates a builder with the given common-metadata fragment. The buffer
    /// is sized for a full request plus escaping overhead up front.
    pub fn new(common_event_json: Vec<u8>, bytes_per_request: usize) -> Self {
        let capacity = bytes_per_request + 4096 + bytes_per_request / 10;
        PayloadBuilder {
            common_event_json,
            buf: Vec::with_capacity(capacity),
            event_count: 0,
        }
    }

    /// Starts a new payload, discarding any previous contents.
    pub fn begin(&mut self) {
        self.buf.clear();
        self.buf.push(b'[');
        self.event_count = 0;
    }

    /// Appends one event whose `message` field is the escaped `line` text.
    pub fn append_message(&mut self, line: &[u8]) {
        if self.event_count > 0 {
            self.buf.push(b',');
        }
        self.buf.push(b'{');
        if !self.common_event_json.is_empty() {
            self.buf.extend_from_slice(&self.common_event_json);
            self.buf.push(b',');
        }
        self.buf.extend_from_slice(b"\"message\":");
        append_json_escaped(&mut self.buf, line);
        self.buf.push(b'}');
        self.event_count += 1;
    }

    /// Closes the array and returns the finished document. An empty payload
    /// is `[]`; callers never send that.
    pub fn finish(&mut self) -> &[u8] {
        self.buf.push(b']');
        &self.buf
    }

    /// Number of events appended since the last [`begin`](Self::begin).
    pub fn event_count(&self) -> usize {
        self.event_count
    }
}
