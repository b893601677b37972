// Copyright 2025-Present Shiplog, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Durable progress marker for the shipped-offset checkpoint.
//!
//! The marker is a tiny INI-like key/value file colocated with the source
//! log, one section and one key:
//!
//! ```ini
//! [ShipperState]
//! ShippedLogOffset=123456
//! ```
//!
//! The offset is encoded as an `f64`, exact for integers up to 2^53 — more
//! than any realistic file size. Writes are flushed to disk before
//! returning, so a crash immediately after a checkpoint cannot silently
//! lose it. A crash between delivery acceptance and the checkpoint write
//! re-ships the last payload on the next run; that is the accepted cost of
//! the at-least-once delivery model.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

const STATE_SECTION: &str = "ShipperState";
const OFFSET_KEY: &str = "ShippedLogOffset";

/// Reads, writes and deletes the shipped-offset checkpoint file.
///
/// This is a pure storage collaborator: the streaming worker alone decides
/// when the offset advances.
#[derive(Debug, Clone)]
pub struct ProgressMarker {
    path: PathBuf,
}

impl ProgressMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ProgressMarker { path: path.into() }
    }

    /// The conventional marker path for a source log: a sibling file named
    /// `<file name>.shipper-state.ini`.
    pub fn for_log_file(log_path: &Path) -> Self {
        let mut name = log_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(".shipper-state.ini");
        ProgressMarker::new(log_path.with_file_name(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the persisted offset. A missing file is offset 0; an unreadable
    /// or unparsable file logs a warning and also yields 0, restarting the
    /// stream from the beginning rather than refusing to run.
    pub fn read(&self) -> u64 {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!("failed to read progress marker {}: {e}", self.path.display());
                return 0;
            }
        };

        match parse_offset(&contents) {
            Some(offset) => offset,
            None => {
                warn!(
                    "failed to parse progress marker {}, restarting from offset 0",
                    self.path.display()
                );
                0
            }
        }
    }

    /// Persists `offset`, synchronously flushed before returning.
    pub fn write(&self, offset: u64) -> io::Result<()> {
        let contents = format!("[{STATE_SECTION}]\n{OFFSET_KEY}={}\n", offset as f64);
        let mut file = fs::File::create(&self.path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()
    }

    /// Removes the marker file. Called only once the whole source file has
    /// been drained and purged; a missing file is not an error.
    pub fn delete(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("failed to delete progress marker {}: {e}", self.path.display());
            }
        }
    }
}

fn parse_offset(contents: &str) -> Option<u64> {
    let mut in_section = false;
    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('[') && line.ends_with(']') {
            in_section = line == format!("[{STATE_SECTION}]");
            continue;
        }
        if !in_section {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == OFFSET_KEY {
                let parsed = value.trim().parse::<f64>().ok()?;
                if !parsed.is_finite() || parsed < 0.0 {
                    return None;
                }
                return Some(parsed as u64);
            }
        }
    }
    None
}
