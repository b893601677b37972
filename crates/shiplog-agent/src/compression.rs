// Copyright 2025-Present Shiplog, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Payload compression for the delivery path.
//!
//! Payloads are compressed as raw lz4 blocks (no frame header), which is why
//! delivery must send the original length out of band: the receiver needs it
//! to size the decompression buffer. Decompression only exists for the local
//! NDJSON debug sink and for tests; the HTTP path never decompresses.

use lz4_flex::block;
use thiserror::Error;

/// Maximum input the lz4 block format can represent (0x7E000000).
///
/// Payload sizes are validated against this bound before encoding; an
/// oversized input is a hard failure of the compression step and aborts the
/// flush cycle.
pub const MAX_LZ4_INPUT_SIZE: usize = 0x7E00_0000;

/// How a finished payload is encoded before delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMode {
    /// Pass the JSON payload through unmodified.
    None,
    /// Raw lz4 block compression.
    #[default]
    Lz4Block,
}

impl CompressionMode {
    /// The `Content-Encoding` token for this mode, if any.
    pub fn content_encoding(self) -> Option<&'static str> {
        match self {
            CompressionMode::None => None,
            CompressionMode::Lz4Block => Some("lz4-block"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("payload of {len} bytes exceeds the lz4 block input limit")]
    InputTooLarge { len: usize },
    #[error("lz4 block compression failed: {0}")]
    Compress(#[from] block::CompressError),
    #[error("lz4 block decompression failed: {0}")]
    Decompress(#[from] block::DecompressError),
}

/// Encodes `data` according to `mode`.
pub fn compress(mode: CompressionMode, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    match mode {
        CompressionMode::None => Ok(data.to_vec()),
        CompressionMode::Lz4Block => {
            if data.len() > MAX_LZ4_INPUT_SIZE {
                return Err(CompressionError::InputTooLarge { len: data.len() });
            }
            let mut buffer = vec![0u8; block::get_maximum_output_size(data.len())];
            let compressed_len = block::compress_into(data, &mut buffer)?;
            buffer.truncate(compressed_len);
            Ok(buffer)
        }
    }
}

/// Decodes `data` back to `original_len` bytes according to `mode`.
pub fn decompress(
    mode: CompressionMode,
    data: &[u8],
    original_len: usize,
) -> Result<Vec<u8>, CompressionError> {
    match mode {
        CompressionMode::None => Ok(data.to_vec()),
        CompressionMode::Lz4Block => Ok(block::decompress(data, original_len)?),
    }
}
