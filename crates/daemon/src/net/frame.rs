// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Anvil Contributors

//! Wire framing: `ZLIB( varint32(len) || payload )`.
//!
//! The length prefix and the payload are deflated together in a single
//! zlib stream per message, one stream after another on the same socket.
//! The buffered-reader decoder consumes exactly the compressed bytes of
//! its stream, so the next frame starts where the previous one ended.

use std::io::{BufRead, Read, Write};

use flate2::Compression;
use prost::Message;

use crate::proto::Universal;

/// Messages refusing to fit this bound are malformed, not gigantic.
const MAX_PAYLOAD: u64 = 256 * 1024 * 1024;

#[derive(Debug)]
pub enum FrameError {
    /// Framing, checksum, or parse failure; the peer spoke garbage.
    BadMessage(String),
    /// Socket-level failure: timeout, closed peer, short write.
    Network(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::BadMessage(message) => write!(f, "bad message: {}", message),
            FrameError::Network(message) => write!(f, "network: {}", message),
        }
    }
}

impl std::error::Error for FrameError {}

/// Serialize and deflate one message.
pub fn encode(message: &Universal) -> Result<Vec<u8>, FrameError> {
    let payload = message.encode_to_vec();
    let mut inner = Vec::with_capacity(payload.len() + 5);
    prost::encoding::encode_varint(payload.len() as u64, &mut inner);
    inner.extend_from_slice(&payload);

    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&inner)
        .and_then(|()| encoder.finish())
        .map_err(|e| FrameError::Network(e.to_string()))
}

/// Read exactly one frame off `reader` and parse it.
pub fn read_from<R: BufRead>(reader: &mut R) -> Result<Universal, FrameError> {
    let mut decoder = flate2::bufread::ZlibDecoder::new(reader);
    let mut inner = Vec::new();
    match decoder.read_to_end(&mut inner) {
        Ok(_) => {}
        Err(e) => {
            return Err(match e.kind() {
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                    FrameError::Network(format!("read timed out: {}", e))
                }
                // Nothing arrived at all: the peer is gone. A stream that
                // dies mid-frame is a framing error instead.
                _ if decoder.total_in() == 0 => {
                    FrameError::Network(format!("connection closed: {}", e))
                }
                _ => FrameError::BadMessage(format!("incomplete frame: {}", e)),
            });
        }
    }
    if inner.is_empty() {
        return Err(FrameError::Network("connection closed".to_string()));
    }
    decode(&inner)
}

/// Parse a deflated frame's inner bytes.
pub fn decode(inner: &[u8]) -> Result<Universal, FrameError> {
    let mut buf = inner;
    let length = prost::encoding::decode_varint(&mut buf)
        .map_err(|e| FrameError::BadMessage(format!("unreadable message size: {}", e)))?;
    if length == 0 {
        return Err(FrameError::BadMessage("message has zero size".to_string()));
    }
    if length > MAX_PAYLOAD {
        return Err(FrameError::BadMessage(format!(
            "message of {} bytes exceeds the limit",
            length
        )));
    }
    if length != buf.len() as u64 {
        return Err(FrameError::BadMessage(format!(
            "message size {} does not match the frame ({} bytes)",
            length,
            buf.len()
        )));
    }
    Universal::decode(buf).map_err(|e| FrameError::BadMessage(format!("malformed message: {}", e)))
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
