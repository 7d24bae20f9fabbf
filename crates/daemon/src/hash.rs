// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Anvil Contributors

//! Content fingerprints for cache entries.
//!
//! Every cached compilation is named by a hex digest assembled from the
//! source bytes, the cache-relevant command line, and the compiler version.
//! Digests are opaque keys; nothing outside this module parses them.

use std::path::Path;

/// Version salt mixed into unhandled-source fingerprints.
///
/// Raw-source keys must go stale when the daemon itself changes, since the
/// header discovery and command-line normalization baked into them may
/// change between releases. Preprocessed-source keys carry no salt.
const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fingerprint of a preprocessed source + command line + version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandledHash(pub String);

/// Fingerprint of a raw source + command line + version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnhandledHash(pub String);

impl std::fmt::Display for HandledHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for UnhandledHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 16-byte content digest.
fn digest16(data: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&blake3::hash(data).as_bytes()[..16]);
    out
}

/// 4-byte content digest.
fn digest4(data: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&blake3::hash(data).as_bytes()[..4]);
    out
}

/// Fingerprint a preprocessed source.
pub fn hash_handled(source: &[u8], command_line: &str, version: &str) -> HandledHash {
    HandledHash(format!(
        "{}-{}-{}",
        hex::encode(digest16(source)),
        hex::encode(digest4(command_line.as_bytes())),
        hex::encode(digest4(version.as_bytes())),
    ))
}

/// Fingerprint a raw source.
///
/// The version part is salted with the daemon release so raw-source keys
/// don't outlive the logic that produced them.
pub fn hash_unhandled(source: &[u8], command_line: &str, version: &str) -> UnhandledHash {
    let salted = format!("{version}\n{TOOL_VERSION}");
    UnhandledHash(format!(
        "{}-{}-{}",
        hex::encode(digest16(source)),
        hex::encode(digest4(command_line.as_bytes())),
        hex::encode(digest4(salted.as_bytes())),
    ))
}

/// Combine an unhandled fingerprint with header content digests into the
/// key used by the direct-tier index.
pub fn hash_direct(unhandled: &UnhandledHash, header_digests: &[[u8; 16]]) -> String {
    let mut pre_image = Vec::with_capacity(unhandled.0.len() + header_digests.len() * 16);
    pre_image.extend_from_slice(unhandled.0.as_bytes());
    for digest in header_digests {
        pre_image.extend_from_slice(digest);
    }
    hex::encode(digest16(&pre_image))
}

/// Digest header content, refusing content that contains any skip-list
/// token.
///
/// Headers that expand compilation-time-sensitive macros must never enter
/// the direct tier; a refusal is reported as `None` and the caller skips
/// direct caching for the compilation.
pub fn hash_header(content: &[u8], skip_list: &[String]) -> Option<[u8; 16]> {
    for token in skip_list {
        if !token.is_empty()
            && content
                .windows(token.len())
                .any(|window| window == token.as_bytes())
        {
            return None;
        }
    }
    Some(digest16(content))
}

/// Stable shard assignment for task affinity.
pub fn shard_of(key: &[u8], shards: u32) -> u32 {
    if shards == 0 {
        return 0;
    }
    u32::from_le_bytes(digest4(key)) % shards
}

/// Read and digest a header file. `Ok(None)` is a skip-list refusal.
pub fn hash_header_file(
    path: &Path,
    skip_list: &[String],
) -> std::io::Result<Option<[u8; 16]>> {
    let content = std::fs::read(path)?;
    Ok(hash_header(&content, skip_list))
}

#[cfg(test)]
#[path = "hash_tests.rs"]
mod tests;
