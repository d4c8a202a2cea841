// src/hash.rs

//! SHA-256 helpers for image integrity
//!
//! Image sections carry an expected SHA-256 of their decoded content. The
//! digest is accumulated while bytes stream past, since images are never
//! held in memory as a whole.

use sha2::{Digest, Sha256};
use std::fmt;

/// Rolling SHA-256 over streamed bytes
#[derive(Clone, Default)]
pub struct RollingDigest {
    hasher: Sha256,
    len: u64,
}

impl RollingDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.len += data.len() as u64;
    }

    /// Bytes hashed so far
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Lowercase hex digest of everything seen so far
    pub fn hex_digest(&self) -> String {
        format!("{:x}", self.hasher.clone().finalize())
    }
}

impl fmt::Debug for RollingDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollingDigest").field("len", &self.len).finish()
    }
}

/// Compute SHA-256 of a byte slice as lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Case-insensitive comparison of hex digests
pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

/// Bucket 0..100 from the SHA-256 of a value, read as a big-endian integer
pub fn shard_bucket(value: &[u8]) -> u8 {
    let bucket = Sha256::digest(value)
        .iter()
        .fold(0u32, |acc, &byte| (acc * 256 + u32::from(byte)) % 100);
    bucket as u8
}
