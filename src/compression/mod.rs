// src/compression/mod.rs
//! Compression schemes named by bundle manifests
//!
//! Manifests name the compression of each section with a short tag. Image
//! sections are decoded by an external filter process (see
//! [`crate::pipeline`]); nested overlay archives are decoded in-process.

use std::io::Read;
use thiserror::Error;

/// Compression-related errors
#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Unsupported compression scheme {0:?}")]
    UnsupportedFormat(String),
}

/// Supported compression formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    /// No compression (raw data)
    None,
    /// Gzip compression (`gz`)
    Gzip,
    /// XZ/LZMA compression (`xz`), overlay archives only
    Xz,
}

impl CompressionFormat {
    /// Parse the manifest tag; an empty tag means uncompressed
    ///
    /// # Examples
    /// ```
    /// use update_engine::compression::CompressionFormat;
    ///
    /// assert_eq!(CompressionFormat::from_manifest("gz").unwrap(), CompressionFormat::Gzip);
    /// assert_eq!(CompressionFormat::from_manifest("").unwrap(), CompressionFormat::None);
    /// assert!(CompressionFormat::from_manifest("bz2").is_err());
    /// ```
    pub fn from_manifest(tag: &str) -> Result<Self, CompressionError> {
        match tag.trim() {
            "" => Ok(Self::None),
            "gz" | "gzip" => Ok(Self::Gzip),
            "xz" => Ok(Self::Xz),
            other => Err(CompressionError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Get a human-readable name for this format
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Xz => "xz",
        }
    }
}

impl std::fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Create a decompressing reader for the given format
///
/// For `CompressionFormat::None`, returns the reader unchanged.
pub fn create_decoder<'a, R: Read + 'a>(reader: R, format: CompressionFormat) -> Box<dyn Read + 'a> {
    match format {
        CompressionFormat::None => Box::new(reader),
        CompressionFormat::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
        CompressionFormat::Xz => Box::new(xz2::read::XzDecoder::new(reader)),
    }
}
