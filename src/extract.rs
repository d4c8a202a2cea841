// src/extract.rs

//! Partition image extraction
//!
//! Pulls the next bundle entry, checks its name, decodes it through a
//! [`DecodePipeline`] and writes it to a destination in fixed-size blocks.
//! Bundles are forward-only: the entry name is checked before a single byte
//! reaches the destination.

use crate::hash::digests_match;
use crate::manifest::{Manifest, SectionKind};
use crate::pipeline::{DecodePipeline, PipelineError, PipelineOptions};
use std::io::{self, Read, Write};
use thiserror::Error;
use tracing::{debug, info};

/// Default write block size for partition devices
pub const DEFAULT_WRITE_BLOCK: usize = 2 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("expected an entry ending in {expected}, found {found}")]
    UnexpectedEntry { expected: String, found: String },

    #[error("bundle ended before {0}")]
    MissingEntry(String),

    #[error("manifest has no [{0}] group")]
    MissingSection(SectionKind),

    #[error("failed to read bundle: {0}")]
    Archive(io::Error),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("{section} digest {actual} doesn't match manifest digest {expected}")]
    DigestMismatch {
        section: SectionKind,
        expected: String,
        actual: String,
    },

    #[error("manifest [{0}] declares no sha256")]
    MissingDigest(SectionKind),
}

/// Take the next bundle entry and require its name to end with `suffix`
pub fn next_entry<'a, R: Read>(
    entries: &mut tar::Entries<'a, R>,
    suffix: &str,
) -> Result<tar::Entry<'a, R>, ExtractError> {
    let entry = entries
        .next()
        .ok_or_else(|| ExtractError::MissingEntry(suffix.to_string()))?
        .map_err(ExtractError::Archive)?;
    let name = entry
        .path()
        .map_err(ExtractError::Archive)?
        .to_string_lossy()
        .into_owned();
    if !name.ends_with(suffix) {
        return Err(ExtractError::UnexpectedEntry {
            expected: suffix.to_string(),
            found: name,
        });
    }
    debug!("Reading bundle entry {}", name);
    Ok(entry)
}

/// Writes decoded sections to their destinations
#[derive(Debug, Clone)]
pub struct Extractor {
    options: PipelineOptions,
    write_block: usize,
    verify_digests: bool,
}

impl Extractor {
    pub fn new(options: PipelineOptions) -> Self {
        Self {
            options,
            write_block: DEFAULT_WRITE_BLOCK,
            verify_digests: false,
        }
    }

    pub fn with_write_block(mut self, block: usize) -> Self {
        self.write_block = block;
        self
    }

    /// Compare each section's decoded SHA-256 with the manifest's
    pub fn with_digest_verification(mut self, enabled: bool) -> Self {
        self.verify_digests = enabled;
        self
    }

    /// Extract the next entry as `section` into `dest`
    ///
    /// `progress` receives the section's running byte count after each
    /// block. Returns the number of bytes written.
    pub fn extract<R, W, F>(
        &self,
        manifest: &Manifest,
        entries: &mut tar::Entries<'_, R>,
        expected_suffix: &str,
        section: SectionKind,
        dest: &mut W,
        progress: F,
    ) -> Result<u64, ExtractError>
    where
        R: Read,
        W: Write + ?Sized,
        F: FnMut(u64),
    {
        let declared = manifest
            .section(section)
            .ok_or(ExtractError::MissingSection(section))?;
        let entry = next_entry(entries, expected_suffix)?;

        let options = self.options.clone().with_digest(self.verify_digests);
        let mut pipeline = DecodePipeline::new(entry, declared, &options)?;
        let written = pipeline.copy_to(dest, self.write_block, progress)?;

        if self.verify_digests {
            let expected = declared
                .sha256
                .as_deref()
                .ok_or(ExtractError::MissingDigest(section))?;
            let actual = pipeline
                .digest()
                .map(|d| d.hex_digest())
                .unwrap_or_default();
            if !digests_match(expected, &actual) {
                return Err(ExtractError::DigestMismatch {
                    section,
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        info!("Wrote {} bytes of {}", written, section);
        Ok(written)
    }
}
