// src/error.rs

//! Error types for the update engine
//!
//! Every fatal condition of a run is one `Error`, and every `Error` maps to
//! exactly one process exit code through [`Error::exit_code`]. Callers such
//! as the update scheduler tell failure classes apart by that code alone.

use crate::command::CommandError;
use crate::compression::CompressionError;
use crate::delta::PayloadError;
use crate::extract::ExtractError;
use crate::manifest::ManifestError;
use crate::pipeline::PipelineError;
use crate::signature::SignatureError;
use crate::slot::SlotError;
use crate::source::SourceError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for update engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Exit codes reported to the caller
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const UNEXPECTED_ENTRY: i32 = 200;
    pub const MANIFEST: i32 = 201;
    pub const PLATFORM_TOOL: i32 = 202;
    pub const URL_OPEN: i32 = 203;
    pub const ARCHIVE_OPEN: i32 = 204;
    pub const DECOMPRESSION: i32 = 205;
    pub const PAYLOAD: i32 = 207;
    pub const IO: i32 = 208;
    pub const DIGEST: i32 = 209;
    pub const ENCRYPTION: i32 = 210;
    pub const BASE_VERSION: i32 = 211;
    pub const FILTER_EXCEPTION: i32 = 212;
    pub const SERIAL_MISMATCH: i32 = 213;
    pub const DEVICE_CLASS: i32 = 214;
    pub const STALLED: i32 = 215;
    pub const VERSION_REFUSED: i32 = 216;
    pub const INHIBITED: i32 = 217;
    pub const UNCAUGHT: i32 = 219;
}

/// Fatal update errors
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Slot(#[from] SlotError),

    #[error("delta payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    Compression(#[from] CompressionError),

    #[error("failed to open bundle: {0}")]
    ArchiveOpen(io::Error),

    #[error("failed to sync: {0}")]
    Sync(CommandError),

    #[error("could not mount {} writeable: {source}", .path.display())]
    Mount { path: PathBuf, source: CommandError },

    #[error("automatic update inhibited by {}", .0.display())]
    Inhibited(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> i32 {
        use exit_code::*;

        match self {
            Self::Manifest(e) => match e {
                ManifestError::DeviceClassMismatch(_) => DEVICE_CLASS,
                ManifestError::SerialMismatch { .. } | ManifestError::SerialUnavailable(_) => {
                    SERIAL_MISMATCH
                }
                ManifestError::VersionRefused(_) => VERSION_REFUSED,
                ManifestError::BaseVersionMismatch { .. } => BASE_VERSION,
                _ => MANIFEST,
            },
            Self::Pipeline(e) => pipeline_code(e),
            Self::Extract(e) => match e {
                ExtractError::UnexpectedEntry { .. } | ExtractError::MissingEntry(_) => {
                    UNEXPECTED_ENTRY
                }
                ExtractError::MissingSection(_) => MANIFEST,
                ExtractError::Archive(e) if is_timeout(e) => STALLED,
                ExtractError::Archive(_) => ARCHIVE_OPEN,
                ExtractError::Pipeline(e) => pipeline_code(e),
                ExtractError::DigestMismatch { .. } | ExtractError::MissingDigest(_) => DIGEST,
            },
            Self::Slot(e) => match e {
                SlotError::MissingDevice { .. } | SlotError::Write { .. } => IO,
                SlotError::BootControl(_) => PLATFORM_TOOL,
                SlotError::FactorySlot | SlotError::UnknownDevice { .. } => UNCAUGHT,
            },
            Self::Payload(_) => PAYLOAD,
            Self::Source(e) => match e {
                SourceError::Stalled(_) => STALLED,
                _ => URL_OPEN,
            },
            Self::Signature(_) => DIGEST,
            Self::Compression(_) => DECOMPRESSION,
            Self::ArchiveOpen(e) if is_timeout(e) => STALLED,
            Self::ArchiveOpen(_) => ARCHIVE_OPEN,
            Self::Sync(_) => IO,
            Self::Mount { .. } => PLATFORM_TOOL,
            Self::Inhibited(_) => INHIBITED,
            Self::Io(e) if is_timeout(e) => STALLED,
            Self::Io(_) => IO,
        }
    }

    /// Whether the failure was a transfer that stopped moving
    pub fn is_stalled(&self) -> bool {
        self.exit_code() == exit_code::STALLED
    }
}

fn pipeline_code(e: &PipelineError) -> i32 {
    use exit_code::*;

    match e {
        PipelineError::UnsupportedEncryption(_) => ENCRYPTION,
        PipelineError::NothingToDecode(_) => MANIFEST,
        PipelineError::Stalled { .. } => STALLED,
        PipelineError::Exceptional(_) => FILTER_EXCEPTION,
        PipelineError::Source(e) if is_timeout(e) => STALLED,
        PipelineError::Source(_) | PipelineError::Destination(_) => IO,
        PipelineError::UnsupportedCompression(_)
        | PipelineError::Spawn { .. }
        | PipelineError::FilterFailed { .. }
        | PipelineError::FilterHung { .. }
        | PipelineError::LengthMismatch { .. } => DECOMPRESSION,
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}
