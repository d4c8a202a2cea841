// src/lib.rs

//! A/B slot over-the-air update engine
//!
//! Installs firmware bundles on headless embedded Linux devices with two
//! interchangeable partition slots. The running slot is never written; the
//! other one receives the new images and is activated only once they are
//! safely on disk.
//!
//! # Architecture
//!
//! - Streaming: bundles are read once, front to back, and decoded through
//!   external decrypt/decompress filter processes
//! - Slot safety: the target is made unbootable before any write and
//!   activated only after a successful sync
//! - Status directory: one small file per field, polled by external monitors
//! - Exit codes: every fatal condition maps to a distinct process exit code

pub mod command;
pub mod compression;
pub mod config;
pub mod delta;
pub mod engine;
mod error;
pub mod extract;
pub mod hash;
pub mod manifest;
pub mod pipeline;
pub mod platform;
pub mod progress;
pub mod signature;
pub mod slot;
pub mod source;
pub mod status;

pub use config::EngineConfig;
pub use engine::{UpdateEngine, UpdateState};
pub use error::{Error, Result, exit_code};
pub use manifest::{Manifest, ManifestValidator, SectionKind, UpdateClass};
pub use pipeline::{DecodePipeline, PipelineOptions};
pub use progress::{BarProgress, LogProgress, ProgressTracker, SilentProgress};
pub use slot::{Partition, Slot, SlotLayout, SlotPair};
pub use status::{StatusField, StatusSink};
