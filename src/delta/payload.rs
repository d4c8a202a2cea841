// src/delta/payload.rs

//! Interface to the external binary-diff payload engine
//!
//! The engine owns the patch algebra. This side opens a staged payload,
//! reads its size metadata for progress estimation, and drives the apply
//! step while receiving per-operation ticks and coarse phase names.

use crate::command::ToolCommand;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("failed to open payload: {0}")]
    Open(String),

    #[error("payload metadata is missing `{0}`")]
    MissingField(String),

    #[error("payload metadata has invalid `{key}` value {value:?}")]
    InvalidField { key: String, value: String },

    #[error("failed to apply payload: {0}")]
    Apply(String),
}

/// Size metadata of a parsed payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadSummary {
    pub old_rootfs_size: u64,
    pub old_kernel_size: u64,
    pub new_rootfs_size: u64,
    pub new_kernel_size: u64,
    /// Number of rootfs install operations
    pub install_operations: u64,
    /// Number of kernel install operations
    pub kernel_install_operations: u64,
}

impl PayloadSummary {
    const FIELDS: [&'static str; 6] = [
        "old_rootfs_size",
        "old_kernel_size",
        "new_rootfs_size",
        "new_kernel_size",
        "install_operations",
        "kernel_install_operations",
    ];

    /// Parse `key=value` lines; unknown keys are ignored
    pub fn parse(content: &str) -> Result<Self, PayloadError> {
        let values: HashMap<&str, &str> = content
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim()))
            .collect();

        let mut numbers = [0u64; 6];
        for (slot, key) in numbers.iter_mut().zip(Self::FIELDS) {
            let value = values
                .get(key)
                .ok_or_else(|| PayloadError::MissingField(key.to_string()))?;
            *slot = value.parse().map_err(|_| PayloadError::InvalidField {
                key: key.to_string(),
                value: value.to_string(),
            })?;
        }

        let [
            old_rootfs_size,
            old_kernel_size,
            new_rootfs_size,
            new_kernel_size,
            install_operations,
            kernel_install_operations,
        ] = numbers;
        Ok(Self {
            old_rootfs_size,
            old_kernel_size,
            new_rootfs_size,
            new_kernel_size,
            install_operations,
            kernel_install_operations,
        })
    }
}

/// Devices a payload is applied to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyTargets {
    pub new_kernel: PathBuf,
    pub new_rootfs: PathBuf,
    pub old_kernel: PathBuf,
    pub old_rootfs: PathBuf,
    /// Truncate targets to the payload's expected size
    pub truncate_to_expected_size: bool,
}

/// Receives engine callbacks during apply
pub trait PayloadObserver {
    /// One install operation finished
    fn tick(&mut self);

    /// Engine entered a named phase
    fn phase(&mut self, name: &str);
}

/// A parsed payload, owned for one application
pub trait DeltaPayload {
    fn summary(&self) -> &PayloadSummary;

    fn apply(&mut self, targets: &ApplyTargets, observer: &mut dyn PayloadObserver) -> Result<(), PayloadError>;
}

/// Opens staged payload files
pub trait PayloadEngine {
    fn open(&self, path: &Path) -> Result<Box<dyn DeltaPayload>, PayloadError>;
}

/// Payload engine run as an external program
///
/// `<program> info <payload>` prints the summary as `key=value` lines.
/// `<program> apply <payload> <new kernel> <new rootfs> <old kernel> <old rootfs>`
/// prints `tick` after each operation and `phase <name>` on phase changes,
/// and exits non-zero on failure.
#[derive(Debug, Clone)]
pub struct ExternalPayloadEngine {
    tool: ToolCommand,
}

impl ExternalPayloadEngine {
    pub fn new(tool: ToolCommand) -> Self {
        Self { tool }
    }
}

impl PayloadEngine for ExternalPayloadEngine {
    fn open(&self, path: &Path) -> Result<Box<dyn DeltaPayload>, PayloadError> {
        let info = self
            .tool
            .output(&[OsStr::new("info"), path.as_os_str()])
            .map_err(|e| PayloadError::Open(e.to_string()))?;
        let summary = PayloadSummary::parse(&info)?;
        debug!("Opened payload {}: {:?}", path.display(), summary);
        Ok(Box::new(ExternalPayload {
            tool: self.tool.clone(),
            path: path.to_path_buf(),
            summary,
        }))
    }
}

struct ExternalPayload {
    tool: ToolCommand,
    path: PathBuf,
    summary: PayloadSummary,
}

impl DeltaPayload for ExternalPayload {
    fn summary(&self) -> &PayloadSummary {
        &self.summary
    }

    fn apply(&mut self, targets: &ApplyTargets, observer: &mut dyn PayloadObserver) -> Result<(), PayloadError> {
        let program = self.tool.program();
        let mut command = Command::new(program);
        command
            .args(self.tool.prefix_args())
            .arg("apply")
            .arg(&self.path)
            .arg(&targets.new_kernel)
            .arg(&targets.new_rootfs)
            .arg(&targets.old_kernel)
            .arg(&targets.old_rootfs);
        if targets.truncate_to_expected_size {
            command.arg("--truncate");
        }

        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| PayloadError::Apply(format!("{}: {}", program.display(), e)))?;

        if let Some(stdout) = child.stdout.take()
            && let Err(e) = report_progress(stdout, observer)
        {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PayloadError::Apply(format!("reading engine output: {}", e)));
        }

        let status = child
            .wait()
            .map_err(|e| PayloadError::Apply(e.to_string()))?;
        if !status.success() {
            warn!("Payload engine exited with {}", status);
            return Err(PayloadError::Apply(format!(
                "engine exited with status {}",
                status.code().unwrap_or(-1)
            )));
        }
        Ok(())
    }
}

/// Forward `tick` and `phase` lines from the engine's stdout
fn report_progress(stdout: impl Read, observer: &mut dyn PayloadObserver) -> io::Result<()> {
    for line in BufReader::new(stdout).lines() {
        let line = line?;
        match line.trim() {
            "tick" => observer.tick(),
            other => match other.strip_prefix("phase ") {
                Some(name) => observer.phase(name.trim()),
                None if other.is_empty() => {}
                None => debug!("payload engine: {}", other),
            },
        }
    }
    Ok(())
}
