// src/slot.rs

//! Partition slot selection and device access
//!
//! The device has two interchangeable slots (`a`, `b`) and a read-only
//! factory slot (`f`). The running slot is derived from the kernel command
//! line and always paired with a different target slot, so the booted slot
//! can never be chosen as a write target by accident.
//!
//! Device paths come from a fixed `(Partition, Slot)` table rooted at the
//! by-name block device directory:
//!
//! | Partition | a        | b        | f          |
//! |-----------|----------|----------|------------|
//! | boot      | boot_a   | boot_b   | recovery   |
//! | system    | system_a | system_b | recoveryfs |

use crate::command::ToolCommand;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Kernel command-line key carrying the booted slot suffix
pub const SLOT_SUFFIX_KEY: &str = "androidboot.slot_suffix";

/// Label of the bootloader partition written by factory updates
const ABOOT_LABEL: &str = "aboot";

/// Slot related errors
#[derive(Error, Debug)]
pub enum SlotError {
    #[error("refusing to zero the factory slot")]
    FactorySlot,

    #[error("no device for {partition} in slot {slot}")]
    UnknownDevice { partition: Partition, slot: Slot },

    #[error("partition device {} not present: {source}", .path.display())]
    MissingDevice { path: PathBuf, source: io::Error },

    #[error("failed to write {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("boot control failed: {0}")]
    BootControl(String),
}

/// A partition slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    A,
    B,
    /// Factory/recovery slot
    F,
}

impl Slot {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
            Self::F => "f",
        }
    }

    pub fn is_factory(&self) -> bool {
        matches!(self, Self::F)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Slot-switched partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Partition {
    Boot,
    System,
}

impl Partition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boot => "boot",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The running slot and the slot an update writes to
///
/// Only constructible from a boot suffix, which guarantees `current != target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPair {
    current: Slot,
    target: Slot,
}

impl SlotPair {
    /// Pair the booted slot with its update target
    ///
    /// `_a` -> (a, b), `_b` -> (b, a), anything else -> (f, a).
    pub fn from_suffix(suffix: Option<&str>) -> Self {
        let (current, target) = match suffix {
            Some("_a") => (Slot::A, Slot::B),
            Some("_b") => (Slot::B, Slot::A),
            _ => (Slot::F, Slot::A),
        };
        Self { current, target }
    }

    /// Resolve slots from parsed kernel command-line arguments
    pub fn from_cmdline(cmdline: &HashMap<String, Option<String>>) -> Self {
        let suffix = cmdline.get(SLOT_SUFFIX_KEY).and_then(|v| v.as_deref());
        Self::from_suffix(suffix)
    }

    pub fn current(&self) -> Slot {
        self.current
    }

    pub fn target(&self) -> Slot {
        self.target
    }
}

/// Parse `/proc/cmdline` style text into a key -> optional value map
pub fn parse_cmdline(content: &str) -> HashMap<String, Option<String>> {
    content
        .split_whitespace()
        .map(|arg| match arg.split_once('=') {
            Some((key, value)) => (key.to_string(), Some(value.to_string())),
            None => (arg.to_string(), None),
        })
        .collect()
}

/// Read and parse the running kernel's command line
pub fn read_cmdline(path: &Path) -> io::Result<HashMap<String, Option<String>>> {
    Ok(parse_cmdline(&std::fs::read_to_string(path)?))
}

/// `(Partition, Slot)` -> device path table
#[derive(Debug, Clone)]
pub struct SlotLayout {
    device_dir: PathBuf,
    devices: BTreeMap<(Partition, Slot), PathBuf>,
    zero_block_size: usize,
}

impl SlotLayout {
    /// Build the device table under the by-name directory
    pub fn new(device_dir: impl Into<PathBuf>, zero_block_size: usize) -> Self {
        let device_dir = device_dir.into();
        let mut devices = BTreeMap::new();
        for partition in [Partition::Boot, Partition::System] {
            for slot in [Slot::A, Slot::B, Slot::F] {
                let label = match (partition, slot) {
                    (Partition::Boot, Slot::F) => "recovery".to_string(),
                    (Partition::System, Slot::F) => "recoveryfs".to_string(),
                    (partition, slot) => format!("{}_{}", partition, slot),
                };
                devices.insert((partition, slot), device_dir.join(label));
            }
        }
        Self {
            device_dir,
            devices,
            zero_block_size,
        }
    }

    /// Device path for a partition in a slot
    pub fn device_path(&self, partition: Partition, slot: Slot) -> Result<&Path, SlotError> {
        self.devices
            .get(&(partition, slot))
            .map(PathBuf::as_path)
            .ok_or(SlotError::UnknownDevice { partition, slot })
    }

    /// Bootloader device, outside of the slot scheme
    pub fn aboot_path(&self) -> PathBuf {
        self.device_dir.join(ABOOT_LABEL)
    }

    pub fn open_aboot_for_write(&self) -> Result<File, SlotError> {
        open_device(&self.aboot_path())
    }

    /// Check that every device of the given slots exists
    pub fn validate(&self, slots: &[Slot]) -> Result<(), SlotError> {
        for ((_, slot), path) in &self.devices {
            if !slots.contains(slot) {
                continue;
            }
            std::fs::metadata(path).map_err(|source| SlotError::MissingDevice {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Open a slot partition for writing from offset zero
    pub fn open_for_write(&self, partition: Partition, slot: Slot) -> Result<File, SlotError> {
        let path = self.device_path(partition, slot)?;
        open_device(path)
    }

    /// Size in bytes of a slot partition (seek to end, works for block devices)
    pub fn partition_size(&self, partition: Partition, slot: Slot) -> Result<u64, SlotError> {
        let path = self.device_path(partition, slot)?;
        let mut file = File::open(path).map_err(|source| SlotError::MissingDevice {
            path: path.to_path_buf(),
            source,
        })?;
        file.seek(SeekFrom::End(0))
            .map_err(|source| SlotError::MissingDevice {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Write a zero block over the start of the named partitions
    ///
    /// Overwriting the factory slot's boot sentinel is never valid, so `f`
    /// is rejected before anything is opened.
    pub fn zero_first_block(&self, slot: Slot, partitions: &[Partition]) -> Result<(), SlotError> {
        if slot.is_factory() {
            return Err(SlotError::FactorySlot);
        }
        let zeros = vec![0u8; self.zero_block_size];
        for &partition in partitions {
            let path = self.device_path(partition, slot)?;
            debug!("Zeroing first block of {}", path.display());
            let mut device = open_device(path)?;
            device
                .write_all(&zeros)
                .and_then(|_| device.flush())
                .map_err(|source| SlotError::Write {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
        Ok(())
    }
}

fn open_device(path: &Path) -> Result<File, SlotError> {
    OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|source| SlotError::MissingDevice {
            path: path.to_path_buf(),
            source,
        })
}

/// Actions understood by the boot-control utility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAction {
    SetUnbootable,
    SetActive,
}

impl SlotAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SetUnbootable => "set_unbootable",
            Self::SetActive => "set_active",
        }
    }
}

/// Marks slots bootable/active through the platform boot-control utility
pub trait BootControl {
    fn apply(&self, current: Slot, action: SlotAction, target: Slot) -> Result<(), SlotError>;
}

/// Boot control backed by an external `<tool> <current> <action> <target>` command
#[derive(Debug, Clone)]
pub struct BootctlCommand {
    tool: ToolCommand,
}

impl BootctlCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            tool: ToolCommand::new(program),
        }
    }
}

impl BootControl for BootctlCommand {
    fn apply(&self, current: Slot, action: SlotAction, target: Slot) -> Result<(), SlotError> {
        info!("bootctl {} {} {}", current, action.as_str(), target);
        self.tool
            .run(&[current.as_str(), action.as_str(), target.as_str()])
            .map_err(|e| SlotError::BootControl(e.to_string()))
    }
}
