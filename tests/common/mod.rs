// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.
//!
//! A [`Rig`] is a throw-away device: partition files under a by-name
//! directory, a kernel command line, a status directory and a root
//! filesystem, all inside one temporary directory. Platform collaborators
//! are recording fakes writing to a single shared call log, so tests can
//! assert on the order of side effects.

#![allow(dead_code)]

use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use update_engine::command::CommandError;
use update_engine::delta::{
    ApplyTargets, DeltaPayload, PayloadEngine, PayloadError, PayloadObserver, PayloadSummary,
};
use update_engine::platform::{DeviceIdentity, EventSink, HostOps, OS_VERSION_PROP};
use update_engine::slot::{BootControl, Slot, SlotAction, SlotError};
use update_engine::{EngineConfig, ProgressTracker, StatusField, UpdateEngine};

/// Size of every fake partition
pub const PARTITION_SIZE: usize = 8192;
/// Fill byte of untouched partitions
pub const UNTOUCHED: u8 = 0xAA;
/// Zero block written over the start of invalidated partitions
pub const ZERO_BLOCK: usize = 512;

pub const RUNNING_VERSION: &str = "1.0.0.100d";
pub const DEVICE_SERIAL: &str = "00e20145";

/// Shared, ordered record of collaborator calls
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Index of the first entry starting with `prefix`
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.entries().iter().position(|e| e.starts_with(prefix))
    }

    pub fn contains(&self, prefix: &str) -> bool {
        self.position(prefix).is_some()
    }
}

/// Boot control that logs calls along with the state of the target's system partition
pub struct RecordingBootControl {
    log: CallLog,
    device_dir: PathBuf,
}

impl BootControl for RecordingBootControl {
    fn apply(&self, current: Slot, action: SlotAction, target: Slot) -> Result<(), SlotError> {
        let system = fs::read(self.device_dir.join(format!("system_{}", target))).unwrap_or_default();
        let written = system.iter().any(|&b| b != UNTOUCHED && b != 0);
        self.log.push(format!(
            "bootctl {} {} {} written={}",
            current,
            action.as_str(),
            target,
            written
        ));
        Ok(())
    }
}

pub struct RecordingHost {
    log: CallLog,
    fail_sync: bool,
}

impl HostOps for RecordingHost {
    fn sync(&self) -> Result<(), CommandError> {
        self.log.push("sync".to_string());
        if self.fail_sync {
            return Err(CommandError::Failed {
                program: "sync".to_string(),
                code: 1,
                stderr: "I/O error".to_string(),
            });
        }
        Ok(())
    }

    fn remount_rw(&self, mount_point: &Path) -> Result<(), CommandError> {
        self.log.push(format!("remount {}", mount_point.display()));
        Ok(())
    }

    fn reboot(&self) -> Result<(), CommandError> {
        self.log.push("reboot".to_string());
        Ok(())
    }
}

pub struct RecordingEvents(CallLog);

impl EventSink for RecordingEvents {
    fn emit(&self, name: &str, params: &[String]) {
        self.0.push(format!("event {} [{}]", name, params.join("|")));
    }
}

/// Progress mirror recording expected-size and progress changes
pub struct RecordingProgress {
    log: CallLog,
    position: Mutex<u64>,
    length: Mutex<u64>,
}

impl ProgressTracker for RecordingProgress {
    fn set_message(&self, message: &str) {
        self.log.push(format!("phase {}", message));
    }

    fn set_position(&self, position: u64) {
        *self.position.lock().unwrap() = position;
        self.log.push(format!("progress {}", position));
    }

    fn set_length(&self, length: u64) {
        *self.length.lock().unwrap() = length;
        self.log.push(format!("expected {}", length));
    }

    fn position(&self) -> u64 {
        *self.position.lock().unwrap()
    }

    fn length(&self) -> u64 {
        *self.length.lock().unwrap()
    }

    fn finish_with_message(&self, message: &str) {
        self.log.push(format!("finish {}", message));
    }

    fn finish_with_error(&self, message: &str) {
        self.log.push(format!("error {}", message));
    }

    fn is_finished(&self) -> bool {
        false
    }
}

pub struct FakeIdentity {
    pub version: String,
    pub serial: String,
    pub dev_class: bool,
}

impl Default for FakeIdentity {
    fn default() -> Self {
        Self {
            version: RUNNING_VERSION.to_string(),
            serial: DEVICE_SERIAL.to_string(),
            dev_class: true,
        }
    }
}

impl DeviceIdentity for FakeIdentity {
    fn property(&self, name: &str) -> Option<String> {
        (name == OS_VERSION_PROP).then(|| self.version.clone())
    }

    fn hardware_serial(&self) -> io::Result<String> {
        Ok(self.serial.clone())
    }

    fn is_dev_class(&self) -> bool {
        self.dev_class
    }
}

/// Payload engine that writes a marker to the new rootfs and ticks
pub struct FakePayloadEngine {
    pub log: CallLog,
    pub summary: PayloadSummary,
    pub ticks: u32,
    pub fail: bool,
}

struct FakePayload {
    log: CallLog,
    summary: PayloadSummary,
    ticks: u32,
    fail: bool,
}

impl PayloadEngine for FakePayloadEngine {
    fn open(&self, path: &Path) -> Result<Box<dyn DeltaPayload>, PayloadError> {
        let staged = fs::read(path).map_err(|e| PayloadError::Open(e.to_string()))?;
        self.log
            .push(format!("payload open {}", String::from_utf8_lossy(&staged)));
        Ok(Box::new(FakePayload {
            log: self.log.clone(),
            summary: self.summary,
            ticks: self.ticks,
            fail: self.fail,
        }))
    }
}

impl DeltaPayload for FakePayload {
    fn summary(&self) -> &PayloadSummary {
        &self.summary
    }

    fn apply(
        &mut self,
        targets: &ApplyTargets,
        observer: &mut dyn PayloadObserver,
    ) -> Result<(), PayloadError> {
        self.log.push(format!(
            "payload apply {}",
            targets.new_rootfs.file_name().unwrap().to_string_lossy()
        ));
        observer.phase("install");
        for _ in 0..self.ticks {
            observer.tick();
        }
        if self.fail {
            return Err(PayloadError::Apply("operation 3 failed".to_string()));
        }
        let mut rootfs = fs::OpenOptions::new()
            .write(true)
            .open(&targets.new_rootfs)
            .map_err(|e| PayloadError::Apply(e.to_string()))?;
        rootfs
            .write_all(b"patched")
            .map_err(|e| PayloadError::Apply(e.to_string()))?;
        observer.phase("post-install");
        Ok(())
    }
}

/// A throw-away device
pub struct Rig {
    pub temp: TempDir,
    pub config: EngineConfig,
    pub log: CallLog,
    pub identity: FakeIdentity,
    pub fail_sync: bool,
}

impl Rig {
    /// Device booted from the slot named by `suffix` (`_a`, `_b`, or `""` for factory)
    pub fn new(suffix: &str) -> Self {
        let temp = TempDir::new().unwrap();
        let dev = temp.path().join("by-name");
        fs::create_dir(&dev).unwrap();
        for label in [
            "boot_a", "boot_b", "system_a", "system_b", "recovery", "recoveryfs", "aboot",
        ] {
            fs::write(dev.join(label), vec![UNTOUCHED; PARTITION_SIZE]).unwrap();
        }

        let cmdline = temp.path().join("cmdline");
        let slot_arg = if suffix.is_empty() {
            String::new()
        } else {
            format!(" androidboot.slot_suffix={}", suffix)
        };
        fs::write(&cmdline, format!("console=ttyHSL0{} quiet\n", slot_arg)).unwrap();

        let root = temp.path().join("root");
        fs::create_dir(&root).unwrap();

        let mut config = EngineConfig::default();
        config.paths.status_dir = temp.path().join("status");
        config.paths.device_dir = dev;
        config.paths.cmdline = cmdline;
        config.paths.wipe_cookie = temp.path().join("wipe-data");
        config.paths.root = root;
        config.paths.inhibit_markers = vec![temp.path().join("do-not-auto-update")];
        config.transfer.write_block = ZERO_BLOCK;
        config.transfer.timeout_secs = 10;

        Self {
            temp,
            config,
            log: CallLog::default(),
            identity: FakeIdentity::default(),
            fail_sync: false,
        }
    }

    /// Engine with recording fakes for every platform collaborator
    pub fn engine(&mut self) -> UpdateEngine {
        let identity = std::mem::take(&mut self.identity);
        UpdateEngine::new(self.config.clone())
            .unwrap()
            .with_boot_control(Box::new(RecordingBootControl {
                log: self.log.clone(),
                device_dir: self.config.paths.device_dir.clone(),
            }))
            .with_host(Box::new(RecordingHost {
                log: self.log.clone(),
                fail_sync: self.fail_sync,
            }))
            .with_events(Box::new(RecordingEvents(self.log.clone())))
            .with_identity(Box::new(identity))
            .with_progress(Box::new(RecordingProgress {
                log: self.log.clone(),
                position: Mutex::new(0),
                length: Mutex::new(0),
            }))
    }

    pub fn device(&self, label: &str) -> Vec<u8> {
        fs::read(self.config.paths.device_dir.join(label)).unwrap()
    }

    /// Whether a partition still holds only its original fill
    pub fn untouched(&self, label: &str) -> bool {
        self.device(label).iter().all(|&b| b == UNTOUCHED)
    }

    /// Whether a partition starts with a zero block
    pub fn zeroed(&self, label: &str) -> bool {
        self.device(label)[..ZERO_BLOCK].iter().all(|&b| b == 0)
    }

    pub fn status(&self, field: StatusField) -> Option<String> {
        fs::read_to_string(self.config.paths.status_dir.join(field.file_name())).ok()
    }

    pub fn status_file(&self, name: &str) -> Option<Vec<u8>> {
        fs::read(self.config.paths.status_dir.join(name)).ok()
    }

    /// Write a bundle into the rig and return its path as a location string
    pub fn bundle(&self, bundle: BundleBuilder) -> String {
        let path = self.temp.path().join("update.ota");
        fs::write(&path, bundle.finish()).unwrap();
        path.to_str().unwrap().to_string()
    }
}

/// Builds an uncompressed bundle archive
pub struct BundleBuilder {
    builder: tar::Builder<Vec<u8>>,
}

impl BundleBuilder {
    /// Start a bundle with `manifest.ini`
    pub fn new(manifest: &str) -> Self {
        Self {
            builder: tar::Builder::new(Vec::new()),
        }
        .entry("manifest.ini", manifest.as_bytes())
    }

    pub fn entry(mut self, name: &str, data: &[u8]) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        self.builder.append_data(&mut header, name, data).unwrap();
        self
    }

    /// Add `plain` gzip-compressed under `name`
    pub fn gzip_entry(self, name: &str, plain: &[u8]) -> Self {
        let encoded = gzip(plain);
        self.entry(name, &encoded)
    }

    pub fn finish(self) -> Vec<u8> {
        self.builder.into_inner().unwrap()
    }
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Manifest with a `META` group followed by `groups` text
pub fn manifest(update_version: &str, num_images: u32, extra_meta: &str, groups: &str) -> String {
    format!(
        "[META]\nmanifest_version=1.0.0\nupdate_version={}\nnum_images={}\nankidev=1\n{}\n{}",
        update_version, num_images, extra_meta, groups
    )
}

/// Image group text for a gzip-compressed section of `bytes` decoded bytes
pub fn image_group(name: &str, bytes: usize) -> String {
    format!("[{}]\nbytes={}\ncompression=gz\n", name, bytes)
}

/// Deterministic image content
pub fn image(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) | 1).collect()
}
