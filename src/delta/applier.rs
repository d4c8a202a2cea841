// src/delta/applier.rs

//! Delta application onto the target slot
//!
//! Stages the decoded payload, hands it to the payload engine together with
//! the four boot/system devices, and maps engine ticks and phases onto the
//! status record.

use super::estimate::{ApplyPlan, download_units, operation_estimate};
use super::payload::{ApplyTargets, PayloadEngine, PayloadError, PayloadObserver};
use crate::error::{Error, Result};
use crate::extract::{ExtractError, Extractor};
use crate::manifest::{Manifest, SectionKind};
use crate::slot::{Partition, SlotLayout, SlotPair};
use crate::status::{StagingFile, StatusSink};
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use tracing::{error, info, warn};

/// Applies delta sections to the target slot
pub struct DeltaApplier<'a> {
    extractor: &'a Extractor,
    layout: &'a SlotLayout,
    engine: &'a dyn PayloadEngine,
    status: &'a StatusSink,
}

impl<'a> DeltaApplier<'a> {
    pub fn new(
        extractor: &'a Extractor,
        layout: &'a SlotLayout,
        engine: &'a dyn PayloadEngine,
        status: &'a StatusSink,
    ) -> Self {
        Self {
            extractor,
            layout,
            engine,
            status,
        }
    }

    /// Download the next entry as the delta payload and apply it
    pub fn apply<R: Read>(
        &self,
        slots: SlotPair,
        manifest: &Manifest,
        entries: &mut tar::Entries<'_, R>,
    ) -> Result<()> {
        let delta = manifest
            .section(SectionKind::Delta)
            .ok_or(ExtractError::MissingSection(SectionKind::Delta))?;
        self.status.set_expected_size(download_units(delta.bytes))?;
        self.status.set_progress(0)?;

        let staging = self.status.staging_path(StagingFile::Delta);
        {
            let mut file = File::create(&staging)?;
            self.extractor.extract(
                manifest,
                entries,
                SectionKind::Delta.entry_suffix().unwrap_or_default(),
                SectionKind::Delta,
                &mut file,
                self.status.progress_reporter(0),
            )?;
            file.sync_all()?;
        }

        self.apply_staged(slots, &staging)?;
        fs::remove_file(&staging)?;
        Ok(())
    }

    fn apply_staged(&self, slots: SlotPair, staging: &Path) -> Result<()> {
        let mut payload = self
            .engine
            .open(staging)
            .map_err(|e| self.invalidate_target(slots, e))?;

        let (current, target) = (slots.current(), slots.target());
        let operations = operation_estimate(
            payload.summary(),
            self.layout.partition_size(Partition::System, current)?,
            self.layout.partition_size(Partition::Boot, current)?,
        );
        let plan = ApplyPlan::new(operations);
        self.status.set_progress(plan.start)?;
        self.status.set_expected_size(plan.total)?;
        info!(
            "Applying delta {} -> {}: {} operations estimated",
            current, target, operations
        );

        let targets = ApplyTargets {
            new_kernel: self.layout.device_path(Partition::Boot, target)?.to_path_buf(),
            new_rootfs: self.layout.device_path(Partition::System, target)?.to_path_buf(),
            old_kernel: self.layout.device_path(Partition::Boot, current)?.to_path_buf(),
            old_rootfs: self.layout.device_path(Partition::System, current)?.to_path_buf(),
            truncate_to_expected_size: false,
        };

        let mut observer = StatusObserver {
            status: self.status,
            progress: plan.start,
        };
        payload
            .apply(&targets, &mut observer)
            .map_err(|e| self.invalidate_target(slots, e))
    }

    /// Make the target slot unbootable after a payload failure
    fn invalidate_target(&self, slots: SlotPair, err: PayloadError) -> Error {
        warn!("Delta payload failed, zeroing slot {}: {}", slots.target(), err);
        if let Err(zero_err) = self
            .layout
            .zero_first_block(slots.target(), &[Partition::Boot, Partition::System])
        {
            error!("Failed to zero slot {}: {}", slots.target(), zero_err);
        }
        Error::Payload(err)
    }
}

struct StatusObserver<'a> {
    status: &'a StatusSink,
    progress: u64,
}

impl PayloadObserver for StatusObserver<'_> {
    fn tick(&mut self) {
        self.progress += 1;
        if let Err(e) = self.status.set_progress(self.progress) {
            warn!("Failed to write progress: {}", e);
        }
    }

    fn phase(&mut self, name: &str) {
        if let Err(e) = self.status.set_phase(name) {
            warn!("Failed to write phase: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{DeltaPayload, PayloadSummary};
    use crate::pipeline::{FilterProgram, PipelineOptions};
    use crate::status::StatusField;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    #[derive(Clone, Default)]
    struct Log(Arc<Mutex<Vec<String>>>);

    impl Log {
        fn push(&self, line: String) {
            self.0.lock().unwrap().push(line);
        }

        fn lines(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct FakeEngine {
        log: Log,
        ticks: u32,
        fail: bool,
    }

    struct FakePayload {
        log: Log,
        summary: PayloadSummary,
        ticks: u32,
        fail: bool,
    }

    impl PayloadEngine for FakeEngine {
        fn open(&self, path: &Path) -> std::result::Result<Box<dyn DeltaPayload>, PayloadError> {
            let staged = fs::read(path).unwrap();
            self.log.push(format!("open {}", String::from_utf8_lossy(&staged)));
            Ok(Box::new(FakePayload {
                log: self.log.clone(),
                summary: PayloadSummary {
                    old_rootfs_size: 4 * MIB,
                    old_kernel_size: MIB,
                    new_rootfs_size: 4 * MIB,
                    new_kernel_size: MIB,
                    install_operations: 6,
                    kernel_install_operations: 2,
                },
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
        ) -> std::result::Result<(), PayloadError> {
            self.log.push(format!(
                "apply {} {} {} {} truncate={}",
                targets.new_kernel.file_name().unwrap().to_string_lossy(),
                targets.new_rootfs.file_name().unwrap().to_string_lossy(),
                targets.old_kernel.file_name().unwrap().to_string_lossy(),
                targets.old_rootfs.file_name().unwrap().to_string_lossy(),
                targets.truncate_to_expected_size,
            ));
            observer.phase("applying");
            for _ in 0..self.ticks {
                observer.tick();
            }
            if self.fail {
                return Err(PayloadError::Apply("bad operation".to_string()));
            }
            Ok(())
        }
    }

    struct Fixture {
        _temp: TempDir,
        layout: SlotLayout,
        status: StatusSink,
        extractor: Extractor,
        bundle: Vec<u8>,
        manifest: Manifest,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let devices = temp.path().join("by-name");
        fs::create_dir(&devices).unwrap();
        for (label, size) in [("boot_a", 2 * MIB), ("system_a", 8 * MIB), ("boot_b", 64), ("system_b", 64)] {
            File::create(devices.join(label)).unwrap().set_len(size).unwrap();
        }
        let status_dir = temp.path().join("status");
        fs::create_dir(&status_dir).unwrap();

        let payload = b"payload bytes";
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        let encoded = encoder.finish().unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(encoded.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "delta.bin.gz", encoded.as_slice()).unwrap();

        let manifest = Manifest::parse(&format!(
            "[META]\nmanifest_version=1.0.0\nupdate_version=1.1.0\nnum_images=1\n\
             [DELTA]\nbytes={}\ncompression=gz\nbase_version=1.0.0\n",
            payload.len()
        ))
        .unwrap();

        Fixture {
            layout: SlotLayout::new(&devices, 16),
            status: StatusSink::new(&status_dir),
            extractor: Extractor::new(PipelineOptions {
                decrypt: FilterProgram::new("cat"),
                decompress: FilterProgram::new("gzip").with_args(["-dc"]),
                chunk_size: 512,
                stall_timeout: Duration::from_secs(10),
                digest: false,
            }),
            bundle: builder.into_inner().unwrap(),
            manifest,
            _temp: temp,
        }
    }

    #[test]
    fn test_apply_drives_engine_and_progress() {
        let f = fixture();
        let log = Log::default();
        let engine = FakeEngine {
            log: log.clone(),
            ticks: 3,
            fail: false,
        };
        let applier = DeltaApplier::new(&f.extractor, &f.layout, &engine, &f.status);

        let mut archive = tar::Archive::new(f.bundle.as_slice());
        let mut entries = archive.entries().unwrap();
        applier
            .apply(SlotPair::from_suffix(Some("_a")), &f.manifest, &mut entries)
            .unwrap();

        assert_eq!(
            log.lines(),
            vec![
                "open payload bytes".to_string(),
                "apply boot_b system_b boot_a system_a truncate=false".to_string(),
            ]
        );

        // 4 + 1 + 8 + 2 + 6 + 2 + 4 + 1 operations, start (28 + 1) / 9
        assert_eq!(f.status.read(StatusField::ExpectedSize).as_deref(), Some("31"));
        assert_eq!(f.status.read(StatusField::Progress).as_deref(), Some("6"));
        assert_eq!(f.status.read(StatusField::Phase).as_deref(), Some("applying"));
        assert!(!f.status.staging_path(StagingFile::Delta).exists());
    }

    #[test]
    fn test_payload_error_zeroes_target() {
        let f = fixture();
        let target_boot = f.layout.device_path(Partition::Boot, crate::slot::Slot::B).unwrap().to_path_buf();
        fs::write(&target_boot, vec![0xAAu8; 64]).unwrap();

        let engine = FakeEngine {
            log: Log::default(),
            ticks: 1,
            fail: true,
        };
        let applier = DeltaApplier::new(&f.extractor, &f.layout, &engine, &f.status);

        let mut archive = tar::Archive::new(f.bundle.as_slice());
        let mut entries = archive.entries().unwrap();
        let err = applier
            .apply(SlotPair::from_suffix(Some("_a")), &f.manifest, &mut entries)
            .unwrap_err();

        assert_eq!(err.exit_code(), 207);
        let boot = fs::read(&target_boot).unwrap();
        assert!(boot[..16].iter().all(|&b| b == 0));
        assert!(boot[16..].iter().all(|&b| b == 0xAA));
    }
}
