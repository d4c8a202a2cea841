// src/engine/handlers.rs

//! Per-class image writers
//!
//! Each handler consumes exactly the bundle entries its update class
//! declares, in manifest order, and keeps the status progress counter in
//! step with the bytes written.

use super::UpdateEngine;
use crate::compression::{CompressionFormat, create_decoder};
use crate::delta::DeltaApplier;
use crate::error::{Error, Result};
use crate::extract::ExtractError;
use crate::manifest::{Manifest, SectionKind, UpdateClass};
use crate::slot::{Partition, Slot, SlotPair};
use crate::status::StagingFile;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use tracing::{error, info};

/// Overlay updates report synthetic progress in these steps
const OVERLAY_STEPS: u64 = 4;

impl UpdateEngine {
    pub(super) fn dispatch<R: Read>(
        &self,
        slots: SlotPair,
        class: UpdateClass,
        manifest: &Manifest,
        entries: &mut tar::Entries<'_, R>,
    ) -> Result<()> {
        info!("Installing {} update", class);
        match class {
            UpdateClass::FullImage => self.write_full_image(slots.target(), manifest, entries),
            UpdateClass::SystemImage => self.write_system_image(slots.target(), manifest, entries),
            UpdateClass::Delta => {
                DeltaApplier::new(
                    &self.extractor,
                    &self.layout,
                    self.payload_engine.as_ref(),
                    &self.status,
                )
                .apply(slots, manifest, entries)
            }
            UpdateClass::RootOverlay => self.unpack_overlay(manifest, entries),
            UpdateClass::Factory => self.write_factory(manifest, entries),
        }
    }

    /// Boot is staged, system written in place, then boot copied over
    fn write_full_image<R: Read>(
        &self,
        target: Slot,
        manifest: &Manifest,
        entries: &mut tar::Entries<'_, R>,
    ) -> Result<()> {
        let both = [Partition::Boot, Partition::System];
        self.status
            .set_expected_size(manifest.total_bytes(UpdateClass::FullImage.sections()))?;
        self.status.set_progress(0)?;

        let staging = self.status.staging_path(StagingFile::Boot);
        let mut written = {
            let mut file = File::create(&staging)?;
            let result = self.extract_section(manifest, entries, SectionKind::Boot, &mut file, 0);
            self.invalidate_on_mismatch(target, &both, result)?
        };

        let mut system = self.layout.open_for_write(Partition::System, target)?;
        let result = self.extract_section(manifest, entries, SectionKind::System, &mut system, written);
        written += self.invalidate_on_mismatch(target, &both, result)?;

        copy_staged(&staging, &mut self.layout.open_for_write(Partition::Boot, target)?)?;
        fs::remove_file(&staging)?;
        info!("Wrote {} bytes to slot {}", written, target);
        Ok(())
    }

    fn write_system_image<R: Read>(
        &self,
        target: Slot,
        manifest: &Manifest,
        entries: &mut tar::Entries<'_, R>,
    ) -> Result<()> {
        self.status
            .set_expected_size(manifest.total_bytes(UpdateClass::SystemImage.sections()))?;
        self.status.set_progress(0)?;

        let mut system = self.layout.open_for_write(Partition::System, target)?;
        let result = self.extract_section(manifest, entries, SectionKind::System, &mut system, 0);
        let written = self.invalidate_on_mismatch(target, &[Partition::System], result)?;
        info!("Wrote {} bytes to system_{}", written, target);
        Ok(())
    }

    /// Bootloader and recovery boot are staged; recovery system goes straight to slot f
    fn write_factory<R: Read>(
        &self,
        manifest: &Manifest,
        entries: &mut tar::Entries<'_, R>,
    ) -> Result<()> {
        self.layout.validate(&[Slot::F])?;
        self.status
            .set_expected_size(manifest.total_bytes(UpdateClass::Factory.sections()))?;
        self.status.set_progress(0)?;

        let aboot_staging = self.status.staging_path(StagingFile::Aboot);
        let boot_staging = self.status.staging_path(StagingFile::Boot);

        let mut written = self.extract_section(
            manifest,
            entries,
            SectionKind::Aboot,
            &mut File::create(&aboot_staging)?,
            0,
        )?;
        written += self.extract_section(
            manifest,
            entries,
            SectionKind::Recovery,
            &mut File::create(&boot_staging)?,
            written,
        )?;
        let mut recoveryfs = self.layout.open_for_write(Partition::System, Slot::F)?;
        written += self.extract_section(
            manifest,
            entries,
            SectionKind::RecoveryFs,
            &mut recoveryfs,
            written,
        )?;

        copy_staged(&boot_staging, &mut self.layout.open_for_write(Partition::Boot, Slot::F)?)?;
        fs::remove_file(&boot_staging)?;
        copy_staged(&aboot_staging, &mut self.layout.open_aboot_for_write()?)?;
        fs::remove_file(&aboot_staging)?;
        info!("Wrote {} bytes of factory images", written);
        Ok(())
    }

    /// Unpack the nested archive over the live root filesystem
    fn unpack_overlay<R: Read>(
        &self,
        manifest: &Manifest,
        entries: &mut tar::Entries<'_, R>,
    ) -> Result<()> {
        let section = manifest
            .section(SectionKind::Anki)
            .ok_or(ExtractError::MissingSection(SectionKind::Anki))?;
        let format = CompressionFormat::from_manifest(&section.compression)?;
        let root = &self.config.paths.root;

        self.status.set_expected_size(OVERLAY_STEPS)?;
        self.status.set_progress(0)?;
        self.status.set_progress(1)?;
        self.host
            .remount_rw(root)
            .map_err(|source| Error::Mount {
                path: root.clone(),
                source,
            })?;
        self.status.set_progress(2)?;

        let entry = entries
            .next()
            .ok_or_else(|| ExtractError::MissingEntry("overlay archive".to_string()))?
            .map_err(ExtractError::Archive)?;
        let mut overlay = tar::Archive::new(create_decoder(entry, format));
        overlay.set_preserve_permissions(true);
        overlay.set_overwrite(true);
        overlay.unpack(root)?;
        info!("Unpacked {} overlay over {}", format, root.display());

        self.status.set_progress(3)?;
        self.status.set_progress(OVERLAY_STEPS)?;
        Ok(())
    }

    fn extract_section<R, W>(
        &self,
        manifest: &Manifest,
        entries: &mut tar::Entries<'_, R>,
        section: SectionKind,
        dest: &mut W,
        base: u64,
    ) -> std::result::Result<u64, ExtractError>
    where
        R: Read,
        W: Write + ?Sized,
    {
        let suffix = section.entry_suffix().unwrap_or_default();
        self.extractor.extract(
            manifest,
            entries,
            suffix,
            section,
            dest,
            self.status.progress_reporter(base),
        )
    }

    /// Zero the target's first blocks when a written image failed its digest
    fn invalidate_on_mismatch(
        &self,
        target: Slot,
        partitions: &[Partition],
        result: std::result::Result<u64, ExtractError>,
    ) -> Result<u64> {
        if let Err(ExtractError::DigestMismatch { section, .. }) = &result
            && let Err(e) = self.layout.zero_first_block(target, partitions)
        {
            error!("Failed to zero slot {} after bad {} digest: {}", target, section, e);
        }
        Ok(result?)
    }
}

fn copy_staged(staging: &Path, device: &mut File) -> io::Result<u64> {
    let copied = io::copy(&mut File::open(staging)?, device)?;
    device.flush()?;
    Ok(copied)
}
