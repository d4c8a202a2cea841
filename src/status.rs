// src/status.rs

//! Status directory shared with external monitors
//!
//! Each field is a small file holding one value, overwritten whole on every
//! change. Writes go through a temporary file that is renamed into place,
//! so a reader sees either the old value or the new one.

use crate::progress::ProgressTracker;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Default status directory on the device
pub const DEFAULT_STATUS_DIR: &str = "/run/update-engine";

/// Mode of every file written to the status directory
const STATUS_FILE_MODE: u32 = 0o644;

/// One status file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusField {
    ExpectedDownloadSize,
    ExpectedSize,
    Progress,
    Phase,
    Error,
    Done,
}

impl StatusField {
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::ExpectedDownloadSize => "expected-download-size",
            Self::ExpectedSize => "expected-size",
            Self::Progress => "progress",
            Self::Phase => "phase",
            Self::Error => "error",
            Self::Done => "done",
        }
    }
}

/// Decoded images staged before their final copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingFile {
    Boot,
    Delta,
    Aboot,
}

impl StagingFile {
    pub const ALL: [StagingFile; 3] = [Self::Boot, Self::Delta, Self::Aboot];

    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Boot => "boot.img",
            Self::Delta => "delta.bin",
            Self::Aboot => "aboot.img",
        }
    }
}

const MANIFEST_COPY: &str = "manifest.ini";
const SIGNATURE_COPY: &str = "manifest.sha256";

/// Owner of the status directory
pub struct StatusSink {
    dir: PathBuf,
    mirror: Option<Box<dyn ProgressTracker>>,
}

impl StatusSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            mirror: None,
        }
    }

    /// Also report progress to `mirror`
    pub fn with_mirror(mut self, mirror: Box<dyn ProgressTracker>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Create the directory if needed and delete every file in it
    pub fn clear(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        debug!("Cleared status directory {}", self.dir.display());
        Ok(())
    }

    pub fn set_expected_download_size(&self, bytes: u64) -> io::Result<()> {
        self.write(StatusField::ExpectedDownloadSize, &bytes.to_string())
    }

    pub fn set_expected_size(&self, units: u64) -> io::Result<()> {
        if let Some(mirror) = &self.mirror {
            mirror.set_length(units);
        }
        self.write(StatusField::ExpectedSize, &units.to_string())
    }

    pub fn set_progress(&self, units: u64) -> io::Result<()> {
        if let Some(mirror) = &self.mirror {
            mirror.set_position(units);
        }
        self.write(StatusField::Progress, &units.to_string())
    }

    /// Progress callback writing `base + n`; failed writes are logged
    pub fn progress_reporter(&self, base: u64) -> impl FnMut(u64) + '_ {
        move |n| {
            if let Err(e) = self.set_progress(base + n) {
                warn!("Failed to write progress: {}", e);
            }
        }
    }

    pub fn set_phase(&self, phase: &str) -> io::Result<()> {
        if let Some(mirror) = &self.mirror {
            mirror.set_message(phase);
        }
        self.write(StatusField::Phase, phase)
    }

    pub fn set_error(&self, text: &str) -> io::Result<()> {
        if let Some(mirror) = &self.mirror {
            mirror.finish_with_error(text);
        }
        self.write(StatusField::Error, text)
    }

    pub fn clear_error(&self) -> io::Result<()> {
        remove_if_present(&self.path(StatusField::Error))
    }

    /// Write the completion marker and phase `done`
    pub fn set_done(&self) -> io::Result<()> {
        self.write(StatusField::Done, "1")?;
        self.write(StatusField::Phase, "done")?;
        if let Some(mirror) = &self.mirror {
            mirror.finish_with_message("done");
        }
        Ok(())
    }

    /// Keep a copy of the bundle's manifest next to the status files
    pub fn save_manifest(&self, raw: &[u8]) -> io::Result<PathBuf> {
        self.write_file(MANIFEST_COPY, raw)
    }

    /// Keep the detached manifest signature for verification
    pub fn save_manifest_signature(&self, signature: &[u8]) -> io::Result<PathBuf> {
        self.write_file(SIGNATURE_COPY, signature)
    }

    pub fn path(&self, field: StatusField) -> PathBuf {
        self.dir.join(field.file_name())
    }

    pub fn staging_path(&self, file: StagingFile) -> PathBuf {
        self.dir.join(file.file_name())
    }

    /// Delete all staging files, ignoring ones that don't exist
    pub fn remove_staging_files(&self) -> io::Result<()> {
        for file in StagingFile::ALL {
            remove_if_present(&self.staging_path(file))?;
        }
        Ok(())
    }

    /// Current value of a field
    pub fn read(&self, field: StatusField) -> Option<String> {
        fs::read_to_string(self.path(field)).ok()
    }

    fn write(&self, field: StatusField, value: &str) -> io::Result<()> {
        self.write_file(field.file_name(), value.as_bytes())?;
        Ok(())
    }

    fn write_file(&self, name: &str, value: &[u8]) -> io::Result<PathBuf> {
        let path = self.dir.join(name);
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        // Monitors may run as another user
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(STATUS_FILE_MODE))?;
        tmp.write_all(value)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(path)
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;
    use tempfile::TempDir;

    fn listing(dir: &Path) -> Vec<(String, String)> {
        let mut files: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| {
                let path = e.unwrap().path();
                (
                    path.file_name().unwrap().to_string_lossy().into_owned(),
                    fs::read_to_string(&path).unwrap(),
                )
            })
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_clear_creates_and_empties() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("status");
        let status = StatusSink::new(&dir);

        status.clear().unwrap();
        assert!(dir.is_dir());

        status.set_progress(10).unwrap();
        fs::write(status.staging_path(StagingFile::Boot), b"img").unwrap();
        status.clear().unwrap();
        assert!(listing(&dir).is_empty());
    }

    #[test]
    fn test_fields_overwrite() {
        let temp = TempDir::new().unwrap();
        let status = StatusSink::new(temp.path());

        status.set_expected_size(4800).unwrap();
        status.set_progress(100).unwrap();
        status.set_progress(2048).unwrap();
        status.set_phase("download").unwrap();

        assert_eq!(status.read(StatusField::ExpectedSize).as_deref(), Some("4800"));
        assert_eq!(status.read(StatusField::Progress).as_deref(), Some("2048"));
        assert_eq!(status.read(StatusField::Phase).as_deref(), Some("download"));
    }

    #[test]
    fn test_status_files_are_world_readable() {
        let temp = TempDir::new().unwrap();
        let status = StatusSink::new(temp.path());

        status.set_progress(42).unwrap();
        status.set_done().unwrap();
        status.save_manifest(b"[META]\n").unwrap();

        for name in ["progress", "done", "phase", "manifest.ini"] {
            let mode = fs::metadata(temp.path().join(name)).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o644, "{}", name);
        }
    }

    #[test]
    fn test_progress_reporter_offsets() {
        let temp = TempDir::new().unwrap();
        let status = StatusSink::new(temp.path());
        let mut report = status.progress_reporter(800);
        report(2048);
        assert_eq!(status.read(StatusField::Progress).as_deref(), Some("2848"));
    }

    #[test]
    fn test_repeated_write_is_idempotent() {
        let once = TempDir::new().unwrap();
        let twice = TempDir::new().unwrap();

        StatusSink::new(once.path()).set_progress(42).unwrap();
        let sink = StatusSink::new(twice.path());
        sink.set_progress(42).unwrap();
        sink.set_progress(42).unwrap();

        assert_eq!(listing(once.path()), listing(twice.path()));
    }

    #[test]
    fn test_done_and_error() {
        let temp = TempDir::new().unwrap();
        let status = StatusSink::new(temp.path()).with_mirror(Box::new(SilentProgress::new()));

        status.set_error("stale").unwrap();
        status.clear_error().unwrap();
        status.clear_error().unwrap();
        status.set_done().unwrap();

        assert_eq!(status.read(StatusField::Error), None);
        assert_eq!(status.read(StatusField::Done).as_deref(), Some("1"));
        assert_eq!(status.read(StatusField::Phase).as_deref(), Some("done"));
    }

    #[test]
    fn test_remove_staging_files() {
        let temp = TempDir::new().unwrap();
        let status = StatusSink::new(temp.path());
        fs::write(status.staging_path(StagingFile::Delta), b"delta").unwrap();
        status.save_manifest(b"[META]\n").unwrap();

        status.remove_staging_files().unwrap();
        assert_eq!(
            listing(temp.path()),
            vec![("manifest.ini".to_string(), "[META]\n".to_string())]
        );
    }
}
