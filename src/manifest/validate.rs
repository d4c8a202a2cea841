// src/manifest/validate.rs

//! Manifest validation against the running device
//!
//! Checks run in a fixed order and the first failure wins:
//!
//! 1. manifest format version is supported
//! 2. (optional) new firmware version is acceptable
//! 3. device class of bundle and firmware agree
//! 4. image count is 1, 2 or 3
//! 5. groups present match an update class; factory bundles must also
//!    name this device's serial
//! 6. (optional) delta base version equals the running version

use super::{Manifest, ManifestError, SUPPORTED_MANIFEST_VERSIONS, SectionKind};
use crate::platform::DeviceIdentity;
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::sync::LazyLock;
use tracing::{debug, info};

static OS_VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\d+\.){2,3}\d+(d|ud)?$").expect("valid version regex")
});

/// Kind of update a validated manifest describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateClass {
    /// Boot and system images for the target slot
    FullImage,
    /// System image only, boot of the target slot untouched
    SystemImage,
    /// Binary delta applied by the payload engine
    Delta,
    /// Nested archive unpacked over the live root filesystem
    RootOverlay,
    /// Bootloader plus factory boot/system images
    Factory,
}

impl UpdateClass {
    /// Sections consumed from the bundle, in archive order
    pub fn sections(&self) -> &'static [SectionKind] {
        match self {
            Self::FullImage => &[SectionKind::Boot, SectionKind::System],
            Self::SystemImage => &[SectionKind::System],
            Self::Delta => &[SectionKind::Delta],
            Self::RootOverlay => &[SectionKind::Anki],
            Self::Factory => &[
                SectionKind::Aboot,
                SectionKind::Recovery,
                SectionKind::RecoveryFs,
            ],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::FullImage => "full-image",
            Self::SystemImage => "system-image",
            Self::Delta => "delta",
            Self::RootOverlay => "root-overlay",
            Self::Factory => "factory",
        }
    }
}

impl fmt::Display for UpdateClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Optional checks, all off unless explicitly enabled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationPolicy {
    /// Enforce version format, suffix continuity and no downgrades
    pub enforce_version_policy: bool,
    /// Permit downgrades on development-class devices
    pub allow_downgrade: bool,
    /// Require a delta's base version to equal the running version
    pub enforce_delta_base_version: bool,
}

/// Validates manifests against one device
pub struct ManifestValidator<'a> {
    identity: &'a dyn DeviceIdentity,
    policy: ValidationPolicy,
}

impl<'a> ManifestValidator<'a> {
    pub fn new(identity: &'a dyn DeviceIdentity, policy: ValidationPolicy) -> Self {
        Self { identity, policy }
    }

    /// Validate and classify
    pub fn validate(&self, manifest: &Manifest) -> Result<UpdateClass, ManifestError> {
        let meta = manifest.meta();

        if !SUPPORTED_MANIFEST_VERSIONS.contains(&meta.manifest_version.as_str()) {
            return Err(ManifestError::UnsupportedVersion(meta.manifest_version.clone()));
        }

        let running = self.identity.os_version();
        self.check_new_version(&running, &meta.update_version)?;

        let device_dev = self.identity.is_dev_class();
        if device_dev && !meta.dev_class {
            return Err(ManifestError::DeviceClassMismatch(
                "development firmware can't install a non-development bundle".to_string(),
            ));
        }
        if !device_dev && meta.dev_class {
            return Err(ManifestError::DeviceClassMismatch(
                "production firmware can't install a development bundle".to_string(),
            ));
        }

        let class = self.classify(manifest)?;
        debug!("Manifest classified as {}", class);

        if class == UpdateClass::Factory {
            let actual = self
                .identity
                .hardware_serial()
                .map_err(|e| ManifestError::SerialUnavailable(e.to_string()))?;
            if meta.device_serial != actual {
                return Err(ManifestError::SerialMismatch {
                    expected: meta.device_serial.clone(),
                    actual,
                });
            }
        }

        if class == UpdateClass::Delta && self.policy.enforce_delta_base_version {
            let base = manifest
                .section(SectionKind::Delta)
                .and_then(|s| s.base_version.clone())
                .unwrap_or_default();
            if base != running {
                return Err(ManifestError::BaseVersionMismatch { running, base });
            }
        }

        info!(
            "Manifest {} validated: {} update to {}",
            meta.manifest_version, class, meta.update_version
        );
        Ok(class)
    }

    /// Match image count and groups to an update class
    fn classify(&self, manifest: &Manifest) -> Result<UpdateClass, ManifestError> {
        let num_images = manifest.meta().num_images;
        let has = |kind| manifest.has_section(kind);
        let layout_error = || ManifestError::UnexpectedLayout {
            num_images,
            groups: manifest.group_names().join(","),
        };

        match num_images {
            2 if has(SectionKind::Boot) && has(SectionKind::System) => Ok(UpdateClass::FullImage),
            1 if has(SectionKind::System) => Ok(UpdateClass::SystemImage),
            1 if has(SectionKind::Delta) => Ok(UpdateClass::Delta),
            1 if has(SectionKind::Anki) => Ok(UpdateClass::RootOverlay),
            3 if has(SectionKind::Aboot)
                && has(SectionKind::Recovery)
                && has(SectionKind::RecoveryFs) =>
            {
                Ok(UpdateClass::Factory)
            }
            1..=3 => Err(layout_error()),
            other => Err(ManifestError::InvalidImageCount(other)),
        }
    }

    /// Version format, suffix and downgrade checks
    ///
    /// Inert unless `enforce_version_policy` is set.
    fn check_new_version(&self, current: &str, new: &str) -> Result<(), ManifestError> {
        if !self.policy.enforce_version_policy {
            return Ok(());
        }
        if self.policy.allow_downgrade && self.identity.is_dev_class() {
            return Ok(());
        }

        let new_suffix = OS_VERSION_RE
            .captures(new)
            .map(|c| c.get(1).map(|m| m.as_str()).unwrap_or(""))
            .ok_or_else(|| {
                ManifestError::VersionRefused(format!(
                    "OS version {} does not match regular expression",
                    new
                ))
            })?;
        let current_suffix = OS_VERSION_RE
            .captures(current)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .unwrap_or("");

        if new_suffix != current_suffix {
            return Err(ManifestError::VersionRefused(format!(
                "Update from {} to {} not allowed",
                current, new
            )));
        }
        if compare_versions(new, current) == Ordering::Less {
            return Err(ManifestError::VersionRefused(format!(
                "Downgrade from {} to {} not allowed",
                current, new
            )));
        }
        Ok(())
    }
}

/// Compare dotted versions component-wise, numerically where possible
///
/// Trailing non-digit suffixes (`d`, `ud`) are ignored.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    fn components(v: &str) -> Vec<u64> {
        v.trim_end_matches(|c: char| !c.is_ascii_digit())
            .split('.')
            .map(|part| {
                let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
                digits.parse().unwrap_or(0)
            })
            .collect()
    }
    components(a).cmp(&components(b))
}
