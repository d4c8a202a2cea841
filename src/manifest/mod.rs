// src/manifest/mod.rs

//! Bundle manifest parsing and validation
//!
//! The manifest is the first entry of every bundle. It is a grouped
//! key/value document with a required `META` group and one group per image
//! carried by the bundle:
//!
//! ```text
//! [META]
//! manifest_version = 1.0.0
//! update_version = 1.8.0.6051
//! num_images = 2
//! ankidev = 1
//! reboot_after_install = 0
//!
//! [BOOT]
//! bytes = 12582912
//! compression = gz
//! encryption = 1
//! sha256 = ...
//! ```
//!
//! Missing `encryption`, `qsn`, `ankidev` and `reboot_after_install` keys
//! default to `0`/empty in every group.

mod ini;
mod validate;

pub use ini::IniDocument;
pub use validate::{ManifestValidator, UpdateClass, ValidationPolicy, compare_versions};

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Manifest format versions this engine understands
pub const SUPPORTED_MANIFEST_VERSIONS: &[&str] = &["0.9.2", "0.9.3", "0.9.4", "0.9.5", "1.0.0"];

/// Archive entry name suffix of the manifest
pub const MANIFEST_ENTRY: &str = "manifest.ini";

/// Archive entry name suffix of the detached manifest signature
pub const MANIFEST_SIGNATURE_ENTRY: &str = "manifest.sha256";

const META_GROUP: &str = "META";

/// Keys defaulted in every group when absent
const GROUP_DEFAULTS: &[(&str, &str)] = &[
    ("encryption", "0"),
    ("qsn", ""),
    ("ankidev", "0"),
    ("reboot_after_install", "0"),
];

/// Manifest errors
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("manifest syntax error on line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("manifest is not valid UTF-8")]
    Encoding,

    #[error("manifest has no [{0}] group")]
    MissingGroup(String),

    #[error("manifest [{group}] is missing `{key}`")]
    MissingKey { group: String, key: String },

    #[error("manifest [{group}] has invalid `{key}` value {value:?}")]
    InvalidValue {
        group: String,
        key: String,
        value: String,
    },

    #[error("unexpected manifest version {0}")]
    UnsupportedVersion(String),

    #[error("{0}")]
    DeviceClassMismatch(String),

    #[error("unexpected image count {0}")]
    InvalidImageCount(i64),

    #[error("{num_images} image(s) specified but groups {groups} match no update type")]
    UnexpectedLayout { num_images: i64, groups: String },

    #[error("device serial {actual} doesn't match manifest serial {expected}")]
    SerialMismatch { expected: String, actual: String },

    #[error("failed to read device serial: {0}")]
    SerialUnavailable(String),

    #[error("{0}")]
    VersionRefused(String),

    #[error("running version is {running} but delta requires {base}")]
    BaseVersionMismatch { running: String, base: String },
}

/// Image groups a manifest may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SectionKind {
    Boot,
    System,
    Delta,
    /// Nested filesystem archive unpacked over the live root
    Anki,
    /// Bootloader
    Aboot,
    /// Factory boot image
    Recovery,
    /// Factory system image
    RecoveryFs,
}

impl SectionKind {
    pub const ALL: [SectionKind; 7] = [
        Self::Boot,
        Self::System,
        Self::Delta,
        Self::Anki,
        Self::Aboot,
        Self::Recovery,
        Self::RecoveryFs,
    ];

    /// Group name inside the manifest
    pub fn group_name(&self) -> &'static str {
        match self {
            Self::Boot => "BOOT",
            Self::System => "SYSTEM",
            Self::Delta => "DELTA",
            Self::Anki => "ANKI",
            Self::Aboot => "ABOOT",
            Self::Recovery => "RECOVERY",
            Self::RecoveryFs => "RECOVERYFS",
        }
    }

    /// Suffix the section's archive entry name must end with
    ///
    /// The overlay archive has no fixed name.
    pub fn entry_suffix(&self) -> Option<&'static str> {
        match self {
            Self::Boot | Self::Recovery => Some("boot.img.gz"),
            Self::System | Self::RecoveryFs => Some("sysfs.img.gz"),
            Self::Delta => Some("delta.bin.gz"),
            Self::Aboot => Some("emmc_appsboot.img.gz"),
            Self::Anki => None,
        }
    }

    /// Whether the group must declare a decoded byte length
    fn requires_length(&self) -> bool {
        !matches!(self, Self::Anki)
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.group_name())
    }
}

/// `META` group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub manifest_version: String,
    pub update_version: String,
    pub num_images: i64,
    /// Bundle built for development-class firmware
    pub dev_class: bool,
    /// Hardware serial a factory bundle is locked to (empty when unlocked)
    pub device_serial: String,
    pub reboot_after_install: bool,
}

/// One image group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSection {
    pub kind: SectionKind,
    /// Decoded length in bytes
    pub bytes: u64,
    /// Compression scheme as declared (`gz` or empty)
    pub compression: String,
    /// Encryption scheme number as declared (0 none, 1 AES-256-CTR)
    pub encryption: i64,
    /// Expected SHA-256 of the decoded content
    pub sha256: Option<String>,
    /// Firmware version a delta applies on top of
    pub base_version: Option<String>,
}

/// A parsed bundle manifest
#[derive(Debug, Clone)]
pub struct Manifest {
    raw: String,
    meta: Meta,
    sections: BTreeMap<SectionKind, ImageSection>,
    groups: Vec<String>,
}

impl Manifest {
    /// Parse manifest bytes as carried in the bundle
    pub fn from_bytes(raw: &[u8]) -> Result<Self, ManifestError> {
        let text = std::str::from_utf8(raw).map_err(|_| ManifestError::Encoding)?;
        Self::parse(text)
    }

    /// Parse manifest text, applying group defaults
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        let doc = IniDocument::parse(content)?;

        let meta_group = doc
            .group(META_GROUP)
            .ok_or_else(|| ManifestError::MissingGroup(META_GROUP.to_string()))?;
        let meta_keys = GroupKeys::new(META_GROUP, meta_group);
        let meta = Meta {
            manifest_version: meta_keys.required("manifest_version")?.to_string(),
            update_version: meta_keys.required("update_version")?.to_string(),
            num_images: meta_keys.int("num_images")?,
            dev_class: meta_keys.int("ankidev")? != 0,
            device_serial: meta_keys.required("qsn")?.to_string(),
            reboot_after_install: meta_keys.int("reboot_after_install")? != 0,
        };

        let mut sections = BTreeMap::new();
        for kind in SectionKind::ALL {
            let Some(group) = doc.group(kind.group_name()) else {
                continue;
            };
            let keys = GroupKeys::new(kind.group_name(), group);
            let bytes = if kind.requires_length() {
                keys.uint("bytes")?
            } else {
                keys.optional("bytes").map(|_| keys.uint("bytes")).transpose()?.unwrap_or(0)
            };
            sections.insert(
                kind,
                ImageSection {
                    kind,
                    bytes,
                    compression: keys.optional("compression").unwrap_or_default().to_string(),
                    encryption: keys.int("encryption")?,
                    sha256: keys.optional("sha256").map(str::to_string),
                    base_version: keys.optional("base_version").map(str::to_string),
                },
            );
        }

        Ok(Self {
            raw: content.to_string(),
            meta,
            sections,
            groups: doc.group_names().map(str::to_string).collect(),
        })
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Original manifest text
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn has_section(&self, kind: SectionKind) -> bool {
        self.sections.contains_key(&kind)
    }

    pub fn section(&self, kind: SectionKind) -> Option<&ImageSection> {
        self.sections.get(&kind)
    }

    /// Names of every group present, `META` included
    pub fn group_names(&self) -> &[String] {
        &self.groups
    }

    /// Sum of the declared lengths of the given sections
    pub fn total_bytes(&self, kinds: &[SectionKind]) -> u64 {
        kinds
            .iter()
            .filter_map(|k| self.section(*k))
            .map(|s| s.bytes)
            .sum()
    }
}

/// Key access for one group with defaults applied
struct GroupKeys<'a> {
    name: &'a str,
    keys: &'a BTreeMap<String, String>,
}

impl<'a> GroupKeys<'a> {
    fn new(name: &'a str, keys: &'a BTreeMap<String, String>) -> Self {
        Self { name, keys }
    }

    fn optional(&self, key: &str) -> Option<&'a str> {
        self.keys.get(key).map(String::as_str).or_else(|| {
            GROUP_DEFAULTS
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| *v)
        })
    }

    fn required(&self, key: &str) -> Result<&'a str, ManifestError> {
        self.optional(key).ok_or_else(|| ManifestError::MissingKey {
            group: self.name.to_string(),
            key: key.to_string(),
        })
    }

    fn int(&self, key: &str) -> Result<i64, ManifestError> {
        let value = self.required(key)?;
        value.parse().map_err(|_| self.invalid(key, value))
    }

    fn uint(&self, key: &str) -> Result<u64, ManifestError> {
        let value = self.required(key)?;
        value.parse().map_err(|_| self.invalid(key, value))
    }

    fn invalid(&self, key: &str, value: &str) -> ManifestError {
        ManifestError::InvalidValue {
            group: self.name.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = "[META]\n\
        manifest_version = 1.0.0\n\
        update_version = 1.8.0.6051\n\
        num_images = 2\n\
        ankidev = 1\n\
        \n\
        [BOOT]\n\
        bytes = 800\n\
        compression = gz\n\
        encryption = 1\n\
        sha256 = abc\n\
        \n\
        [SYSTEM]\n\
        bytes = 4000\n\
        compression = gz\n";

    #[test]
    fn test_parse_full_manifest() {
        let manifest = Manifest::parse(FULL).unwrap();
        let meta = manifest.meta();
        assert_eq!(meta.manifest_version, "1.0.0");
        assert_eq!(meta.update_version, "1.8.0.6051");
        assert_eq!(meta.num_images, 2);
        assert!(meta.dev_class);
        assert_eq!(meta.device_serial, "");
        assert!(!meta.reboot_after_install);

        let boot = manifest.section(SectionKind::Boot).unwrap();
        assert_eq!(boot.bytes, 800);
        assert_eq!(boot.compression, "gz");
        assert_eq!(boot.encryption, 1);
        assert_eq!(boot.sha256.as_deref(), Some("abc"));

        // encryption defaults to 0
        let system = manifest.section(SectionKind::System).unwrap();
        assert_eq!(system.encryption, 0);
        assert_eq!(system.sha256, None);

        assert_eq!(
            manifest.total_bytes(&[SectionKind::Boot, SectionKind::System]),
            4800
        );
        assert!(!manifest.has_section(SectionKind::Delta));
        assert_eq!(manifest.raw(), FULL);
    }

    #[test]
    fn test_meta_defaults() {
        let manifest = Manifest::parse(
            "[META]\nmanifest_version=1.0.0\nupdate_version=2.0.0\nnum_images=1\n",
        )
        .unwrap();
        assert!(!manifest.meta().dev_class);
        assert!(!manifest.meta().reboot_after_install);
        assert_eq!(manifest.meta().device_serial, "");
    }

    #[test]
    fn test_missing_meta() {
        assert!(matches!(
            Manifest::parse("[BOOT]\nbytes = 1\n"),
            Err(ManifestError::MissingGroup(_))
        ));
    }

    #[test]
    fn test_missing_required_key() {
        let err = Manifest::parse("[META]\nmanifest_version=1.0.0\nnum_images=1\n").unwrap_err();
        assert!(matches!(err, ManifestError::MissingKey { ref key, .. } if key == "update_version"));
    }

    #[test]
    fn test_invalid_numbers() {
        let err = Manifest::parse(
            "[META]\nmanifest_version=1.0.0\nupdate_version=1\nnum_images=two\n",
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::InvalidValue { ref key, .. } if key == "num_images"));

        let err = Manifest::parse(
            "[META]\nmanifest_version=1.0.0\nupdate_version=1\nnum_images=1\n[SYSTEM]\nbytes=-5\n",
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::InvalidValue { ref key, .. } if key == "bytes"));
    }

    #[test]
    fn test_overlay_needs_no_length() {
        let manifest = Manifest::parse(
            "[META]\nmanifest_version=1.0.0\nupdate_version=1\nnum_images=1\n[ANKI]\ncompression=gz\n",
        )
        .unwrap();
        assert_eq!(manifest.section(SectionKind::Anki).unwrap().bytes, 0);
    }

    #[test]
    fn test_entry_suffixes() {
        assert_eq!(SectionKind::Boot.entry_suffix(), Some("boot.img.gz"));
        assert_eq!(SectionKind::RecoveryFs.entry_suffix(), Some("sysfs.img.gz"));
        assert_eq!(SectionKind::Delta.entry_suffix(), Some("delta.bin.gz"));
        assert_eq!(SectionKind::Aboot.entry_suffix(), Some("emmc_appsboot.img.gz"));
        assert_eq!(SectionKind::Anki.entry_suffix(), None);
    }
}
