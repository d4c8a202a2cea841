// src/config.rs
//! Engine configuration
//!
//! Every setting has a device default, so the engine runs without any file.
//! An optional TOML file overrides them:
//! - [paths] - Status directory, partition devices, key material, markers
//! - [tools] - Platform utilities and external filters
//! - [transfer] - Timeouts and block sizes
//! - [policy] - Optional integrity and version checks
//! - [auto] - Automatic update URL construction

use crate::manifest::ValidationPolicy;
use crate::pipeline::{FilterProgram, PipelineOptions};
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Strings accepted as true in environment settings
pub const TRUE_SYNONYMS: &[&str] = &["True", "true", "on", "1"];

/// Whether an environment-style value counts as true
pub fn is_truthy(value: &str) -> bool {
    TRUE_SYNONYMS.contains(&value)
}

/// TOML configuration file structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub paths: PathsSection,

    #[serde(default)]
    pub tools: ToolsSection,

    #[serde(default)]
    pub transfer: TransferSection,

    #[serde(default)]
    pub policy: PolicySection,

    #[serde(default)]
    pub auto: AutoSection,
}

/// Filesystem locations
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    /// Status directory polled by monitors
    pub status_dir: PathBuf,
    /// Directory of by-name partition device links
    pub device_dir: PathBuf,
    /// Kernel command line
    pub cmdline: PathBuf,
    /// Cookie requesting a user-data wipe on next boot
    pub wipe_cookie: PathBuf,
    /// Mount point overlay archives are unpacked over
    pub root: PathBuf,
    /// Passphrase file for image decryption
    pub key_file: PathBuf,
    /// Public key for manifest signatures
    pub public_key: PathBuf,
    /// Hardware serial number
    pub serial_file: PathBuf,
    /// Any of these existing inhibits automatic updates
    pub inhibit_markers: Vec<PathBuf>,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            status_dir: PathBuf::from(crate::status::DEFAULT_STATUS_DIR),
            device_dir: PathBuf::from("/dev/block/bootdevice/by-name"),
            cmdline: PathBuf::from("/proc/cmdline"),
            wipe_cookie: PathBuf::from("/run/wipe-data"),
            root: PathBuf::from("/"),
            key_file: PathBuf::from("/anki/etc/ota.pas"),
            public_key: PathBuf::from("/anki/etc/ota.pub"),
            serial_file: PathBuf::from("/sys/devices/soc0/serial_number"),
            inhibit_markers: vec![
                PathBuf::from("/etc/do-not-auto-update"),
                PathBuf::from("/data/data/user-do-not-auto-update"),
                PathBuf::from("/anki-devtools"),
            ],
        }
    }
}

/// External programs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub bootctl: PathBuf,
    /// Telemetry utility; empty sends events to the log only
    pub log_event: PathBuf,
    pub getprop: PathBuf,
    pub sync: PathBuf,
    pub mount: PathBuf,
    pub reboot: PathBuf,
    pub openssl: PathBuf,
    pub decompress: PathBuf,
    pub payload_engine: PathBuf,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            bootctl: PathBuf::from("/bin/bootctl-anki"),
            log_event: PathBuf::from("/anki/bin/vic-log-event"),
            getprop: PathBuf::from("/usr/bin/getprop"),
            sync: PathBuf::from("/bin/sync"),
            mount: PathBuf::from("/bin/mount"),
            reboot: PathBuf::from("/sbin/reboot"),
            openssl: PathBuf::from("openssl"),
            decompress: PathBuf::from("gunzip"),
            payload_engine: PathBuf::from("/anki/bin/update-payload"),
        }
    }
}

/// Transfer limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferSection {
    /// Network and filter inactivity timeout
    pub timeout_secs: u64,
    /// Encoded bytes pushed into the filters at a time
    pub chunk_size: usize,
    /// Bytes per partition write
    pub write_block: usize,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            timeout_secs: 90,
            chunk_size: crate::pipeline::DEFAULT_CHUNK_SIZE,
            write_block: crate::extract::DEFAULT_WRITE_BLOCK,
        }
    }
}

/// Optional checks
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicySection {
    pub verify_manifest_signature: bool,
    pub verify_image_digests: bool,
    pub enforce_version_policy: bool,
    pub enforce_delta_base_version: bool,
    pub allow_downgrade: bool,
    /// Device runs development-class firmware
    pub dev_class: bool,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            verify_manifest_signature: false,
            verify_image_digests: false,
            enforce_version_policy: false,
            enforce_delta_base_version: false,
            allow_downgrade: false,
            dev_class: true,
        }
    }
}

/// Automatic update URL settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoSection {
    pub base_url: Option<String>,
    /// Replaces `base_url` on development-class devices
    pub dev_base_url: Option<String>,
    pub ota_type: String,
    pub use_sharding: bool,
    /// Fixed shard instead of one derived from the serial
    pub shard: Option<String>,
}

impl Default for AutoSection {
    fn default() -> Self {
        Self {
            base_url: None,
            dev_base_url: None,
            ota_type: "diff".to_string(),
            use_sharding: false,
            shard: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.transfer.timeout_secs == 0 {
            bail!("transfer.timeout_secs must be positive");
        }
        if self.transfer.chunk_size == 0 {
            bail!("transfer.chunk_size must be positive");
        }
        if self.transfer.write_block == 0 {
            bail!("transfer.write_block must be positive");
        }
        if self.auto.ota_type.trim().is_empty() {
            bail!("auto.ota_type must not be empty");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.transfer.timeout_secs)
    }

    /// Decrypt/decompress filters and limits for image sections
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            decrypt: FilterProgram::new(&self.tools.openssl).with_args([
                "enc".to_string(),
                "-d".to_string(),
                "-aes-256-ctr".to_string(),
                "-pass".to_string(),
                format!("file:{}", self.paths.key_file.display()),
                "-md".to_string(),
                "md5".to_string(),
            ]),
            decompress: FilterProgram::new(&self.tools.decompress),
            chunk_size: self.transfer.chunk_size,
            stall_timeout: self.timeout(),
            digest: self.policy.verify_image_digests,
        }
    }

    pub fn validation_policy(&self) -> ValidationPolicy {
        ValidationPolicy {
            enforce_version_policy: self.policy.enforce_version_policy,
            allow_downgrade: self.policy.allow_downgrade,
            enforce_delta_base_version: self.policy.enforce_delta_base_version,
        }
    }
}
