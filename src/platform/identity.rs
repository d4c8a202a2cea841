// src/platform/identity.rs

//! Device identity and firmware version lookups

use crate::command::ToolCommand;
use std::io;
use std::path::PathBuf;
use tracing::debug;

/// Running OS version
pub const OS_VERSION_PROP: &str = "ro.anki.version";
/// Robot application version
pub const VICTOR_VERSION_PROP: &str = "ro.anki.victor.version";
/// Build target name
pub const BUILD_TARGET_PROP: &str = "ro.build.target";
/// Electronic serial number
pub const SERIALNO_PROP: &str = "ro.serialno";

/// Source of identity strings for the running device
pub trait DeviceIdentity {
    /// Look up a property value, `None` if unset or the lookup failed
    fn property(&self, name: &str) -> Option<String>;

    /// Hardware serial used to lock factory bundles to one device
    fn hardware_serial(&self) -> io::Result<String>;

    /// Whether the running firmware is a development build
    fn is_dev_class(&self) -> bool;

    fn os_version(&self) -> String {
        self.property(OS_VERSION_PROP).unwrap_or_default()
    }
}

/// Identity backed by the property tool and the SoC serial file
#[derive(Debug, Clone)]
pub struct PropertyIdentity {
    getprop: ToolCommand,
    serial_path: PathBuf,
    dev_class: bool,
}

impl PropertyIdentity {
    pub fn new(getprop: ToolCommand, serial_path: impl Into<PathBuf>, dev_class: bool) -> Self {
        Self {
            getprop,
            serial_path: serial_path.into(),
            dev_class,
        }
    }
}

impl DeviceIdentity for PropertyIdentity {
    fn property(&self, name: &str) -> Option<String> {
        match self.getprop.output(&[name]) {
            Ok(value) => Some(value.trim().to_string()),
            Err(e) => {
                debug!("Property {} unavailable: {}", name, e);
                None
            }
        }
    }

    fn hardware_serial(&self) -> io::Result<String> {
        Ok(std::fs::read_to_string(&self.serial_path)?.trim().to_string())
    }

    fn is_dev_class(&self) -> bool {
        self.dev_class
    }
}
