// src/platform/host.rs

//! Host utilities: disk sync, remount, reboot

use crate::command::{CommandError, ToolCommand};
use std::ffi::OsStr;
use std::path::Path;

pub trait HostOps {
    /// Flush written images to storage
    fn sync(&self) -> Result<(), CommandError>;

    /// Remount a mounted filesystem read-write
    fn remount_rw(&self, mount_point: &Path) -> Result<(), CommandError>;

    fn reboot(&self) -> Result<(), CommandError>;
}

/// Host operations through the standard system binaries
#[derive(Debug, Clone)]
pub struct SystemHost {
    sync: ToolCommand,
    mount: ToolCommand,
    reboot: ToolCommand,
}

impl SystemHost {
    pub fn new(sync: ToolCommand, mount: ToolCommand, reboot: ToolCommand) -> Self {
        Self {
            sync,
            mount,
            reboot,
        }
    }
}

impl HostOps for SystemHost {
    fn sync(&self) -> Result<(), CommandError> {
        self.sync.run::<&str>(&[])
    }

    fn remount_rw(&self, mount_point: &Path) -> Result<(), CommandError> {
        self.mount
            .run(&[OsStr::new("-o"), OsStr::new("remount,rw"), mount_point.as_os_str()])
    }

    fn reboot(&self) -> Result<(), CommandError> {
        self.reboot.run::<&str>(&[])
    }
}
