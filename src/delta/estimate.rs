// src/delta/estimate.rs

//! Delta progress estimation
//!
//! Progress for a delta runs in two unit spaces. While the payload
//! downloads, units are bytes and the expected total is the payload size
//! scaled by [`DOWNLOAD_SHARE_DENOMINATOR`], so the download covers about
//! one tenth of the bar. Once the payload is staged, units become engine
//! operations: every MiB copied or hashed on the eMMC counts as one, plus
//! every install operation.

use super::payload::PayloadSummary;

/// Download is expected to take about 1/10 of a delta update
pub const DOWNLOAD_SHARE_DENOMINATOR: u64 = 10;

const MIB: u64 = 1024 * 1024;

/// Expected units of the download phase
pub fn download_units(delta_bytes: u64) -> u64 {
    delta_bytes.saturating_mul(DOWNLOAD_SHARE_DENOMINATOR)
}

/// Engine work, in operations, for one application
pub fn operation_estimate(summary: &PayloadSummary, current_system_size: u64, current_boot_size: u64) -> u64 {
    summary.old_rootfs_size / MIB
        + summary.old_kernel_size / MIB
        + current_system_size / MIB
        + current_boot_size / MIB
        + summary.install_operations
        + summary.kernel_install_operations
        + summary.new_rootfs_size / MIB
        + summary.new_kernel_size / MIB
}

/// Apply-phase progress plan
///
/// The apply bar starts where the download left off, at about one tenth
/// of the total, and advances one unit per engine tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyPlan {
    pub start: u64,
    pub total: u64,
}

impl ApplyPlan {
    pub fn new(operations: u64) -> Self {
        let start = (operations + 1) / (DOWNLOAD_SHARE_DENOMINATOR - 1);
        Self {
            start,
            total: operations + start,
        }
    }
}
