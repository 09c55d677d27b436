//! Volume usage for the models root
//!
//! Queried via statvfs so the stats endpoint can report how full the
//! durable volume is. Unsupported or failing filesystems report nothing.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Byte counts for the filesystem holding a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    /// Space available to unprivileged writers
    pub free_bytes: u64,
}

impl DiskUsage {
    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}

/// Query the filesystem that contains `path`
#[allow(clippy::unnecessary_cast)]
pub fn disk_usage(path: &Path) -> Option<DiskUsage> {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => {
            let fragment = stat.fragment_size() as u64;
            let total_bytes = stat.blocks() as u64 * fragment;
            let free_total = stat.blocks_free() as u64 * fragment;

            Some(DiskUsage {
                total_bytes,
                used_bytes: total_bytes.saturating_sub(free_total),
                free_bytes: stat.blocks_available() as u64 * fragment,
            })
        }
        Err(e) => {
            tracing::debug!(path = ?path, error = %e, "statvfs failed");
            None
        }
    }
}
