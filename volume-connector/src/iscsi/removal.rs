//! Tear-down of kernel SCSI devices.
//!
//! Order per connection: flush the multipath map, then for every path flush
//! buffered I/O and request deletion through sysfs, wait for the device
//! nodes to disappear, and finally drop `/dev/disk/by-id/scsi-*` links that
//! pointed at them.

use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use super::multipath::{find_sysfs_multipath_dm, flush_multipath_device};
use super::sysfs::{glob_paths, write_attr};
use crate::config::{HostLayout, PollPolicy};
use crate::error::{ConnectorError, Result};
use crate::exec::Executor;
use crate::metrics;

pub struct DeviceRemover<'a> {
    executor: &'a dyn Executor,
    layout: &'a HostLayout,
    policy: PollPolicy,
}

impl<'a> DeviceRemover<'a> {
    pub fn new(executor: &'a dyn Executor, layout: &'a HostLayout, policy: PollPolicy) -> Self {
        Self {
            executor,
            layout,
            policy,
        }
    }

    /// Remove every SCSI device in `device_names` (kernel names like `sdb`).
    #[instrument(skip(self))]
    pub async fn remove_connection(&self, device_names: &[String], is_multipath: bool) -> Result<()> {
        if device_names.is_empty() {
            return Ok(());
        }

        if is_multipath {
            match find_sysfs_multipath_dm(self.layout, &device_names[0]) {
                Ok(Some(dm)) => {
                    let dm_path = self.layout.block_device(&dm);
                    flush_multipath_device(self.executor, &dm_path.to_string_lossy()).await;
                }
                Ok(None) => debug!(device = %device_names[0], "No multipath holder found"),
                Err(e) => warn!(error = %e, "Failed to resolve multipath device"),
            }
        }

        let mut paths = Vec::with_capacity(device_names.len());
        for name in device_names {
            self.remove_scsi_device(name).await?;
            paths.push(self.layout.block_device(name));
        }

        self.wait_for_removal(&paths).await?;

        let removed = remove_scsi_symlinks(self.layout, &paths)?;
        info!(devices = ?device_names, links = removed, "Removed SCSI devices");
        Ok(())
    }

    async fn remove_scsi_device(&self, name: &str) -> Result<()> {
        let delete_path = self.layout.sys(format!("block/{}/device/delete", name));
        if !delete_path.exists() {
            return Err(ConnectorError::MissingSysfsEntry(delete_path));
        }

        let device_path = self.layout.block_device(name);
        self.flush_device_io(&device_path).await?;

        write_attr(&delete_path, "1")?;
        debug!(device = %name, "Requested SCSI device removal");
        Ok(())
    }

    async fn flush_device_io(&self, device_path: &Path) -> Result<()> {
        if !device_path.exists() {
            return Err(ConnectorError::DeviceNotFound(device_path.display().to_string()));
        }
        let path = device_path.to_string_lossy().into_owned();
        self.executor
            .execute("blockdev", &["--flushbufs", path.as_str()])
            .await?;
        Ok(())
    }

    /// Poll until none of `paths` exist, up to the policy's attempt bound.
    pub async fn wait_for_removal(&self, paths: &[PathBuf]) -> Result<()> {
        for attempt in 0..self.policy.attempts {
            match paths.iter().find(|p| p.exists()) {
                None => return Ok(()),
                Some(remaining) => {
                    debug!(device = %remaining.display(), attempt, "Device still present");
                }
            }
            tokio::time::sleep(self.policy.interval).await;
        }

        let devices: Vec<String> = paths
            .iter()
            .filter(|p| p.exists())
            .map(|p| p.display().to_string())
            .collect();
        if devices.is_empty() {
            return Ok(());
        }

        metrics::record_removal_timeout();
        warn!(devices = ?devices, attempts = self.policy.attempts, "Device removal did not converge");
        Err(ConnectorError::RemovalTimeout {
            devices,
            attempts: self.policy.attempts,
        })
    }
}

/// Resolve a symlink target without touching the filesystem, so links to
/// already-removed devices still resolve.
fn resolve_link(link: &Path, target: &Path) -> PathBuf {
    let joined = if target.is_absolute() {
        target.to_path_buf()
    } else {
        link.parent().unwrap_or(Path::new("/")).join(target)
    };

    let mut resolved = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            other => resolved.push(other.as_os_str()),
        }
    }
    resolved
}

/// Remove `/dev/disk/by-id/scsi-*` links that point at any of `device_paths`.
/// Returns the number of links removed.
pub fn remove_scsi_symlinks(layout: &HostLayout, device_paths: &[PathBuf]) -> Result<usize> {
    let links = glob_paths(&layout.dev_pattern("disk/by-id/scsi-*"))?;
    let mut removed = 0;

    for link in links {
        let target = match fs::read_link(&link) {
            Ok(target) => target,
            Err(e) => {
                debug!(link = %link.display(), error = %e, "Not a symlink");
                continue;
            }
        };

        let resolved = resolve_link(&link, &target);
        if device_paths.iter().any(|d| *d == resolved) {
            fs::remove_file(&link).map_err(|e| ConnectorError::io(&link, e))?;
            debug!(link = %link.display(), "Removed stale SCSI symlink");
            removed += 1;
        }
    }

    Ok(removed)
}
