//! SCSI addressing and device lookup through sysfs.

use std::fmt::{self, Display};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::HostLayout;
use crate::error::{ConnectorError, Result};

/// Host/Channel/Target/LUN address of a SCSI device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hctl {
    pub host: u32,
    pub channel: u32,
    pub target: u32,
    pub lun: u32,
}

impl Display for Hctl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.host, self.channel, self.target, self.lun)
    }
}

/// Sorted paths matching `pattern`; unreadable entries are skipped.
pub fn glob_paths(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = glob::glob(pattern)?.filter_map(|entry| entry.ok()).collect();
    paths.sort();
    Ok(paths)
}

/// The single path matching `pattern`, or [`ConnectorError::Ambiguous`].
pub fn glob_one(pattern: &str) -> Result<PathBuf> {
    let mut paths = glob_paths(pattern)?;
    if paths.len() != 1 {
        return Err(ConnectorError::Ambiguous {
            pattern: pattern.to_string(),
            matches: paths.len(),
        });
    }
    Ok(paths.remove(0))
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn hctl_error(path: &Path) -> ConnectorError {
    ConnectorError::Parse {
        what: "iscsi target path",
        detail: path.display().to_string(),
    }
}

/// Resolve the HCTL of `lun` on iSCSI session `session_id`.
pub fn hctl(layout: &HostLayout, session_id: u32, lun: u32) -> Result<Hctl> {
    let pattern = layout.sys_pattern(&format!(
        "class/iscsi_host/host*/device/session{}/target*",
        session_id
    ));
    let path = glob_one(&pattern)?;

    // target<h>:<c>:<t>
    let name = file_name(&path);
    let ids: Vec<&str> = name.split(':').collect();
    if ids.len() != 3 {
        return Err(hctl_error(&path));
    }
    let channel = ids[1].parse::<u32>().map_err(|_| hctl_error(&path))?;
    let target = ids[2].parse::<u32>().map_err(|_| hctl_error(&path))?;

    let rel = path.strip_prefix(&layout.sys_root).unwrap_or(&path);
    let host = rel
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .find_map(|c| c.strip_prefix("host").and_then(|id| id.parse::<u32>().ok()))
        .ok_or_else(|| hctl_error(&path))?;

    Ok(Hctl {
        host,
        channel,
        target,
        lun,
    })
}

/// Write `content` to a sysfs attribute.
pub fn write_attr(path: &Path, content: &str) -> Result<()> {
    debug!(path = %path.display(), content = %content, "Writing sysfs attribute");
    std::fs::write(path, content).map_err(|e| ConnectorError::io(path, e))
}

/// Read a sysfs attribute, trimmed.
pub fn read_attr(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| ConnectorError::io(path, e))
}

/// Ask the SCSI host to scan for `hctl`.
pub fn scan(layout: &HostLayout, hctl: &Hctl) -> Result<()> {
    let path = layout.sys(format!("class/scsi_host/host{}/scan", hctl.host));
    write_attr(&path, &format!("{} {} {}", hctl.channel, hctl.target, hctl.lun))
}

/// Block device name bound to `hctl` on `session_id`, if the kernel has
/// created it yet.
pub fn device_name(layout: &HostLayout, session_id: u32, hctl: &Hctl) -> Result<Option<String>> {
    let pattern = layout.sys_pattern(&format!(
        "class/iscsi_host/host{h}/device/session{s}/target{h}:{c}:{t}/{h}:{c}:{t}:{l}/block/*",
        h = hctl.host,
        s = session_id,
        c = hctl.channel,
        t = hctl.target,
        l = hctl.lun,
    ));
    let paths = glob_paths(&pattern)?;
    Ok(paths.first().map(|p| file_name(p)))
}

/// Size of a block device in bytes from `/sys/block/<name>/size`.
pub fn block_size_bytes(layout: &HostLayout, name: &str) -> Result<u64> {
    let path = layout.sys(format!("block/{}/size", name));
    let sectors = read_attr(&path)?;
    let sectors = sectors.parse::<u64>().map_err(|_| ConnectorError::Parse {
        what: "block device size",
        detail: format!("'{}' in {}", sectors, path.display()),
    })?;
    Ok(sectors * 512)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn session_tree(root: &TempDir, host: u32, session: u32, target_dir: &str) -> HostLayout {
        let layout = HostLayout::rooted_at(root.path());
        let dir = layout.sys(format!(
            "class/iscsi_host/host{}/device/session{}/{}",
            host, session, target_dir
        ));
        fs::create_dir_all(dir).unwrap();
        layout
    }

    #[test]
    fn test_hctl_resolution() {
        let root = TempDir::new().unwrap();
        let layout = session_tree(&root, 3, 1, "target3:0:0");
        let hctl = hctl(&layout, 1, 0).unwrap();
        assert_eq!(
            hctl,
            Hctl {
                host: 3,
                channel: 0,
                target: 0,
                lun: 0
            }
        );
        assert_eq!(hctl.to_string(), "3:0:0:0");
    }

    #[test]
    fn test_hctl_missing_session_is_ambiguous() {
        let root = TempDir::new().unwrap();
        let layout = session_tree(&root, 3, 1, "target3:0:0");
        assert!(matches!(
            hctl(&layout, 2, 0),
            Err(ConnectorError::Ambiguous { matches: 0, .. })
        ));
    }

    #[test]
    fn test_hctl_multiple_targets_is_ambiguous() {
        let root = TempDir::new().unwrap();
        let layout = session_tree(&root, 3, 1, "target3:0:0");
        session_tree(&root, 3, 1, "target3:0:1");
        assert!(matches!(
            hctl(&layout, 1, 0),
            Err(ConnectorError::Ambiguous { matches: 2, .. })
        ));
    }

    #[test]
    fn test_hctl_malformed_target_name() {
        let root = TempDir::new().unwrap();
        let layout = session_tree(&root, 3, 1, "target3-0");
        assert!(matches!(hctl(&layout, 1, 0), Err(ConnectorError::Parse { .. })));
    }

    #[test]
    fn test_scan_writes_channel_target_lun() {
        let root = TempDir::new().unwrap();
        let layout = HostLayout::rooted_at(root.path());
        fs::create_dir_all(layout.sys("class/scsi_host/host5")).unwrap();
        let hctl = Hctl {
            host: 5,
            channel: 0,
            target: 2,
            lun: 7,
        };
        scan(&layout, &hctl).unwrap();
        let written = fs::read_to_string(layout.sys("class/scsi_host/host5/scan")).unwrap();
        assert_eq!(written, "0 2 7");
    }

    #[test]
    fn test_device_name_lookup() {
        let root = TempDir::new().unwrap();
        let layout = session_tree(&root, 3, 1, "target3:0:0/3:0:0:1/block/sdc");
        let hctl = Hctl {
            host: 3,
            channel: 0,
            target: 0,
            lun: 1,
        };
        assert_eq!(device_name(&layout, 1, &hctl).unwrap(), Some("sdc".to_string()));

        let other = Hctl { lun: 2, ..hctl };
        assert_eq!(device_name(&layout, 1, &other).unwrap(), None);
    }

    #[test]
    fn test_block_size_bytes() {
        let root = TempDir::new().unwrap();
        let layout = HostLayout::rooted_at(root.path());
        fs::create_dir_all(layout.sys("block/sdb")).unwrap();
        fs::write(layout.sys("block/sdb/size"), "2097152\n").unwrap();
        assert_eq!(block_size_bytes(&layout, "sdb").unwrap(), 1073741824);
    }
}
