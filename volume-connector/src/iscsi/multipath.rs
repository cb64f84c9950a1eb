//! Device-mapper multipath lookups.

use tracing::{info, warn};

use super::sysfs::{file_name, glob_paths};
use crate::config::HostLayout;
use crate::error::{ConnectorError, Result};
use crate::exec::Executor;

/// The dm device holding `device_name` (e.g. `sdb` -> `dm-0`).
///
/// `Ok(None)` means the path is not (yet) claimed by multipath; more than one
/// holder is an error.
pub fn find_sysfs_multipath_dm(layout: &HostLayout, device_name: &str) -> Result<Option<String>> {
    let pattern = layout.sys_pattern(&format!("block/{}/holders/dm-*", device_name));
    let holders = glob_paths(&pattern)?;
    match holders.len() {
        0 => Ok(None),
        1 => Ok(Some(file_name(&holders[0]))),
        n => Err(ConnectorError::Ambiguous {
            pattern,
            matches: n,
        }),
    }
}

/// Release the multipath map on `dm_path`. Failures are logged, not returned,
/// so the underlying paths are still removed.
pub async fn flush_multipath_device(executor: &dyn Executor, dm_path: &str) {
    match executor.execute("multipath", &["-f", dm_path]).await {
        Ok(_) => info!(device = %dm_path, "Flushed multipath device"),
        Err(e) => warn!(device = %dm_path, error = %e, "Failed to flush multipath device"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_find_multipath_dm() {
        let root = TempDir::new().unwrap();
        let layout = HostLayout::rooted_at(root.path());
        fs::create_dir_all(layout.sys("block/sdb/holders/dm-3")).unwrap();
        fs::create_dir_all(layout.sys("block/sdc/holders")).unwrap();

        assert_eq!(
            find_sysfs_multipath_dm(&layout, "sdb").unwrap(),
            Some("dm-3".to_string())
        );
        assert_eq!(find_sysfs_multipath_dm(&layout, "sdc").unwrap(), None);
        assert_eq!(find_sysfs_multipath_dm(&layout, "sdz").unwrap(), None);
    }

    #[test]
    fn test_find_multipath_dm_ambiguous() {
        let root = TempDir::new().unwrap();
        let layout = HostLayout::rooted_at(root.path());
        fs::create_dir_all(layout.sys("block/sdb/holders/dm-0")).unwrap();
        fs::create_dir_all(layout.sys("block/sdb/holders/dm-1")).unwrap();
        assert!(matches!(
            find_sysfs_multipath_dm(&layout, "sdb"),
            Err(ConnectorError::Ambiguous { matches: 2, .. })
        ));
    }
}
