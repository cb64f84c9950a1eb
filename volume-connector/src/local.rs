//! Local LVM volumes already present in the host device tree.

use async_trait::async_trait;
use tracing::{info, instrument};

use crate::config::ConnectorContext;
use crate::connector::Connector;
use crate::error::{ConnectorError, Result};
use crate::iscsi::sysfs::glob_one;
use crate::metrics::OperationTimer;
use crate::types::{DeviceInfo, LocalProperties, Protocol};

/// Size in bytes from `lvdisplay --units B` output.
pub fn parse_lv_size(output: &str) -> Result<u64> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("LV Size"))
        .ok_or_else(|| ConnectorError::Parse {
            what: "lvdisplay output",
            detail: "no 'LV Size' line".to_string(),
        })?;

    // "LV Size                1073741824.00 B"
    let raw = line.split_whitespace().nth(2).ok_or_else(|| ConnectorError::Parse {
        what: "lvdisplay LV Size",
        detail: line.to_string(),
    })?;
    let whole = raw.trim_start_matches('<').split('.').next().unwrap_or_default();
    whole.parse::<u64>().map_err(|_| ConnectorError::Parse {
        what: "lvdisplay LV Size",
        detail: line.to_string(),
    })
}

pub struct LocalConnector {
    props: LocalProperties,
    ctx: ConnectorContext,
}

impl LocalConnector {
    pub fn new(props: LocalProperties, ctx: ConnectorContext) -> Self {
        Self { props, ctx }
    }

    /// The single `/dev/*/*<volume_id>` entry.
    fn find_volume(&self) -> Result<String> {
        if self.props.volume_id.is_empty() {
            return Err(ConnectorError::InvalidConfig("volume_id is required".to_string()));
        }
        let pattern = self
            .ctx
            .layout()
            .dev_pattern(&format!("*/*{}", glob::Pattern::escape(&self.props.volume_id)));
        let path = glob_one(&pattern)?;
        Ok(path.to_string_lossy().into_owned())
    }
}

#[async_trait]
impl Connector for LocalConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Local
    }

    #[instrument(skip(self), fields(volume_id = %self.props.volume_id))]
    async fn connect_volume(&self) -> Result<DeviceInfo> {
        let timer = OperationTimer::new("local_connect");
        let result = self.find_volume().map(|path| {
            info!(path = %path, "Found local volume");
            DeviceInfo::block(path)
        });
        timer.finish(result)
    }

    async fn disconnect_volume(&self, device_info: &DeviceInfo) -> Result<()> {
        info!(path = %device_info.path, "Local volume needs no detach");
        Ok(())
    }

    #[instrument(skip(self), fields(volume_id = %self.props.volume_id))]
    async fn extend_volume(&self) -> Result<u64> {
        let timer = OperationTimer::new("local_extend");
        let result = async {
            let path = self.find_volume()?;
            let output = self
                .ctx
                .executor
                .execute("lvdisplay", &["--units", "B", path.as_str()])
                .await?;
            let size = parse_lv_size(&output)?;
            info!(path = %path, size, "Read local volume size");
            Ok(size)
        }
        .await;
        timer.finish(result)
    }

    fn device_path(&self) -> String {
        self.find_volume().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectorConfig, HostLayout};
    use std::sync::Arc;
    use tempfile::TempDir;

    const LVDISPLAY: &str = "  --- Logical volume ---
  LV Path                /dev/cinder-volumes/volume-abc
  LV Name                volume-abc
  VG Name                cinder-volumes
  LV Write Access        read/write
  LV Status              available
  LV Size                1073741824.00 B
  Current LE             256
";

    fn connector(root: &TempDir, volume_id: &str) -> LocalConnector {
        let config = ConnectorConfig {
            layout: HostLayout::rooted_at(root.path()),
            ..Default::default()
        };
        let ctx = ConnectorContext::new(config, Arc::new(crate::exec::CommandExecutor::new()));
        LocalConnector::new(
            LocalProperties {
                volume_id: volume_id.to_string(),
            },
            ctx,
        )
    }

    #[test]
    fn test_parse_lv_size() {
        assert_eq!(parse_lv_size(LVDISPLAY).unwrap(), 1073741824);
        assert_eq!(parse_lv_size("LV Size <2048.00 B").unwrap(), 2048);
        assert!(parse_lv_size("LV Status available").is_err());
        assert!(parse_lv_size("LV Size").is_err());
        assert!(parse_lv_size("LV Size lots B").is_err());
    }

    #[test]
    fn test_find_volume_single_match() {
        let root = TempDir::new().unwrap();
        let vg = root.path().join("dev/cinder-volumes");
        std::fs::create_dir_all(&vg).unwrap();
        std::fs::write(vg.join("volume-abc"), "").unwrap();

        let c = connector(&root, "abc");
        assert_eq!(c.device_path(), vg.join("volume-abc").to_string_lossy());
    }

    #[test]
    fn test_find_volume_requires_exactly_one() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("dev/vg0")).unwrap();
        std::fs::create_dir_all(root.path().join("dev/vg1")).unwrap();
        let c = connector(&root, "abc");
        assert!(matches!(c.find_volume(), Err(ConnectorError::Ambiguous { matches: 0, .. })));

        std::fs::write(root.path().join("dev/vg0/volume-abc"), "").unwrap();
        std::fs::write(root.path().join("dev/vg1/snap-abc"), "").unwrap();
        assert!(matches!(c.find_volume(), Err(ConnectorError::Ambiguous { matches: 2, .. })));
        assert_eq!(c.device_path(), "");
    }

    #[test]
    fn test_empty_volume_id_rejected() {
        let root = TempDir::new().unwrap();
        assert!(matches!(
            connector(&root, "").find_volume(),
            Err(ConnectorError::InvalidConfig(_))
        ));
    }
}
