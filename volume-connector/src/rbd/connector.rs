//! Ceph RBD connector: kernel mapping through `rbd`, or an in-process image
//! handle through the Ceph client binding.

use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::client::{CephCluster, RbdVolumeIo};
use super::config::{CephArtifacts, check_or_get_keyring_contents, monitor_hosts, remove_conf};
use crate::config::ConnectorContext;
use crate::connector::Connector;
use crate::error::{ConnectorError, Result};
use crate::metrics::OperationTimer;
use crate::types::{DeviceInfo, DeviceType, Protocol, RbdProperties};

const RBD: &str = "rbd";

/// One entry of `rbd showmapped --format=json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MappedDevice {
    #[serde(default)]
    pub pool: Option<String>,
    pub name: String,
    pub device: String,
}

/// Parse `rbd showmapped --format=json`: either an array of records or,
/// from older releases, an object keyed by device id.
pub fn parse_showmapped(output: &str) -> Result<Vec<MappedDevice>> {
    let value: Value = serde_json::from_str(output.trim())?;
    let records = match value {
        Value::Array(items) => items,
        Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
        other => {
            return Err(ConnectorError::Parse {
                what: "rbd showmapped output",
                detail: format!("expected array or object, got {}", other),
            });
        }
    };

    records
        .into_iter()
        .map(|record| serde_json::from_value(record).map_err(ConnectorError::from))
        .collect()
}

pub struct RbdConnector {
    props: RbdProperties,
    ctx: ConnectorContext,
}

impl RbdConnector {
    pub fn new(props: RbdProperties, ctx: ConnectorContext) -> Self {
        Self { props, ctx }
    }

    fn user(&self) -> &str {
        &self.props.auth_username
    }

    fn mapped_path(&self) -> Result<PathBuf> {
        let (pool, image) = self.props.pool_and_image()?;
        Ok(self.ctx.layout().dev(format!("rbd/{}/{}", pool, image)))
    }

    fn mon_hosts(&self) -> Result<String> {
        monitor_hosts(&self.props.hosts, &self.props.ports)
    }

    /// `[--conf <conf>] --id <user> --mon_host <hosts>`
    fn rbd_args(&self, conf: Option<&Path>) -> Result<Vec<String>> {
        let mut args = Vec::new();
        if let Some(conf) = conf {
            args.push("--conf".to_string());
            args.push(conf.to_string_lossy().into_owned());
        }
        args.push("--id".to_string());
        args.push(self.user().to_string());
        args.push("--mon_host".to_string());
        args.push(self.mon_hosts()?);
        Ok(args)
    }

    async fn rbd(&self, args: &[String]) -> Result<String> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.ctx.executor.execute(RBD, &args).await
    }

    /// Kernel device currently mapped for this pool/image, if any.
    async fn find_root_device(&self, conf: Option<&Path>) -> Result<Option<String>> {
        let (pool, image) = self.props.pool_and_image()?;
        let mut args = vec!["showmapped".to_string(), "--format=json".to_string()];
        args.extend(self.rbd_args(conf)?);

        let output = self.rbd(&args).await?;
        let device = parse_showmapped(&output)?
            .into_iter()
            .find(|m| m.name == image && m.pool.as_deref().is_none_or(|p| p == pool))
            .map(|m| m.device);
        Ok(device)
    }

    #[instrument(skip(self), fields(name = %self.props.name))]
    async fn local_attach(&self) -> Result<DeviceInfo> {
        if !self.ctx.executor.is_installed(RBD).await {
            return Err(ConnectorError::CommandUnavailable {
                program: RBD.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "ceph-common is not installed"),
            });
        }

        let (pool, image) = self.props.pool_and_image()?;
        let path = self.mapped_path()?;
        if path.exists() {
            info!(path = %path.display(), "RBD volume already mapped");
            return Ok(DeviceInfo::block(path.to_string_lossy()));
        }

        let mon_hosts = self.mon_hosts()?;
        let artifacts = CephArtifacts::create(
            &self.ctx.config.temp_dir,
            self.user(),
            &mon_hosts,
            &self.props.keyring,
        )?;

        let mut args = vec![
            "map".to_string(),
            image.to_string(),
            "--pool".to_string(),
            pool.to_string(),
            "--id".to_string(),
            self.user().to_string(),
            "--mon_host".to_string(),
            mon_hosts,
        ];
        if let Some(conf) = artifacts.conf_path() {
            args.push("--conf".to_string());
            args.push(conf.to_string_lossy().into_owned());
        }
        let output = self.rbd(&args).await?;
        let conf = artifacts.keep();

        let device = self.wait_for_mapping(&path, output.trim()).await;
        info!(device = %device, "Mapped RBD volume");
        Ok(DeviceInfo::block(device).with_conf(conf))
    }

    /// The udev link for the image, or the device `rbd map` printed when the
    /// link never shows up.
    async fn wait_for_mapping(&self, link: &Path, printed: &str) -> String {
        let policy = self.ctx.config.device_wait;
        for _ in 0..policy.attempts {
            if link.exists() {
                return link.to_string_lossy().into_owned();
            }
            tokio::time::sleep(policy.interval).await;
        }

        if printed.starts_with('/') {
            warn!(link = %link.display(), device = %printed, "RBD link did not appear, using mapped device");
            printed.to_string()
        } else {
            warn!(link = %link.display(), "RBD link did not appear");
            link.to_string_lossy().into_owned()
        }
    }

    fn ceph(&self) -> Result<Arc<dyn CephCluster>> {
        self.ctx.ceph.clone().ok_or_else(|| {
            ConnectorError::InvalidConfig("remote RBD access requires a Ceph client binding".to_string())
        })
    }

    /// Open an image handle. The returned artifacts own the conf used for
    /// the connection.
    pub async fn open_volume_io(&self) -> Result<(RbdVolumeIo, CephArtifacts)> {
        let ceph = self.ceph()?;
        let (pool, image) = self.props.pool_and_image()?;
        let key = check_or_get_keyring_contents(
            self.ctx.layout(),
            &self.props.keyring,
            self.props.cluster(),
            self.user(),
        );
        let artifacts = CephArtifacts::create(&self.ctx.config.temp_dir, self.user(), &self.mon_hosts()?, &key)?;

        let user = self.user().to_string();
        let pool = pool.to_string();
        let image = image.to_string();
        let cluster = self.props.cluster().to_string();
        let conf = artifacts.conf_path().map(Path::to_path_buf);

        let io = tokio::task::spawn_blocking(move || -> Result<RbdVolumeIo> {
            let ioctx = ceph.connect(&user, &pool, conf.as_deref(), &cluster)?;
            let handle = ioctx.open_image(&image)?;
            Ok(RbdVolumeIo::new(handle, &pool, &user, conf))
        })
        .await??;

        Ok((io, artifacts))
    }

    #[instrument(skip(self), fields(name = %self.props.name))]
    async fn remote_attach(&self) -> Result<DeviceInfo> {
        let (io, artifacts) = self.open_volume_io().await?;
        let size = io.size()?;
        io.close()?;
        debug!(size, "Validated RBD image handle");

        Ok(DeviceInfo {
            path: self.props.name.clone(),
            device_type: DeviceType::Rbd,
            conf_path: artifacts.keep(),
        })
    }

    async fn local_size(&self) -> Result<u64> {
        let device = self
            .find_root_device(None)
            .await?
            .ok_or_else(|| ConnectorError::DeviceNotFound(format!("rbd image {} is not mapped", self.props.name)))?;

        let name = Path::new(&device)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let number = name.strip_prefix("rbd").ok_or_else(|| ConnectorError::Parse {
            what: "rbd device name",
            detail: device.clone(),
        })?;

        let path = self.ctx.layout().sys(format!("devices/rbd/{}/size", number));
        let raw = std::fs::read_to_string(&path).map_err(|e| ConnectorError::io(&path, e))?;
        raw.trim().trim_matches('\'').parse::<u64>().map_err(|_| ConnectorError::Parse {
            what: "rbd device size",
            detail: raw.trim().to_string(),
        })
    }

    async fn remote_size(&self) -> Result<u64> {
        let (mut io, _artifacts) = self.open_volume_io().await?;
        io.seek(SeekFrom::End(0))
            .map_err(|e| ConnectorError::Ceph(e.to_string()))?;
        let size = io.tell();
        io.close()?;
        Ok(size)
    }
}

#[async_trait]
impl Connector for RbdConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Rbd
    }

    async fn connect_volume(&self) -> Result<DeviceInfo> {
        let timer = OperationTimer::new("rbd_connect");
        let result = if self.props.do_local_attach {
            self.local_attach().await
        } else {
            self.remote_attach().await
        };
        timer.finish(result)
    }

    #[instrument(skip(self))]
    async fn disconnect_volume(&self, device_info: &DeviceInfo) -> Result<()> {
        let timer = OperationTimer::new("rbd_disconnect");
        let conf = device_info.conf_path.as_deref();

        let result = async {
            if device_info.device_type == DeviceType::Block {
                match self.find_root_device(conf).await? {
                    Some(device) => {
                        let mut args = vec!["unmap".to_string(), device.clone()];
                        args.extend(self.rbd_args(conf)?);
                        self.rbd(&args).await?;
                        info!(device = %device, "Unmapped RBD volume");
                    }
                    None => info!(name = %self.props.name, "RBD volume is not mapped"),
                }
            }

            if let Some(conf) = conf {
                remove_conf(conf);
            }
            Ok(())
        }
        .await;
        timer.finish(result)
    }

    #[instrument(skip(self))]
    async fn extend_volume(&self) -> Result<u64> {
        let timer = OperationTimer::new("rbd_extend");
        let result = if self.props.do_local_attach {
            self.local_size().await
        } else {
            self.remote_size().await
        };
        timer.finish(result)
    }

    fn device_path(&self) -> String {
        if self.props.do_local_attach {
            self.mapped_path()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            self.props.name.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_showmapped_array() {
        let output = r#"[{"id":"0","pool":"volumes","namespace":"","name":"volume-1","snap":"-","device":"/dev/rbd0"},
                         {"id":"1","pool":"images","namespace":"","name":"volume-1","snap":"-","device":"/dev/rbd1"}]"#;
        let mapped = parse_showmapped(output).unwrap();
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped[0].pool.as_deref(), Some("volumes"));
        assert_eq!(mapped[1].device, "/dev/rbd1");
    }

    #[test]
    fn test_parse_showmapped_object() {
        let output = r#"{"0": {"pool": "volumes", "name": "volume-1", "snap": "-", "device": "/dev/rbd0"}}"#;
        let mapped = parse_showmapped(output).unwrap();
        assert_eq!(
            mapped,
            vec![MappedDevice {
                pool: Some("volumes".into()),
                name: "volume-1".into(),
                device: "/dev/rbd0".into(),
            }]
        );
    }

    #[test]
    fn test_parse_showmapped_empty_and_invalid() {
        assert!(parse_showmapped("[]").unwrap().is_empty());
        assert!(parse_showmapped("{}").unwrap().is_empty());
        assert!(parse_showmapped("\"nope\"").is_err());
        assert!(parse_showmapped("rbd: not json").is_err());
    }

    #[test]
    fn test_rbd_args() {
        let props = RbdProperties {
            name: "volumes/volume-1".into(),
            hosts: vec!["10.0.0.1".into()],
            ports: vec!["6789".into()],
            auth_username: "cinder".into(),
            ..Default::default()
        };
        let connector = RbdConnector::new(props, ConnectorContext::default());
        assert_eq!(
            connector.rbd_args(None).unwrap(),
            vec!["--id", "cinder", "--mon_host", "10.0.0.1:6789"]
        );
        assert_eq!(
            connector.rbd_args(Some(Path::new("/tmp/brickrbd_x"))).unwrap(),
            vec!["--conf", "/tmp/brickrbd_x", "--id", "cinder", "--mon_host", "10.0.0.1:6789"]
        );
    }

    #[test]
    fn test_device_path() {
        let mut props = RbdProperties {
            name: "volumes/volume-1".into(),
            ..Default::default()
        };
        let remote = RbdConnector::new(props.clone(), ConnectorContext::default());
        assert_eq!(remote.device_path(), "volumes/volume-1");

        props.do_local_attach = true;
        let local = RbdConnector::new(props, ConnectorContext::default());
        assert_eq!(local.device_path(), "/dev/rbd/volumes/volume-1");
    }

    #[tokio::test]
    async fn test_remote_attach_requires_binding() {
        let props = RbdProperties {
            name: "volumes/volume-1".into(),
            ..Default::default()
        };
        let connector = RbdConnector::new(props, ConnectorContext::default());
        assert!(matches!(
            connector.connect_volume().await,
            Err(ConnectorError::InvalidConfig(_))
        ));
    }
}
