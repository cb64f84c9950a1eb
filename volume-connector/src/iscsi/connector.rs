//! iSCSI volume connector: single-path and multipath attach, teardown and
//! resize.

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::iscsiadm::{ChapAuth, IscsiAdm};
use super::multipath::find_sysfs_multipath_dm;
use super::removal::DeviceRemover;
use super::sysfs;
use crate::config::ConnectorContext;
use crate::connector::Connector;
use crate::error::{ConnectorError, Result};
use crate::metrics::OperationTimer;
use crate::types::{DeviceInfo, IscsiProperties, Protocol, Target};

pub struct IscsiConnector {
    props: IscsiProperties,
    ctx: ConnectorContext,
    adm: IscsiAdm,
}

impl IscsiConnector {
    pub fn new(props: IscsiProperties, ctx: ConnectorContext) -> Self {
        let adm = IscsiAdm::new(ctx.executor.clone());
        Self { props, ctx, adm }
    }

    fn auth(&self) -> ChapAuth {
        ChapAuth {
            method: self.props.auth_method.clone(),
            username: self.props.auth_username.clone(),
            password: self.props.auth_password.clone(),
        }
    }

    /// Targets known from the properties alone, without discovery.
    fn configured_targets(&self) -> Result<Vec<Target>> {
        match self.props.explicit_targets()? {
            Some(targets) => Ok(targets),
            None => Ok(vec![self.props.single_target()?]),
        }
    }

    /// Explicit portal/IQN pairs, or SendTargets discovery on the single
    /// portal falling back to the configured triple.
    pub async fn targets(&self) -> Result<Vec<Target>> {
        if let Some(targets) = self.props.explicit_targets()? {
            return Ok(targets);
        }

        let single = self.props.single_target()?;
        if self.props.target_discovered {
            return Ok(vec![single]);
        }

        match self.adm.discover(&single.portal, &single.iqn, single.lun).await {
            Ok(found) if !found.is_empty() => Ok(found),
            Ok(_) => {
                debug!(portal = %single.portal, "Discovery returned no matching targets");
                Ok(vec![single])
            }
            Err(e) => {
                warn!(portal = %single.portal, error = %e, "iSCSI discovery failed, using configured target");
                Ok(vec![single])
            }
        }
    }

    /// Session id of the live session for `target`.
    async fn session_id(&self, target: &Target) -> Result<u32> {
        self.adm
            .sessions()
            .await?
            .into_iter()
            .find(|s| s.target_portal == target.portal && s.iqn == target.iqn)
            .map(|s| s.session_id)
            .ok_or_else(|| ConnectorError::DeviceNotFound(format!("no iSCSI session for {}", target)))
    }

    /// Rescan the SCSI host and wait for the kernel to create the block
    /// device of `target`.
    async fn discover_device(&self, target: &Target) -> Result<String> {
        let layout = self.ctx.layout();
        let session_id = self.session_id(target).await?;
        let hctl = sysfs::hctl(layout, session_id, target.lun)?;
        sysfs::scan(layout, &hctl)?;

        let policy = self.ctx.config.device_wait;
        for attempt in 0..policy.attempts {
            if let Some(name) = sysfs::device_name(layout, session_id, &hctl)? {
                info!(target = %target, hctl = %hctl, device = %name, "Found iSCSI block device");
                return Ok(name);
            }
            debug!(hctl = %hctl, attempt, "Waiting for block device");
            tokio::time::sleep(policy.interval).await;
        }

        Err(ConnectorError::DeviceNotFound(format!(
            "no block device for {} at {}",
            target, hctl
        )))
    }

    async fn connect_single_path(&self, target: &Target) -> Result<String> {
        self.adm.connect_target(target, &self.auth()).await?;
        let device = self.discover_device(target).await?;

        let layout = self.ctx.layout();
        let by_path = layout.dev("disk/by-path").join(target.by_path_name());
        let policy = self.ctx.config.device_wait;
        for _ in 0..policy.attempts {
            if by_path.exists() {
                return Ok(by_path.to_string_lossy().into_owned());
            }
            tokio::time::sleep(policy.interval).await;
        }

        warn!(link = %by_path.display(), device = %device, "by-path link did not appear, using kernel device");
        Ok(layout.block_device(&device).to_string_lossy().into_owned())
    }

    async fn connect_multipath(&self, targets: &[Target]) -> Result<String> {
        let auth = self.auth();
        let mut logins = JoinSet::new();
        for (slot, target) in targets.iter().cloned().enumerate() {
            let adm = self.adm.clone();
            let auth = auth.clone();
            logins.spawn(async move { (slot, adm.connect_target(&target, &auth).await) });
        }

        let mut results: Vec<Option<Result<()>>> = targets.iter().map(|_| None).collect();
        while let Some(joined) = logins.join_next().await {
            let (slot, result) = joined?;
            results[slot] = Some(result);
        }

        // Fail fast: any failed path fails the whole attach
        for (target, result) in targets.iter().zip(results) {
            if let Some(Err(e)) = result {
                warn!(target = %target, error = %e, "Multipath login failed");
                return Err(e);
            }
        }

        let mut devices = Vec::with_capacity(targets.len());
        for target in targets {
            devices.push(self.discover_device(target).await?);
        }

        let layout = self.ctx.layout();
        let policy = self.ctx.config.device_wait;
        for attempt in 0..policy.attempts {
            for device in &devices {
                match find_sysfs_multipath_dm(layout, device) {
                    Ok(Some(dm)) => {
                        info!(dm = %dm, paths = ?devices, "Found multipath device");
                        return Ok(layout.block_device(&dm).to_string_lossy().into_owned());
                    }
                    Ok(None) => {}
                    Err(e) => warn!(device = %device, error = %e, "Failed to resolve multipath device"),
                }
            }
            debug!(attempt, "Waiting for multipath device");
            tokio::time::sleep(policy.interval).await;
        }

        Err(ConnectorError::DeviceNotFound(format!(
            "no multipath device holds {}",
            devices.join(", ")
        )))
    }

    /// Kernel device names currently bound to `targets`.
    async fn connection_devices(&self, targets: &[Target]) -> Result<Vec<String>> {
        let layout = self.ctx.layout();
        let sessions = self.adm.sessions().await?;
        let mut devices = Vec::new();

        for target in targets {
            let matching = sessions
                .iter()
                .filter(|s| s.target_portal == target.portal && s.iqn == target.iqn);
            for session in matching {
                let hctl = match sysfs::hctl(layout, session.session_id, target.lun) {
                    Ok(hctl) => hctl,
                    Err(e) => {
                        debug!(session = session.session_id, error = %e, "No SCSI address for session");
                        continue;
                    }
                };
                if let Some(name) = sysfs::device_name(layout, session.session_id, &hctl)? {
                    devices.push(name);
                }
            }
        }

        Ok(devices)
    }

    async fn cleanup_connection(&self) -> Result<()> {
        let targets = self.targets().await?;
        let devices = self.connection_devices(&targets).await?;
        let is_multipath = devices.len() > 1;

        if devices.is_empty() {
            info!("No attached devices for iSCSI targets");
        } else {
            let remover = DeviceRemover::new(
                self.ctx.executor.as_ref(),
                self.ctx.layout(),
                self.ctx.config.removal,
            );
            remover.remove_connection(&devices, is_multipath).await?;
        }

        let attached = self.adm.attached_devices().await?;
        if !attached.is_empty() {
            info!(
                attached = attached.len(),
                "Other iSCSI devices still attached, keeping sessions"
            );
            return Ok(());
        }

        for target in &targets {
            self.adm.disconnect_target(target).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for IscsiConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Iscsi
    }

    #[instrument(skip(self))]
    async fn connect_volume(&self) -> Result<DeviceInfo> {
        let timer = OperationTimer::new("iscsi_connect");
        let result = async {
            let targets = self.targets().await?;
            let path = match targets.as_slice() {
                [] => return Err(ConnectorError::InvalidConfig("no iSCSI targets".to_string())),
                [target] => self.connect_single_path(target).await?,
                _ => self.connect_multipath(&targets).await?,
            };
            info!(path = %path, "Connected iSCSI volume");
            Ok(DeviceInfo::block(path))
        }
        .await;
        timer.finish(result)
    }

    #[instrument(skip(self))]
    async fn disconnect_volume(&self, device_info: &DeviceInfo) -> Result<()> {
        let timer = OperationTimer::new("iscsi_disconnect");
        info!(path = %device_info.path, "Disconnecting iSCSI volume");
        timer.finish(self.cleanup_connection().await)
    }

    #[instrument(skip(self))]
    async fn extend_volume(&self) -> Result<u64> {
        let timer = OperationTimer::new("iscsi_extend");
        let result = async {
            let layout = self.ctx.layout();
            let targets = self.targets().await?;
            let devices = self.connection_devices(&targets).await?;
            let first = devices
                .first()
                .ok_or_else(|| ConnectorError::DeviceNotFound("no attached iSCSI device".to_string()))?;

            for device in &devices {
                sysfs::write_attr(&layout.sys(format!("block/{}/device/rescan", device)), "1")?;
            }

            let mut sized = first.clone();
            for device in &devices {
                if let Ok(Some(dm)) = find_sysfs_multipath_dm(layout, device) {
                    sized = dm;
                    break;
                }
            }

            let size = sysfs::block_size_bytes(layout, &sized)?;
            info!(device = %sized, size, "Rescanned iSCSI volume");
            Ok(size)
        }
        .await;
        timer.finish(result)
    }

    fn device_path(&self) -> String {
        match self.configured_targets() {
            Ok(targets) => targets
                .first()
                .map(|t| {
                    self.ctx
                        .layout()
                        .dev("disk/by-path")
                        .join(t.by_path_name())
                        .to_string_lossy()
                        .into_owned()
                })
                .unwrap_or_default(),
            Err(_) => String::new(),
        }
    }
}
