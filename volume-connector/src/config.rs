//! Runtime configuration shared by all connectors.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::exec::{CommandExecutor, Executor};
use crate::rbd::client::CephCluster;

/// Root directories of the host's kernel and device trees.
///
/// Everything the connectors read or write under `/sys` and `/dev` is
/// resolved through this layout, so the whole tree can be relocated (e.g. to
/// a scratch directory in tests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    pub sys_root: PathBuf,
    pub dev_root: PathBuf,
    pub ceph_conf_dir: PathBuf,
}

impl Default for HostLayout {
    fn default() -> Self {
        Self {
            sys_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
            ceph_conf_dir: PathBuf::from("/etc/ceph"),
        }
    }
}

impl HostLayout {
    /// Layout rooted at `root` (`<root>/sys`, `<root>/dev`, `<root>/etc/ceph`).
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            sys_root: root.join("sys"),
            dev_root: root.join("dev"),
            ceph_conf_dir: root.join("etc/ceph"),
        }
    }

    pub fn sys(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.sys_root.join(rel)
    }

    pub fn dev(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.dev_root.join(rel)
    }

    /// Glob pattern below `/sys`; the root itself is escaped.
    pub fn sys_pattern(&self, rel: &str) -> String {
        format!(
            "{}/{}",
            glob::Pattern::escape(&self.sys_root.to_string_lossy()),
            rel
        )
    }

    /// Glob pattern below `/dev`; the root itself is escaped.
    pub fn dev_pattern(&self, rel: &str) -> String {
        format!(
            "{}/{}",
            glob::Pattern::escape(&self.dev_root.to_string_lossy()),
            rel
        )
    }

    /// Path of a kernel block device such as `sdb` or `dm-0`.
    pub fn block_device(&self, name: &str) -> PathBuf {
        self.dev(name)
    }
}

/// Bounded polling: `attempts` checks spaced `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl PollPolicy {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(1))
    }
}

/// Static configuration of the connector runtime.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub layout: HostLayout,
    /// Directory for ephemeral Ceph keyring/conf files
    pub temp_dir: PathBuf,
    /// Polling bound while waiting for SCSI devices to disappear
    pub removal: PollPolicy,
    /// Polling bound while waiting for devices and links to appear
    pub device_wait: PollPolicy,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            layout: HostLayout::default(),
            temp_dir: std::env::temp_dir(),
            removal: PollPolicy::default(),
            device_wait: PollPolicy::default(),
        }
    }
}

/// Everything a connector needs from its environment.
#[derive(Clone)]
pub struct ConnectorContext {
    pub config: Arc<ConnectorConfig>,
    pub executor: Arc<dyn Executor>,
    /// Ceph client binding used for remote (non-mapped) RBD access
    pub ceph: Option<Arc<dyn CephCluster>>,
}

impl ConnectorContext {
    pub fn new(config: ConnectorConfig, executor: Arc<dyn Executor>) -> Self {
        Self {
            config: Arc::new(config),
            executor,
            ceph: None,
        }
    }

    pub fn with_ceph(mut self, ceph: Arc<dyn CephCluster>) -> Self {
        self.ceph = Some(ceph);
        self
    }

    pub fn layout(&self) -> &HostLayout {
        &self.config.layout
    }
}

impl Default for ConnectorContext {
    fn default() -> Self {
        Self::new(ConnectorConfig::default(), Arc::new(CommandExecutor::new()))
    }
}

impl std::fmt::Debug for ConnectorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorContext")
            .field("config", &self.config)
            .field("ceph", &self.ceph.is_some())
            .finish()
    }
}
