//! Typed connection properties and connector results.
//!
//! Connection properties arrive as loosely-typed JSON from the control plane.
//! Each protocol gets its own struct with every field defaulted, so an unset
//! key simply takes its zero value.

use std::fmt::{self, Display};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ConnectorError;

// ============================================================================
// Protocol
// ============================================================================

/// Storage protocol a connector speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Rbd,
    Iscsi,
    Local,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Rbd => write!(f, "rbd"),
            Protocol::Iscsi => write!(f, "iscsi"),
            Protocol::Local => write!(f, "local"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "RBD" => Ok(Protocol::Rbd),
            "ISCSI" => Ok(Protocol::Iscsi),
            "LOCAL" => Ok(Protocol::Local),
            _ => Err(ConnectorError::UnsupportedProtocol(s.to_string())),
        }
    }
}

// ============================================================================
// DeviceInfo
// ============================================================================

/// Kind of attachment returned by a connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Kernel block device
    #[default]
    Block,
    /// In-process RBD image handle (no kernel device)
    Rbd,
}

impl Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Block => write!(f, "block"),
            DeviceType::Rbd => write!(f, "rbd"),
        }
    }
}

/// Result of a successful connect, and the input to disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub path: String,
    #[serde(rename = "type", default)]
    pub device_type: DeviceType,
    /// Ephemeral Ceph conf created for this attachment
    #[serde(rename = "conf", default, skip_serializing_if = "Option::is_none")]
    pub conf_path: Option<PathBuf>,
}

impl DeviceInfo {
    pub fn block(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            device_type: DeviceType::Block,
            conf_path: None,
        }
    }

    pub fn with_conf(mut self, conf: Option<PathBuf>) -> Self {
        self.conf_path = conf;
        self
    }
}

// ============================================================================
// iSCSI
// ============================================================================

/// One reachable iSCSI endpoint for a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// "host:port"
    pub portal: String,
    pub iqn: String,
    pub lun: u32,
}

impl Target {
    pub fn new(portal: impl Into<String>, iqn: impl Into<String>, lun: u32) -> Self {
        Self {
            portal: portal.into(),
            iqn: iqn.into(),
            lun,
        }
    }

    /// udev's stable name for this LUN under `/dev/disk/by-path`.
    pub fn by_path_name(&self) -> String {
        format!("ip-{}-iscsi-{}-lun-{}", self.portal, self.iqn, self.lun)
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} lun {}", self.portal, self.iqn, self.lun)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IscsiProperties {
    pub target_discovered: bool,
    pub target_portal: String,
    pub target_portals: Vec<String>,
    pub target_iqn: String,
    pub target_iqns: Vec<String>,
    pub target_lun: u32,
    pub target_luns: Vec<u32>,
    pub auth_method: String,
    pub auth_username: String,
    pub auth_password: String,
    pub volume_id: String,
    pub qos_specs: String,
    pub access_mode: String,
    pub encrypted: bool,
}

impl IscsiProperties {
    /// Targets from the explicit portal/IQN lists, if both were supplied.
    pub fn explicit_targets(&self) -> Result<Option<Vec<Target>>, ConnectorError> {
        if self.target_portals.is_empty() || self.target_iqns.is_empty() {
            return Ok(None);
        }
        if self.target_portals.len() != self.target_iqns.len() {
            return Err(ConnectorError::InvalidConfig(format!(
                "target_portals has {} entries but target_iqns has {}",
                self.target_portals.len(),
                self.target_iqns.len()
            )));
        }

        let per_target_luns = self.target_luns.len() == self.target_portals.len();
        let targets = self
            .target_portals
            .iter()
            .zip(&self.target_iqns)
            .enumerate()
            .map(|(i, (portal, iqn))| {
                let lun = if per_target_luns {
                    self.target_luns[i]
                } else {
                    self.target_lun
                };
                Target::new(portal.clone(), iqn.clone(), lun)
            })
            .collect();
        Ok(Some(targets))
    }

    /// The single portal/IQN/LUN triple.
    pub fn single_target(&self) -> Result<Target, ConnectorError> {
        if self.target_portal.is_empty() || self.target_iqn.is_empty() {
            return Err(ConnectorError::InvalidConfig(
                "target_portal and target_iqn are required".to_string(),
            ));
        }
        Ok(Target::new(
            self.target_portal.clone(),
            self.target_iqn.clone(),
            self.target_lun,
        ))
    }
}

// ============================================================================
// RBD
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RbdProperties {
    /// "pool/image"
    pub name: String,
    #[serde(deserialize_with = "string_list")]
    pub hosts: Vec<String>,
    #[serde(deserialize_with = "string_list")]
    pub ports: Vec<String>,
    pub cluster_name: String,
    pub auth_enabled: bool,
    pub auth_username: String,
    pub keyring: String,
    pub volume_id: String,
    pub discard: bool,
    pub qos_specs: String,
    pub access_mode: String,
    pub encrypted: bool,
    pub do_local_attach: bool,
}

impl RbdProperties {
    /// Split `name` into `(pool, image)`.
    pub fn pool_and_image(&self) -> Result<(&str, &str), ConnectorError> {
        match self.name.split_once('/') {
            Some((pool, image)) if !pool.is_empty() && !image.is_empty() => Ok((pool, image)),
            _ => Err(ConnectorError::InvalidConfig(format!(
                "rbd name '{}' must be of the form 'pool/image'",
                self.name
            ))),
        }
    }

    /// Cluster name, defaulting to "ceph".
    pub fn cluster(&self) -> &str {
        if self.cluster_name.is_empty() {
            "ceph"
        } else {
            &self.cluster_name
        }
    }
}

// ============================================================================
// Local
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LocalProperties {
    pub volume_id: String,
}

/// Accept a list whose entries are strings or numbers (monitor ports are
/// often sent as integers).
fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Item {
        Str(String),
        Num(serde_json::Number),
    }

    let items = Option::<Vec<Item>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(items
        .into_iter()
        .map(|item| match item {
            Item::Str(s) => s,
            Item::Num(n) => n.to_string(),
        })
        .collect())
}
