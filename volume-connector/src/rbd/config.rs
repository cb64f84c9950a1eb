//! Ephemeral Ceph keyring and conf files.
//!
//! Files are created with `tempfile` (mode 0600) under the configured temp
//! directory. [`CephArtifacts`] removes them on drop unless ownership is
//! handed over with [`CephArtifacts::keep`].

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tempfile::Builder;
use tracing::{debug, warn};

use crate::config::HostLayout;
use crate::error::{ConnectorError, Result};

const KEYRING_PREFIX: &str = "keyfile-";
const CONF_PREFIX: &str = "brickrbd_";

/// `ip:port,ip:port,...` from parallel host and port lists.
pub fn monitor_hosts(hosts: &[String], ports: &[String]) -> Result<String> {
    if hosts.len() != ports.len() {
        return Err(ConnectorError::InvalidConfig(format!(
            "{} monitor hosts but {} ports",
            hosts.len(),
            ports.len()
        )));
    }
    Ok(hosts
        .iter()
        .zip(ports)
        .map(|(host, port)| format!("{}:{}", host, port))
        .collect::<Vec<_>>()
        .join(","))
}

/// The fields of a generated conf file this crate reads back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CephConf {
    pub mon_host: String,
    pub user: String,
    pub keyring: Option<PathBuf>,
}

impl CephConf {
    pub fn render(&self) -> String {
        let mut out = format!("[global]\nmon_host = {}\n[client.{}]\n", self.mon_host, self.user);
        if let Some(keyring) = &self.keyring {
            out.push_str(&format!("keyring = {}\n", keyring.display()));
        }
        out
    }

    /// Parse an ini-style conf; unknown keys and sections are ignored.
    pub fn parse(contents: &str) -> Self {
        let mut conf = CephConf::default();
        for line in contents.lines().map(str::trim) {
            if let Some(section) = line.strip_prefix("[client.").and_then(|s| s.strip_suffix(']')) {
                conf.user = section.to_string();
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key.trim() {
                "mon_host" | "mon host" => conf.mon_host = value.trim().to_string(),
                "keyring" => conf.keyring = Some(PathBuf::from(value.trim())),
                _ => {}
            }
        }
        conf
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| ConnectorError::io(path, e))?;
        Ok(Self::parse(&contents))
    }
}

fn write_temp(dir: &Path, prefix: &str, contents: &str) -> Result<PathBuf> {
    let mut file = Builder::new()
        .prefix(prefix)
        .tempfile_in(dir)
        .map_err(|e| ConnectorError::io(dir, e))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| ConnectorError::io(file.path(), e))?;
    let (_, path) = file.keep().map_err(|e| ConnectorError::io(dir, e.error))?;
    Ok(path)
}

/// Keyring and conf files for one attachment.
#[derive(Debug, Default)]
pub struct CephArtifacts {
    keyring: Option<PathBuf>,
    conf: Option<PathBuf>,
}

impl CephArtifacts {
    /// Write a keyring holding `key` for `user` and a conf pointing at it.
    /// Nothing is written when `key` is empty.
    pub fn create(temp_dir: &Path, user: &str, mon_hosts: &str, key: &str) -> Result<Self> {
        let mut artifacts = CephArtifacts::default();
        if key.is_empty() {
            return Ok(artifacts);
        }

        let keyring = format!("[client.{}]\nkey = {}\n", user, key.trim());
        artifacts.keyring = Some(write_temp(temp_dir, KEYRING_PREFIX, &keyring)?);

        let conf = CephConf {
            mon_host: mon_hosts.to_string(),
            user: user.to_string(),
            keyring: artifacts.keyring.clone(),
        };
        artifacts.conf = Some(write_temp(temp_dir, CONF_PREFIX, &conf.render())?);

        debug!(conf = ?artifacts.conf, "Created ephemeral Ceph config");
        Ok(artifacts)
    }

    pub fn conf_path(&self) -> Option<&Path> {
        self.conf.as_deref()
    }

    /// Stop tracking the files and return the conf path. The caller becomes
    /// responsible for [`remove_conf`].
    pub fn keep(mut self) -> Option<PathBuf> {
        self.keyring = None;
        self.conf.take()
    }
}

impl Drop for CephArtifacts {
    fn drop(&mut self) {
        for path in [self.conf.take(), self.keyring.take()].into_iter().flatten() {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove ephemeral Ceph file");
            }
        }
    }
}

/// Remove a generated conf file and the keyring it references.
pub fn remove_conf(conf_path: &Path) {
    match CephConf::load(conf_path) {
        Ok(conf) => {
            if let Some(keyring) = conf.keyring
                && let Err(e) = fs::remove_file(&keyring)
            {
                debug!(path = %keyring.display(), error = %e, "Failed to remove keyring");
            }
        }
        Err(e) => debug!(error = %e, "Could not read Ceph conf"),
    }

    if let Err(e) = fs::remove_file(conf_path) {
        warn!(path = %conf_path.display(), error = %e, "Failed to remove Ceph conf");
    }
}

/// `keyring` if non-empty, otherwise the first line of
/// `<ceph_conf_dir>/<cluster>.client.<user>.keyring`, otherwise empty.
pub fn check_or_get_keyring_contents(
    layout: &HostLayout,
    keyring: &str,
    cluster: &str,
    user: &str,
) -> String {
    if !keyring.is_empty() {
        return keyring.to_string();
    }
    if user.is_empty() {
        return String::new();
    }

    let path = layout
        .ceph_conf_dir
        .join(format!("{}.client.{}.keyring", cluster, user));
    let Ok(file) = fs::File::open(&path) else {
        return String::new();
    };

    let mut line = String::new();
    match BufReader::new(file).read_line(&mut line) {
        Ok(_) => line.trim().to_string(),
        Err(_) => String::new(),
    }
}
