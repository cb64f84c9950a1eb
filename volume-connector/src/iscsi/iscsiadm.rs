//! Thin client over the open-iscsi administrative tool.
//!
//! Each method maps to one `iscsiadm` invocation. Outputs that mean "nothing
//! to do" (an existing session on login, no session on logout, no sessions at
//! all) are turned into success here so callers never inspect tool text.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::session::{AttachedDevice, Session, attached_devices, parse_session_report, parse_sessions};
use crate::error::{ConnectorError, Result};
use crate::exec::Executor;
use crate::types::Target;

const ISCSIADM: &str = "iscsiadm";

/// iscsiadm exit status for "no records/sessions found"
const EXIT_NO_OBJS_FOUND: i32 = 21;

/// CHAP credentials applied to a node record before login.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChapAuth {
    pub method: String,
    pub username: String,
    pub password: String,
}

impl ChapAuth {
    pub fn is_set(&self) -> bool {
        !self.method.is_empty()
    }
}

fn is_no_objects(err: &ConnectorError) -> bool {
    match err {
        ConnectorError::CommandFailed { status, output, .. } => {
            *status == Some(EXIT_NO_OBJS_FOUND)
                || output.contains("No active sessions")
                || output.contains("No matching sessions")
        }
        _ => false,
    }
}

/// Parse `iscsiadm -m discovery -t sendtargets` output.
///
/// Lines look like `10.0.0.1:3260,1 iqn.2020-01.com.example:vol1`; only
/// records whose IQN contains `iqn_filter` are kept.
pub fn parse_discovery(output: &str, iqn_filter: &str, lun: u32) -> Vec<Target> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let portal = fields.next()?.split(',').next()?;
            let iqn = fields.next()?;
            if portal.is_empty() || !iqn.contains(iqn_filter) {
                return None;
            }
            Some(Target::new(portal, iqn, lun))
        })
        .collect()
}

#[derive(Clone)]
pub struct IscsiAdm {
    executor: Arc<dyn Executor>,
}

impl IscsiAdm {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        self.executor.execute(ISCSIADM, args).await
    }

    async fn node(&self, target: &Target, extra: &[&str]) -> Result<String> {
        let mut args = vec!["-m", "node", "-T", target.iqn.as_str(), "-p", target.portal.as_str()];
        args.extend_from_slice(extra);
        self.run(&args).await
    }

    /// SendTargets discovery against `portal`, filtered by `iqn_filter`.
    #[instrument(skip(self))]
    pub async fn discover(&self, portal: &str, iqn_filter: &str, lun: u32) -> Result<Vec<Target>> {
        let output = self
            .run(&["-m", "discovery", "-t", "sendtargets", "-p", portal])
            .await?;
        let targets = parse_discovery(&output, iqn_filter, lun);
        debug!(portal = %portal, count = targets.len(), "Discovered iSCSI targets");
        Ok(targets)
    }

    /// All live sessions; an empty list when none exist.
    pub async fn sessions(&self) -> Result<Vec<Session>> {
        match self.run(&["-m", "session"]).await {
            Ok(output) => parse_sessions(&output),
            Err(e) if is_no_objects(&e) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Devices with an attached disk according to `-m session -P 3`.
    pub async fn attached_devices(&self) -> Result<Vec<AttachedDevice>> {
        match self.run(&["-m", "session", "-P", "3"]).await {
            Ok(output) => attached_devices(&parse_session_report(&output)?),
            Err(e) if is_no_objects(&e) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Make sure a node record exists for `target`, creating one if needed.
    pub async fn ensure_node(&self, target: &Target) -> Result<()> {
        if self.node(target, &[]).await.is_ok() {
            return Ok(());
        }
        debug!(portal = %target.portal, iqn = %target.iqn, "Creating iSCSI node record");
        self.node(target, &["--interface", "default", "--op", "new"]).await?;
        Ok(())
    }

    pub async fn update(&self, target: &Target, key: &str, value: &str) -> Result<()> {
        self.node(target, &["--op", "update", "-n", key, "-v", value]).await?;
        Ok(())
    }

    pub async fn login(&self, target: &Target) -> Result<()> {
        match self.node(target, &["--login"]).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let output = e.command_output().unwrap_or_default();
                if output.contains("already present") || output.contains("session already exists") {
                    info!(portal = %target.portal, iqn = %target.iqn, "iSCSI session already exists");
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    pub async fn logout(&self, target: &Target) -> Result<()> {
        match self.node(target, &["--logout"]).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let output = e.command_output().unwrap_or_default();
                if output.contains("No matching sessions") || output.contains("not logged in") {
                    info!(portal = %target.portal, iqn = %target.iqn, "iSCSI target already logged out");
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    pub async fn delete_node(&self, target: &Target) -> Result<()> {
        match self.node(target, &["--op", "delete"]).await {
            Ok(_) => Ok(()),
            Err(e) if is_no_objects(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Full login sequence: node record, optional CHAP, login, automatic startup.
    #[instrument(skip(self, auth), fields(portal = %target.portal, iqn = %target.iqn))]
    pub async fn connect_target(&self, target: &Target, auth: &ChapAuth) -> Result<()> {
        self.ensure_node(target).await?;

        if auth.is_set() {
            self.update(target, "node.session.auth.authmethod", &auth.method).await?;
            self.update(target, "node.session.auth.username", &auth.username).await?;
            self.update(target, "node.session.auth.password", &auth.password).await?;
        }

        self.login(target).await?;
        self.update(target, "node.startup", "automatic").await?;

        info!(portal = %target.portal, iqn = %target.iqn, "Logged in to iSCSI target");
        Ok(())
    }

    /// Full logout sequence: manual startup, logout, delete the node record.
    #[instrument(skip(self), fields(portal = %target.portal, iqn = %target.iqn))]
    pub async fn disconnect_target(&self, target: &Target) -> Result<()> {
        if let Err(e) = self.update(target, "node.startup", "manual").await {
            // The record may already be gone
            warn!(error = %e, "Failed to set node.startup to manual");
        }
        self.logout(target).await?;
        self.delete_node(target).await?;

        info!(portal = %target.portal, iqn = %target.iqn, "Logged out of iSCSI target");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_discovery_filters_by_iqn() {
        let output = "10.0.0.1:3260,1 iqn.2020-01.com.example:vol1\n\
                      10.0.0.2:3260,2 iqn.2020-01.com.example:vol1\n\
                      10.0.0.1:3260,1 iqn.2020-01.com.example:other\n\
                      garbage\n";
        let targets = parse_discovery(output, "vol1", 3);
        assert_eq!(
            targets,
            vec![
                Target::new("10.0.0.1:3260", "iqn.2020-01.com.example:vol1", 3),
                Target::new("10.0.0.2:3260", "iqn.2020-01.com.example:vol1", 3),
            ]
        );
    }

    #[test]
    fn test_parse_discovery_ipv6_portal() {
        let output = "[fd00::1]:3260,1 iqn.2020-01.com.example:vol1\n";
        let targets = parse_discovery(output, "iqn.2020-01.com.example:vol1", 0);
        assert_eq!(targets[0].portal, "[fd00::1]:3260");
    }

    #[test]
    fn test_is_no_objects() {
        let err = ConnectorError::CommandFailed {
            program: ISCSIADM.to_string(),
            args: vec![],
            status: Some(21),
            output: String::new(),
        };
        assert!(is_no_objects(&err));
        assert!(!is_no_objects(&ConnectorError::InvalidConfig("x".into())));
    }

    #[test]
    fn test_chap_auth_is_set() {
        assert!(!ChapAuth::default().is_set());
        let auth = ChapAuth {
            method: "CHAP".into(),
            ..Default::default()
        };
        assert!(auth.is_set());
    }
}
