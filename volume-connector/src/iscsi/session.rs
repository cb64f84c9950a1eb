//! Parsers for `iscsiadm -m session` and `iscsiadm -m session -P 3` output.
//!
//! Both formats are free text meant for humans. The parsers are strict about
//! the fields they index into and report a [`ConnectorError::Parse`] rather
//! than guessing when a line does not have the expected shape.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{ConnectorError, Result};

/// One live iSCSI session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub transport: String,
    pub session_id: u32,
    /// "ip:port"
    pub target_portal: String,
    pub portal_group_tag: u32,
    pub iqn: String,
    /// Suffix of the IQN after its last ':'
    pub node_type: String,
}

/// A kernel block device bound to a session/LUN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedDevice {
    pub target_iqn: String,
    pub current_portal: String,
    pub host_id: u32,
    pub host_lun_id: u32,
    /// e.g. "sda"; empty when the LUN is enumerated but no disk is attached
    pub device_name: String,
}

/// Per-target section of `-P 3` output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionTarget {
    pub iqn: String,
    pub current_portal: String,
    pub persistent_portal: String,
    pub sections: Vec<SessionSection>,
}

/// A labelled sub-block inside a target, e.g. "Attached SCSI devices:".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSection {
    pub header: String,
    pub body: Vec<String>,
}

const ATTACHED_DEVICES_HEADER: &str = "Attached SCSI devices:";

static CHANNEL_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Channel (\d+) Id (\d+) Lun: (\d+)").expect("Invalid regex pattern")
});

fn parse_error(what: &'static str, line: &str) -> ConnectorError {
    ConnectorError::Parse {
        what,
        detail: format!("unexpected line '{}'", line),
    }
}

/// Parse `iscsiadm -m session` output.
///
/// Lines with fewer than four fields are skipped; a line with enough fields
/// but a malformed id or portal aborts the parse.
pub fn parse_sessions(output: &str) -> Result<Vec<Session>> {
    let mut sessions = Vec::new();

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }

        let transport = fields[0]
            .split(':')
            .next()
            .unwrap_or_default()
            .to_string();

        let id = fields[1].trim_start_matches('[').trim_end_matches(']');
        let session_id = id
            .parse::<u32>()
            .map_err(|_| parse_error("iscsi session id", line))?;

        let (portal, tag) = fields[2]
            .split_once(',')
            .ok_or_else(|| parse_error("iscsi session portal", line))?;
        let portal_group_tag = tag
            .parse::<u32>()
            .map_err(|_| parse_error("iscsi portal group tag", line))?;

        let iqn = fields[3].to_string();
        let node_type = iqn
            .rsplit_once(':')
            .map(|(_, suffix)| suffix.to_string())
            .unwrap_or_default();

        sessions.push(Session {
            transport,
            session_id,
            target_portal: portal.to_string(),
            portal_group_tag,
            iqn,
            node_type,
        });
    }

    Ok(sessions)
}

fn standardize_spaces(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse `iscsiadm -m session -P 3` output into per-target blocks.
pub fn parse_session_report(output: &str) -> Result<Vec<SessionTarget>> {
    let mut targets = Vec::new();
    let mut lines: Vec<String> = Vec::new();
    let mut in_target = false;

    for raw in output.lines() {
        let line = standardize_spaces(raw);

        if line.starts_with("Target:") {
            if in_target && !lines.is_empty() {
                targets.push(parse_target_block(&lines)?);
            }
            lines.clear();
            in_target = true;
        }

        // Preamble before the first target (versions, transport class) is dropped
        if in_target {
            lines.push(line);
        }
    }

    if in_target && !lines.is_empty() {
        targets.push(parse_target_block(&lines)?);
    }

    Ok(targets)
}

fn portal_field(line: &str, what: &'static str) -> Result<String> {
    let fields: Vec<&str> = line.split(' ').collect();
    if fields.len() != 3 {
        return Err(parse_error(what, line));
    }
    // "ip:port,tag"
    let portal = fields[2].split(',').next().unwrap_or_default();
    Ok(portal.to_string())
}

fn parse_target_block(lines: &[String]) -> Result<SessionTarget> {
    let mut target = SessionTarget::default();
    let mut current = SessionSection::default();

    for (i, line) in lines.iter().enumerate() {
        if line.starts_with("Target:") {
            let fields: Vec<&str> = line.split(' ').collect();
            if fields.len() < 2 || fields.len() > 3 {
                return Err(parse_error("iscsi target line", line));
            }
            target.iqn = fields[1].to_string();
        } else if line.starts_with("Current Portal:") {
            target.current_portal = portal_field(line, "iscsi current portal")?;
        } else if line.starts_with("Persistent Portal:") {
            target.persistent_portal = portal_field(line, "iscsi persistent portal")?;
        }

        // A run of '*' repeated two lines later frames a section header
        if line.contains('*') && i + 2 < lines.len() && lines[i] == lines[i + 2] {
            if !current.header.is_empty() || !current.body.is_empty() {
                target.sections.push(std::mem::take(&mut current));
            }
            current.header = lines[i + 1].trim().to_string();
        }

        current.body.push(line.clone());
    }

    if !current.header.is_empty() || !current.body.is_empty() {
        target.sections.push(current);
    }

    Ok(target)
}

/// LUN number from a line like `scsi1 Channel 00 Id 0 Lun: 1`.
pub fn parse_host_lun_id(line: &str) -> Result<u32> {
    let caps = CHANNEL_LINE
        .captures(line)
        .ok_or_else(|| parse_error("scsi channel line", line))?;
    caps[3]
        .parse::<u32>()
        .map_err(|_| parse_error("scsi host lun id", line))
}

/// Parse the body of an "Attached SCSI devices:" section.
///
/// Every `Channel .. Lun:` line yields one record; it carries a device name
/// only when the next line is an `Attached scsi disk` line.
pub fn parse_attached_section(
    body: &[String],
    iqn: &str,
    current_portal: &str,
) -> Result<Vec<AttachedDevice>> {
    let mut devices = Vec::new();
    let mut host_id = 0;

    for (i, line) in body.iter().enumerate() {
        if line.starts_with("Host Number") {
            let fields: Vec<&str> = line.split(' ').collect();
            if fields.len() < 3 {
                return Err(parse_error("scsi host number", line));
            }
            host_id = fields[2]
                .parse::<u32>()
                .map_err(|_| parse_error("scsi host number", line))?;
            continue;
        }

        if !line.contains("Channel") || !line.contains("Lun:") {
            continue;
        }

        let host_lun_id = parse_host_lun_id(line)?;
        let device_name = match body.get(i + 1) {
            Some(next) if next.contains("Attached scsi disk") => {
                let fields: Vec<&str> = next.split(' ').collect();
                if fields.len() < 4 {
                    return Err(parse_error("attached scsi disk", next));
                }
                fields[3].to_string()
            }
            _ => String::new(),
        };

        devices.push(AttachedDevice {
            target_iqn: iqn.to_string(),
            current_portal: current_portal.to_string(),
            host_id,
            host_lun_id,
            device_name,
        });
    }

    Ok(devices)
}

/// All devices with an attached disk across every target in the report.
pub fn attached_devices(targets: &[SessionTarget]) -> Result<Vec<AttachedDevice>> {
    let mut devices = Vec::new();

    for target in targets {
        for section in &target.sections {
            if section.header != ATTACHED_DEVICES_HEADER {
                continue;
            }
            let parsed = parse_attached_section(&section.body, &target.iqn, &target.current_portal)?;
            devices.extend(parsed.into_iter().filter(|d| !d.device_name.is_empty()));
        }
    }

    Ok(devices)
}
