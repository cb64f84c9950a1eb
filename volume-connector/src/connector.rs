//! Protocol-independent connector interface and factory.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::config::ConnectorContext;
use crate::error::Result;
use crate::iscsi::IscsiConnector;
use crate::local::LocalConnector;
use crate::rbd::RbdConnector;
use crate::types::{DeviceInfo, Protocol};

/// Attach/detach lifecycle of one volume over one protocol.
#[async_trait]
pub trait Connector: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Attach the volume. An already attached volume is returned as is.
    async fn connect_volume(&self) -> Result<DeviceInfo>;

    /// Detach the volume described by `device_info` (the value returned by
    /// [`Connector::connect_volume`]).
    async fn disconnect_volume(&self, device_info: &DeviceInfo) -> Result<()>;

    /// Current size of the attached volume in bytes.
    async fn extend_volume(&self) -> Result<u64>;

    /// Expected device path, computed without side effects.
    fn device_path(&self) -> String;

    fn check_valid_device(&self, path: &Path, require_readable: bool) -> bool {
        check_valid_device(path, require_readable)
    }
}

/// Whether `path` is usable as a device.
///
/// With `require_readable` the path must open and yield at least one byte of
/// its first line; otherwise it only has to exist. Never fails.
///
/// The read stops at the first newline or after 4 KiB, so a device whose
/// leading bytes hold no newline (a zeroed disk) still counts as readable.
pub fn check_valid_device(path: &Path, require_readable: bool) -> bool {
    if !require_readable {
        return path.exists();
    }

    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Device is not readable");
            return false;
        }
    };

    let mut line = Vec::new();
    match BufReader::new(file.take(4096)).read_until(b'\n', &mut line) {
        Ok(n) => n > 0,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Failed to read from device");
            false
        }
    }
}

/// Connection properties may be wrapped as `{"data": {...}}`; top-level keys
/// other than `data` (e.g. `do_local_attach`) are merged in.
fn unwrap_properties(properties: Value) -> Value {
    match properties {
        Value::Object(mut outer) => match outer.remove("data") {
            Some(Value::Object(mut data)) => {
                for (key, value) in outer {
                    data.entry(key).or_insert(value);
                }
                Value::Object(data)
            }
            Some(other) => {
                outer.insert("data".to_string(), other);
                Value::Object(outer)
            }
            None => Value::Object(outer),
        },
        Value::Null => Value::Object(Default::default()),
        other => other,
    }
}

fn parse_properties<T: DeserializeOwned>(properties: Value) -> Result<T> {
    Ok(serde_json::from_value(unwrap_properties(properties))?)
}

/// Build the connector for `protocol` (case-insensitive).
pub fn new_connector(
    protocol: &str,
    properties: Value,
    ctx: ConnectorContext,
) -> Result<Box<dyn Connector>> {
    let protocol: Protocol = protocol.parse()?;
    debug!(protocol = %protocol, "Creating volume connector");

    let connector: Box<dyn Connector> = match protocol {
        Protocol::Iscsi => Box::new(IscsiConnector::new(parse_properties(properties)?, ctx)),
        Protocol::Rbd => Box::new(RbdConnector::new(parse_properties(properties)?, ctx)),
        Protocol::Local => Box::new(LocalConnector::new(parse_properties(properties)?, ctx)),
    };
    Ok(connector)
}
