//! Host-side block volume connectors.
//!
//! A [`Connector`] attaches a remote or local volume to the host's device
//! tree, reports its kernel path and size, and detaches it again. Connectors
//! exist for iSCSI (with multipath), Ceph RBD and local LVM volumes and are
//! built by [`new_connector`] from a protocol name and JSON properties.

pub mod config;
pub mod connector;
pub mod error;
pub mod exec;
pub mod iscsi;
pub mod local;
pub mod metrics;
pub mod rbd;
pub mod types;

pub use config::{ConnectorConfig, ConnectorContext, HostLayout, PollPolicy};
pub use connector::{Connector, check_valid_device, new_connector};
pub use error::{ConnectorError, Result};
pub use exec::{CommandExecutor, Executor};
pub use types::{DeviceInfo, DeviceType, Protocol, Target};
