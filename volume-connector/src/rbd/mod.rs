//! Ceph RBD volumes.

pub mod client;
pub mod config;
pub mod connector;

pub use client::{CephCluster, CephIoContext, RbdImage, RbdVolumeIo};
pub use config::{CephArtifacts, CephConf};
pub use connector::RbdConnector;
