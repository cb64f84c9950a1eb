//! iSCSI attachment through open-iscsi, sysfs and device-mapper multipath.

pub mod connector;
pub mod iscsiadm;
pub mod multipath;
pub mod removal;
pub mod session;
pub mod sysfs;

pub use connector::IscsiConnector;
pub use iscsiadm::{ChapAuth, IscsiAdm};
pub use removal::DeviceRemover;
pub use session::{AttachedDevice, Session};
pub use sysfs::Hctl;
