//! Ceph client boundary and a seekable stream over an RBD image.
//!
//! The library binding itself (librados/librbd) is supplied by the embedding
//! process through [`CephCluster`]; calls are blocking and are driven from
//! `spawn_blocking` by the connector.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::Result;

/// Entry point into a Ceph cluster.
pub trait CephCluster: Send + Sync {
    /// Connect as `user` and open an IO context on `pool`. Without
    /// `conf_path` the client's default configuration is used.
    fn connect(
        &self,
        user: &str,
        pool: &str,
        conf_path: Option<&Path>,
        cluster: &str,
    ) -> Result<Box<dyn CephIoContext>>;
}

pub trait CephIoContext: Send {
    fn open_image(&self, image: &str) -> Result<Box<dyn RbdImage>>;
}

/// An open RBD image.
pub trait RbdImage: Send {
    fn size(&self) -> Result<u64>;
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize>;
    fn flush(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// Byte stream over an [`RbdImage`] with a cursor.
///
/// The cursor can never become negative: a seek that would move it below
/// zero panics. The image is closed on drop if [`close`](Self::close) was
/// never called.
pub struct RbdVolumeIo {
    image: Box<dyn RbdImage>,
    pool: String,
    user: String,
    conf: Option<PathBuf>,
    offset: u64,
    closed: bool,
}

impl RbdVolumeIo {
    pub fn new(image: Box<dyn RbdImage>, pool: &str, user: &str, conf: Option<PathBuf>) -> Self {
        Self {
            image,
            pool: pool.to_string(),
            user: user.to_string(),
            conf,
            offset: 0,
            closed: false,
        }
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn conf(&self) -> Option<&Path> {
        self.conf.as_deref()
    }

    pub fn tell(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> Result<u64> {
        self.image.size()
    }

    /// Read up to `buf.len()` bytes at `offset` without moving the cursor.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let size = self.image.size()?;
        if offset >= size {
            return Ok(0);
        }
        let len = buf.len().min((size - offset) as usize);
        self.image.read_at(&mut buf[..len], offset)
    }

    /// Write `buf` at `offset` without moving the cursor.
    pub fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        self.image.write_at(buf, offset)
    }

    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.image.close()
    }
}

impl Drop for RbdVolumeIo {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.image.close() {
            warn!(pool = %self.pool, error = %e, "Failed to close RBD image");
        }
    }
}

impl Read for RbdVolumeIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(buf, self.offset).map_err(io::Error::other)?;
        self.offset += n as u64;
        Ok(n)
    }
}

impl Write for RbdVolumeIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.image.write_at(buf, self.offset).map_err(io::Error::other)?;
        self.offset += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.image.flush().map_err(io::Error::other)
    }
}

impl Seek for RbdVolumeIo {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.offset) + i128::from(delta),
            SeekFrom::End(delta) => {
                let size = self.image.size().map_err(io::Error::other)?;
                i128::from(size) + i128::from(delta)
            }
        };

        if target < 0 {
            panic!("seek to negative offset {} on rbd image", target);
        }
        self.offset = u64::try_from(target).map_err(|_| io::Error::other("seek offset overflow"))?;
        Ok(self.offset)
    }
}
