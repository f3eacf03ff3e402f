//! The capability a backend filesystem provides to the connector.
//!
//! Backends are addressed purely by path strings relative to their mount
//! point (the mount point itself is the empty path). Every method may
//! block arbitrarily on I/O; the connector never holds a lock across a
//! call into this trait.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::connector::Connector;
use super::{Attr, OpenFlags};

/// A path-addressed backend filesystem.
///
/// Errors are [`std::io::Error`] values carrying raw OS errnos; the
/// connector propagates them to the peer verbatim and never translates
/// one kind into another.
#[async_trait]
pub trait PathFilesystem: Send + Sync + 'static {
    /// Called when the backend is grafted onto the connector tree.
    ///
    /// A failure here aborts the mount; no mount record is attached.
    async fn mount(&self, connector: Arc<Connector>) -> io::Result<()> {
        let _ = connector;
        Ok(())
    }

    /// Called when an unmount is initiated while the subtree is still
    /// referenced; the mount record drains afterwards.
    async fn unmount(&self) {}

    /// Attributes of the object at `path`.
    async fn getattr(&self, path: &str) -> io::Result<Attr>;

    /// Target of the symlink at `path`.
    async fn readlink(&self, path: &str) -> io::Result<Bytes>;

    /// Open the file at `path` and surrender a read handle.
    async fn open(&self, path: &str, flags: OpenFlags) -> io::Result<Box<dyn RawFile>>;

    /// Open the directory at `path` and surrender its stream.
    async fn opendir(&self, path: &str) -> io::Result<Box<dyn RawDir>>;

    /// Create and open the file at `path`.
    async fn create(&self, path: &str, flags: OpenFlags, mode: u32)
    -> io::Result<Box<dyn RawFile>>;

    /// Create a filesystem node at `path`.
    async fn mknod(&self, path: &str, mode: u32, rdev: u32) -> io::Result<()>;

    /// Create a directory at `path`.
    async fn mkdir(&self, path: &str, mode: u32) -> io::Result<()>;

    /// Remove the file at `path`.
    async fn unlink(&self, path: &str) -> io::Result<()>;

    /// Remove the empty directory at `path`.
    async fn rmdir(&self, path: &str) -> io::Result<()>;

    /// Create a symlink at `link_path` pointing at `target`.
    async fn symlink(&self, target: &str, link_path: &str) -> io::Result<()>;

    /// Move `old_path` to `new_path` within this backend.
    async fn rename(&self, old_path: &str, new_path: &str) -> io::Result<()>;

    /// Create a hard link at `new_path` to `old_path`.
    async fn link(&self, old_path: &str, new_path: &str) -> io::Result<()>;

    /// Change permission bits of `path`.
    async fn chmod(&self, path: &str, mode: u32) -> io::Result<()>;

    /// Change ownership of `path`.
    async fn chown(&self, path: &str, uid: u32, gid: u32) -> io::Result<()>;

    /// Truncate `path` to `size` bytes.
    async fn truncate(&self, path: &str, size: u64) -> io::Result<()>;

    /// Set access and modification times of `path`, in nanoseconds since
    /// the epoch.
    async fn utimens(&self, path: &str, atime_ns: u64, mtime_ns: u64) -> io::Result<()>;

    /// Check accessibility of `path` against `mask`.
    async fn access(&self, path: &str, mask: u32) -> io::Result<()>;
}

/// An open file handed back by [`PathFilesystem::open`].
///
/// The connector passes the handle through to the protocol layer, which
/// owns it and calls [`close`](Self::close) on release.
#[async_trait]
pub trait RawFile: Send + Sync {
    /// Read up to `size` bytes starting at byte `offset`.
    async fn read(&self, offset: u64, size: u32) -> io::Result<Bytes>;

    /// Release any resources held by this handle.
    async fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

/// An open directory stream handed back by [`PathFilesystem::opendir`].
///
/// Entry readback happens at a different layer; the connector only
/// tracks the handle for busy accounting.
#[async_trait]
pub trait RawDir: Send + Sync {
    /// Release any resources held by this stream.
    async fn close(&self) -> io::Result<()> {
        Ok(())
    }
}
