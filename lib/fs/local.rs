//! A backend that directly overlays a directory of the host filesystem.

use std::io::{self, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use nix::sys::stat::{Mode, SFlag, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::{AccessFlags, Gid, Uid};
use thiserror::Error;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};

use super::backend::{PathFilesystem, RawDir, RawFile};
use super::{Attr, OpenFlags};

/// Failure to construct a [`LocalFs`].
#[derive(Debug, Error)]
pub enum LocalFsError {
    /// The configured root does not exist or is not a directory.
    #[error("root is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// The root could not be inspected.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A path-addressed backend rooted at a host directory.
///
/// Connector paths are joined onto the root; components that would
/// escape it (absolute paths, `..`) are rejected with `EPERM`.
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    /// A backend overlaying `root`, which must be an existing directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, LocalFsError> {
        let root = root.into();
        let meta = std::fs::metadata(&root)?;
        if !meta.is_dir() {
            return Err(LocalFsError::NotADirectory(root));
        }
        Ok(Self { root })
    }

    fn full_path(&self, rel: &str) -> io::Result<PathBuf> {
        let mut path = self.root.clone();
        for component in Path::new(rel).components() {
            match component {
                Component::Normal(c) => path.push(c),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(io::Error::from_raw_os_error(libc::EPERM));
                }
            }
        }
        Ok(path)
    }
}

#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "nsecs from MetadataExt is always in [0, 999_999_999]"
)]
fn to_systime(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::new(secs.cast_unsigned(), nsecs as u32)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs((-secs).cast_unsigned())
            + Duration::from_nanos(nsecs.cast_unsigned())
    }
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "metadata nlink/rdev/blksize narrowing is intentional"
)]
fn attr_from_metadata(meta: &std::fs::Metadata) -> Attr {
    use std::os::unix::fs::MetadataExt as _;

    Attr {
        ino: meta.ino(),
        size: meta.len(),
        blocks: meta.blocks(),
        atime: to_systime(meta.atime(), meta.atime_nsec()),
        mtime: to_systime(meta.mtime(), meta.mtime_nsec()),
        ctime: to_systime(meta.ctime(), meta.ctime_nsec()),
        mode: meta.mode(),
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
    }
}

#[expect(
    clippy::cast_possible_wrap,
    reason = "times before the year 2262 fit in i64 nanoseconds"
)]
fn timespec_from_ns(ns: u64) -> TimeSpec {
    TimeSpec::new((ns / 1_000_000_000) as i64, (ns % 1_000_000_000) as i64)
}

fn open_options(flags: OpenFlags) -> tokio::fs::OpenOptions {
    let access = flags.bits() & libc::O_ACCMODE;
    let mut opts = tokio::fs::OpenOptions::new();
    opts.read(access == libc::O_RDONLY || access == libc::O_RDWR)
        .write(access == libc::O_WRONLY || access == libc::O_RDWR)
        .append(flags.contains(OpenFlags::APPEND))
        .truncate(flags.contains(OpenFlags::TRUNC))
        .create(flags.contains(OpenFlags::CREAT))
        .create_new(flags.contains(OpenFlags::EXCL));
    opts
}

/// An open file on the host filesystem.
struct LocalFile {
    file: tokio::sync::Mutex<tokio::fs::File>,
}

#[async_trait]
impl RawFile for LocalFile {
    async fn read(&self, offset: u64, size: u32) -> io::Result<Bytes> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }
}

/// An open directory stream on the host filesystem. Entry readback
/// happens at the stream owner's layer.
struct LocalDir {
    _stream: tokio::sync::Mutex<tokio::fs::ReadDir>,
}

#[async_trait]
impl RawDir for LocalDir {}

#[async_trait]
impl PathFilesystem for LocalFs {
    async fn getattr(&self, path: &str) -> io::Result<Attr> {
        let meta = tokio::fs::symlink_metadata(self.full_path(path)?).await?;
        Ok(attr_from_metadata(&meta))
    }

    async fn readlink(&self, path: &str) -> io::Result<Bytes> {
        use std::os::unix::ffi::OsStrExt as _;

        let target = tokio::fs::read_link(self.full_path(path)?).await?;
        Ok(Bytes::copy_from_slice(target.as_os_str().as_bytes()))
    }

    async fn open(&self, path: &str, flags: OpenFlags) -> io::Result<Box<dyn RawFile>> {
        let file = open_options(flags).open(self.full_path(path)?).await?;
        Ok(Box::new(LocalFile {
            file: tokio::sync::Mutex::new(file),
        }))
    }

    async fn opendir(&self, path: &str) -> io::Result<Box<dyn RawDir>> {
        let stream = tokio::fs::read_dir(self.full_path(path)?).await?;
        Ok(Box::new(LocalDir {
            _stream: tokio::sync::Mutex::new(stream),
        }))
    }

    async fn create(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> io::Result<Box<dyn RawFile>> {
        let mut opts = open_options(flags);
        opts.write(true).create(true).mode(mode);
        let file = opts.open(self.full_path(path)?).await?;
        Ok(Box::new(LocalFile {
            file: tokio::sync::Mutex::new(file),
        }))
    }

    async fn mknod(&self, path: &str, mode: u32, rdev: u32) -> io::Result<()> {
        nix::sys::stat::mknod(
            &self.full_path(path)?,
            SFlag::from_bits_truncate(mode),
            Mode::from_bits_truncate(mode),
            u64::from(rdev),
        )
        .map_err(io::Error::from)
    }

    async fn mkdir(&self, path: &str, mode: u32) -> io::Result<()> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.mode(mode);
        builder.create(self.full_path(path)?).await
    }

    async fn unlink(&self, path: &str) -> io::Result<()> {
        tokio::fs::remove_file(self.full_path(path)?).await
    }

    async fn rmdir(&self, path: &str) -> io::Result<()> {
        tokio::fs::remove_dir(self.full_path(path)?).await
    }

    async fn symlink(&self, target: &str, link_path: &str) -> io::Result<()> {
        tokio::fs::symlink(target, self.full_path(link_path)?).await
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> io::Result<()> {
        tokio::fs::rename(self.full_path(old_path)?, self.full_path(new_path)?).await
    }

    async fn link(&self, old_path: &str, new_path: &str) -> io::Result<()> {
        tokio::fs::hard_link(self.full_path(old_path)?, self.full_path(new_path)?).await
    }

    async fn chmod(&self, path: &str, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt as _;

        let perms = std::fs::Permissions::from_mode(mode);
        tokio::fs::set_permissions(self.full_path(path)?, perms).await
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> io::Result<()> {
        nix::unistd::chown(
            &self.full_path(path)?,
            Some(Uid::from_raw(uid)),
            Some(Gid::from_raw(gid)),
        )
        .map_err(io::Error::from)
    }

    async fn truncate(&self, path: &str, size: u64) -> io::Result<()> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(self.full_path(path)?)
            .await?;
        file.set_len(size).await
    }

    async fn utimens(&self, path: &str, atime_ns: u64, mtime_ns: u64) -> io::Result<()> {
        nix::sys::stat::utimensat(
            None,
            &self.full_path(path)?,
            &timespec_from_ns(atime_ns),
            &timespec_from_ns(mtime_ns),
            UtimensatFlags::NoFollowSymlink,
        )
        .map_err(io::Error::from)
    }

    async fn access(&self, path: &str, mask: u32) -> io::Result<()> {
        let flags = if mask == 0 {
            AccessFlags::F_OK
        } else {
            AccessFlags::from_bits_truncate(mask.cast_signed())
        };
        nix::unistd::access(&self.full_path(path)?, flags).map_err(io::Error::from)
    }
}
