#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use pathfs::fs::connector::Connector;
use pathfs::fs::{Attr, OpenFlags, PathFilesystem, RawDir, RawFile};

/// Attribute builder for a directory.
pub fn dir_attr() -> Attr {
    Attr {
        mode: libc::S_IFDIR | 0o755,
        ..Attr::default()
    }
}

/// Attribute builder for a regular file of the given size.
pub fn file_attr(size: u64) -> Attr {
    Attr {
        mode: libc::S_IFREG | 0o644,
        size,
        ..Attr::default()
    }
}

/// Attribute builder for a symlink.
pub fn symlink_attr() -> Attr {
    Attr {
        mode: libc::S_IFLNK | 0o777,
        ..Attr::default()
    }
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// Shared state backing [`MockPathFs`].
///
/// `attrs` maps backend-relative paths (the mount point itself is `""`)
/// to the attributes the backend reports. Call recorders let tests
/// assert exactly which paths reached the backend; the `*_errno` slots
/// inject failures.
#[derive(Default)]
pub struct MockFsState {
    pub attrs: Mutex<HashMap<String, Attr>>,
    /// `path -> symlink target`
    pub links: Mutex<HashMap<String, String>>,

    pub getattr_calls: Mutex<Vec<String>>,
    pub rename_calls: Mutex<Vec<(String, String)>>,
    pub link_calls: Mutex<Vec<(String, String)>>,
    pub unlink_calls: Mutex<Vec<String>>,
    pub rmdir_calls: Mutex<Vec<String>>,
    pub mkdir_calls: Mutex<Vec<String>>,
    pub mknod_calls: Mutex<Vec<String>>,
    pub symlink_calls: Mutex<Vec<(String, String)>>,
    pub chmod_calls: Mutex<Vec<String>>,
    pub chown_calls: Mutex<Vec<String>>,
    pub truncate_calls: Mutex<Vec<(String, u64)>>,
    pub utimens_calls: Mutex<Vec<String>>,
    pub access_calls: Mutex<Vec<String>>,
    pub open_calls: Mutex<Vec<String>>,
    pub opendir_calls: Mutex<Vec<String>>,
    pub mount_calls: AtomicU64,
    pub unmount_calls: AtomicU64,

    pub rename_errno: Option<i32>,
    pub unlink_errno: Option<i32>,
    pub chmod_errno: Option<i32>,
    pub truncate_errno: Option<i32>,
    pub utimens_errno: Option<i32>,
}

impl MockFsState {
    /// State pre-populated with the given `path -> attr` pairs. The
    /// mount point (`""`) is always a directory.
    pub fn with_paths(paths: &[(&str, Attr)]) -> Self {
        let mut attrs: HashMap<String, Attr> =
            paths.iter().map(|(p, a)| ((*p).to_owned(), *a)).collect();
        attrs.entry(String::new()).or_insert_with(dir_attr);
        Self {
            attrs: Mutex::new(attrs),
            ..Self::default()
        }
    }

    pub fn insert_attr(&self, path: &str, attr: Attr) {
        self.attrs.lock().unwrap().insert(path.to_owned(), attr);
    }

    pub fn remove_attr(&self, path: &str) {
        self.attrs.lock().unwrap().remove(path);
    }
}

/// A scripted path-addressed backend for connector tests.
#[derive(Clone)]
pub struct MockPathFs {
    pub state: Arc<MockFsState>,
}

impl MockPathFs {
    pub fn new(state: MockFsState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }
}

/// A mock open file that serves a fixed byte slice.
pub struct MockFile {
    pub data: Bytes,
}

#[async_trait]
impl RawFile for MockFile {
    async fn read(&self, offset: u64, size: u32) -> io::Result<Bytes> {
        let start = usize::try_from(offset).unwrap().min(self.data.len());
        let end = (start + size as usize).min(self.data.len());
        Ok(self.data.slice(start..end))
    }
}

pub struct MockDir;

#[async_trait]
impl RawDir for MockDir {}

#[async_trait]
impl PathFilesystem for MockPathFs {
    async fn mount(&self, _connector: Arc<Connector>) -> io::Result<()> {
        self.state.mount_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn unmount(&self) {
        self.state.unmount_calls.fetch_add(1, Ordering::Relaxed);
    }

    async fn getattr(&self, path: &str) -> io::Result<Attr> {
        self.state
            .getattr_calls
            .lock()
            .unwrap()
            .push(path.to_owned());
        self.state
            .attrs
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .ok_or_else(|| errno(libc::ENOENT))
    }

    async fn readlink(&self, path: &str) -> io::Result<Bytes> {
        self.state
            .links
            .lock()
            .unwrap()
            .get(path)
            .map(|t| Bytes::from(t.clone().into_bytes()))
            .ok_or_else(|| errno(libc::EINVAL))
    }

    async fn open(&self, path: &str, _flags: OpenFlags) -> io::Result<Box<dyn RawFile>> {
        self.state.open_calls.lock().unwrap().push(path.to_owned());
        if !self.state.attrs.lock().unwrap().contains_key(path) {
            return Err(errno(libc::ENOENT));
        }
        Ok(Box::new(MockFile {
            data: Bytes::from_static(b"mock contents"),
        }))
    }

    async fn opendir(&self, path: &str) -> io::Result<Box<dyn RawDir>> {
        self.state
            .opendir_calls
            .lock()
            .unwrap()
            .push(path.to_owned());
        if !self.state.attrs.lock().unwrap().contains_key(path) {
            return Err(errno(libc::ENOENT));
        }
        Ok(Box::new(MockDir))
    }

    async fn create(
        &self,
        path: &str,
        _flags: OpenFlags,
        mode: u32,
    ) -> io::Result<Box<dyn RawFile>> {
        self.state.insert_attr(
            path,
            Attr {
                mode: libc::S_IFREG | (mode & 0o7777),
                ..Attr::default()
            },
        );
        Ok(Box::new(MockFile { data: Bytes::new() }))
    }

    async fn mknod(&self, path: &str, mode: u32, _rdev: u32) -> io::Result<()> {
        self.state.mknod_calls.lock().unwrap().push(path.to_owned());
        self.state.insert_attr(
            path,
            Attr {
                mode,
                ..Attr::default()
            },
        );
        Ok(())
    }

    async fn mkdir(&self, path: &str, _mode: u32) -> io::Result<()> {
        self.state.mkdir_calls.lock().unwrap().push(path.to_owned());
        self.state.insert_attr(path, dir_attr());
        Ok(())
    }

    async fn unlink(&self, path: &str) -> io::Result<()> {
        self.state
            .unlink_calls
            .lock()
            .unwrap()
            .push(path.to_owned());
        if let Some(code) = self.state.unlink_errno {
            return Err(errno(code));
        }
        self.state.remove_attr(path);
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> io::Result<()> {
        self.state.rmdir_calls.lock().unwrap().push(path.to_owned());
        self.state.remove_attr(path);
        Ok(())
    }

    async fn symlink(&self, target: &str, link_path: &str) -> io::Result<()> {
        self.state
            .symlink_calls
            .lock()
            .unwrap()
            .push((target.to_owned(), link_path.to_owned()));
        self.state.insert_attr(link_path, symlink_attr());
        self.state
            .links
            .lock()
            .unwrap()
            .insert(link_path.to_owned(), target.to_owned());
        Ok(())
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> io::Result<()> {
        self.state
            .rename_calls
            .lock()
            .unwrap()
            .push((old_path.to_owned(), new_path.to_owned()));
        if let Some(code) = self.state.rename_errno {
            return Err(errno(code));
        }
        let mut attrs = self.state.attrs.lock().unwrap();
        if let Some(attr) = attrs.remove(old_path) {
            attrs.insert(new_path.to_owned(), attr);
        }
        Ok(())
    }

    async fn link(&self, old_path: &str, new_path: &str) -> io::Result<()> {
        self.state
            .link_calls
            .lock()
            .unwrap()
            .push((old_path.to_owned(), new_path.to_owned()));
        let mut attrs = self.state.attrs.lock().unwrap();
        let Some(attr) = attrs.get(old_path).copied() else {
            return Err(errno(libc::ENOENT));
        };
        attrs.insert(new_path.to_owned(), attr);
        Ok(())
    }

    async fn chmod(&self, path: &str, _mode: u32) -> io::Result<()> {
        self.state.chmod_calls.lock().unwrap().push(path.to_owned());
        if let Some(code) = self.state.chmod_errno {
            return Err(errno(code));
        }
        Ok(())
    }

    async fn chown(&self, path: &str, _uid: u32, _gid: u32) -> io::Result<()> {
        self.state.chown_calls.lock().unwrap().push(path.to_owned());
        Ok(())
    }

    async fn truncate(&self, path: &str, size: u64) -> io::Result<()> {
        self.state
            .truncate_calls
            .lock()
            .unwrap()
            .push((path.to_owned(), size));
        if let Some(code) = self.state.truncate_errno {
            return Err(errno(code));
        }
        Ok(())
    }

    async fn utimens(&self, path: &str, _atime_ns: u64, _mtime_ns: u64) -> io::Result<()> {
        self.state
            .utimens_calls
            .lock()
            .unwrap()
            .push(path.to_owned());
        if let Some(code) = self.state.utimens_errno {
            return Err(errno(code));
        }
        Ok(())
    }

    async fn access(&self, path: &str, _mask: u32) -> io::Result<()> {
        self.state
            .access_calls
            .lock()
            .unwrap()
            .push(path.to_owned());
        if self.state.attrs.lock().unwrap().contains_key(path) {
            Ok(())
        } else {
            Err(errno(libc::ENOENT))
        }
    }
}
