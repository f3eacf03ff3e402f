//! Per-mount state and the human-facing mount / unmount surface.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use tracing::{debug, instrument, warn};

use super::backend::PathFilesystem;
use super::connector::Connector;
use super::table::UnmountOutcome;
use super::{NodeId, ROOT_ID};

/// The binding of a backend filesystem at a directory entry.
///
/// Busy counters and the pending flag live in atomics so they can be
/// touched through the shared `Arc` after the table lock is released;
/// decisions that must be atomic with table state (the unmount busy
/// check, the pending transition) are made while the table's write lock
/// is held.
pub struct Mount {
    fs: Arc<dyn PathFilesystem>,
    unmount_pending: AtomicBool,
    open_files: AtomicI64,
    open_dirs: AtomicI64,
    sub_mounts: AtomicI64,
}

impl Mount {
    pub(crate) fn new(fs: Arc<dyn PathFilesystem>) -> Self {
        Self {
            fs,
            unmount_pending: AtomicBool::new(false),
            open_files: AtomicI64::new(0),
            open_dirs: AtomicI64::new(0),
            sub_mounts: AtomicI64::new(0),
        }
    }

    /// The backend bound at this mount.
    #[must_use]
    pub fn fs(&self) -> &Arc<dyn PathFilesystem> {
        &self.fs
    }

    /// Once set, the mount is invisible to new operations even though
    /// the record survives until all references drain.
    #[must_use]
    pub fn is_unmount_pending(&self) -> bool {
        self.unmount_pending.load(Ordering::Acquire)
    }

    pub(crate) fn set_unmount_pending(&self) {
        self.unmount_pending.store(true, Ordering::Release);
    }

    /// Number of open files on this mount.
    #[must_use]
    pub fn open_files(&self) -> i64 {
        self.open_files.load(Ordering::Relaxed)
    }

    /// Number of open directory streams on this mount.
    #[must_use]
    pub fn open_dirs(&self) -> i64 {
        self.open_dirs.load(Ordering::Relaxed)
    }

    /// Number of mounts grafted onto directories inside this mount.
    #[must_use]
    pub fn sub_mounts(&self) -> i64 {
        self.sub_mounts.load(Ordering::Relaxed)
    }

    pub(crate) fn busy(&self) -> bool {
        self.open_files() + self.open_dirs() + self.sub_mounts() > 0
    }

    pub(crate) fn inc_open_files(&self) {
        self.open_files.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_open_files(&self) {
        self.open_files.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_open_dirs(&self) {
        self.open_dirs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_open_dirs(&self) {
        self.open_dirs.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_sub_mounts(&self) {
        self.sub_mounts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_sub_mounts(&self) {
        self.sub_mounts.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("unmount_pending", &self.is_unmount_pending())
            .field("open_files", &self.open_files())
            .field("open_dirs", &self.open_dirs())
            .field("sub_mounts", &self.sub_mounts())
            .finish_non_exhaustive()
    }
}

impl Connector {
    /// Graft `fs` onto the directory at `path`.
    ///
    /// Fails with `EBUSY` if the target already has cached children,
    /// `EINVAL` if it is not a directory, and propagates any error from
    /// the backend's own mount hook; in all three cases no record is
    /// attached.
    #[instrument(name = "Connector::mount", skip(self, fs))]
    pub async fn mount(self: &Arc<Self>, path: &str, fs: Arc<dyn PathFilesystem>) -> io::Result<()> {
        let node = self.table().resolve_by_path(path)?;
        self.table().mount_checks(node)?;

        fs.mount(Arc::clone(self)).await?;

        let mount = Arc::new(Mount::new(fs));
        let parent_mount = self.table().attach_mount(node, mount)?;
        if let Some(parent) = parent_mount {
            parent.inc_sub_mounts();
        }
        debug!(node, path, "mounted");
        Ok(())
    }

    /// Detach the mount at `path`.
    ///
    /// Fails with `EBUSY` while the mount has open files, open
    /// directories, or sub-mounts. If the mount point is still
    /// referenced by the peer, the record is marked unmount-pending and
    /// survives until the references drain; otherwise it is detached
    /// immediately.
    #[instrument(name = "Connector::unmount", skip(self))]
    pub async fn unmount(&self, path: &str) -> io::Result<()> {
        let node = self.table().resolve_by_path(path)?;
        if node == ROOT_ID {
            warn!("unmount of the root is not supported");
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let outcome = self.table().begin_unmount(node)?;
        match outcome {
            UnmountOutcome::Detached { parent } => {
                debug!(node, path, "unmounted");
                if let Some(parent) = parent {
                    parent.dec_sub_mounts();
                }
            }
            UnmountOutcome::Pending { mount, parent } => {
                debug!(node, path, "unmount pending, references outstanding");
                mount.fs().unmount().await;
                if let Some(parent) = parent {
                    parent.dec_sub_mounts();
                }
            }
        }
        Ok(())
    }

    /// Node id of the entry at `path`, for callers that manage mounts by
    /// path. Descends the cached tree from the root.
    pub fn node_by_path(&self, path: &str) -> io::Result<NodeId> {
        self.table().resolve_by_path(path)
    }
}
