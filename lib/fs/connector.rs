//! The connector: one entry point per kernel-level filesystem operation.
//!
//! Every operation follows the same skeleton: resolve the caller's node
//! id to `(path, mount)`, bail with `ENOENT` when the mount is gone,
//! compose the leaf path, invoke the backend (with no lock held), apply
//! table side effects, and shape the reply. Backend errors are surfaced
//! verbatim.

use std::io;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::{debug, instrument};

use super::backend::PathFilesystem;
use super::options::ConnectorOptions;
use super::table::InodeTable;
use super::{
    AccessRequest, Attr, AttrReply, CreateReply, CreateRequest, EntryReply, LinkRequest,
    MkdirRequest, MknodRequest, NodeId, OpenDirReply, OpenReply, OpenRequest, RenameRequest,
    RequestHeader, SetAttrRequest, SetAttrValid, mode_kind, split_secs,
};

/// Compose a directory path with a leaf name. The mount point itself is
/// the empty path.
fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_owned()
    } else {
        format!("{dir}/{name}")
    }
}

/// Nanoseconds since the epoch, for `*_NOW` time updates.
fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}

/// Keep the first error of a sequence of independent steps.
fn remember(slot: &mut Option<io::Error>, result: io::Result<()>) {
    if let Err(err) = result
        && slot.is_none()
    {
        *slot = Some(err);
    }
}

/// Bridges a node-id-addressed protocol peer to path-addressed backend
/// filesystems.
///
/// Construction mounts the given backend at the root; further backends
/// can be grafted onto directories with [`mount`](Connector::mount).
pub struct Connector {
    table: InodeTable,
    options: ConnectorOptions,
}

impl Connector {
    /// A connector with default timeouts, rooted at `root_fs`.
    pub async fn new(root_fs: Arc<dyn PathFilesystem>) -> io::Result<Arc<Self>> {
        Self::with_options(root_fs, ConnectorOptions::default()).await
    }

    /// A connector with explicit timeouts, rooted at `root_fs`.
    pub async fn with_options(
        root_fs: Arc<dyn PathFilesystem>,
        options: ConnectorOptions,
    ) -> io::Result<Arc<Self>> {
        let connector = Arc::new(Self {
            table: InodeTable::new(),
            options,
        });
        connector.mount("/", root_fs).await?;
        Ok(connector)
    }

    /// The configured timeouts.
    #[must_use]
    pub fn options(&self) -> &ConnectorOptions {
        &self.options
    }

    pub(crate) fn table(&self) -> &InodeTable {
        &self.table
    }

    fn entry_reply(&self, node_id: NodeId, mut attr: Attr) -> EntryReply {
        attr.ino = node_id;
        let (entry_valid, entry_valid_nsec) = split_secs(self.options.entry_timeout);
        let (attr_valid, attr_valid_nsec) = split_secs(self.options.attr_timeout);
        EntryReply {
            node_id,
            generation: 1,
            entry_valid,
            entry_valid_nsec,
            attr_valid,
            attr_valid_nsec,
            attr,
        }
    }

    fn attr_reply(&self, node_id: NodeId, mut attr: Attr) -> AttrReply {
        attr.ino = node_id;
        let (attr_valid, attr_valid_nsec) = split_secs(self.options.attr_timeout);
        AttrReply {
            attr_valid,
            attr_valid_nsec,
            attr,
        }
    }

    /// Resolve a name under a directory to an entry the peer can
    /// address.
    ///
    /// Replies with a negative entry (node id zero) when the parent's
    /// mount is gone, or when the backend reports `ENOENT` and negative
    /// caching is enabled. On success the entry's lookup count is
    /// incremented and must eventually be balanced by `forget`.
    #[instrument(name = "Connector::lookup", skip(self))]
    pub async fn lookup(&self, header: &RequestHeader, name: &str) -> io::Result<EntryReply> {
        let parent = self.table.resolve(header.node_id)?;
        let Some(mount) = parent.live() else {
            return Ok(EntryReply::negative(self.options.negative_timeout));
        };

        let path = join_path(&parent.path, name);
        let attr = match mount.fs().getattr(&path).await {
            Ok(attr) => attr,
            Err(err)
                if err.raw_os_error() == Some(libc::ENOENT)
                    && self.options.negative_timeout > 0.0 =>
            {
                return Ok(EntryReply::negative(self.options.negative_timeout));
            }
            Err(err) => return Err(err),
        };

        let node_id = self
            .table
            .register_lookup(header.node_id, name, mode_kind(attr.mode))?;
        Ok(self.entry_reply(node_id, attr))
    }

    /// Balance earlier lookups. Pure bookkeeping; never fails.
    #[instrument(name = "Connector::forget", skip(self))]
    pub fn forget(&self, header: &RequestHeader, nlookup: u64) {
        self.table.forget_update(header.node_id, nlookup);
    }

    /// Attributes of the addressed node.
    #[instrument(name = "Connector::getattr", skip(self))]
    pub async fn getattr(&self, header: &RequestHeader) -> io::Result<AttrReply> {
        let target = self.table.resolve(header.node_id)?;
        let Some(mount) = target.live() else {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };
        let attr = mount.fs().getattr(&target.path).await?;
        Ok(self.attr_reply(header.node_id, attr))
    }

    /// Apply the requested attribute changes.
    ///
    /// Each change carried by the valid mask (mode, ownership, size,
    /// times) is applied independently; the first error is returned
    /// after all requested steps have been attempted.
    #[instrument(name = "Connector::setattr", skip(self, req))]
    pub async fn setattr(
        &self,
        header: &RequestHeader,
        req: &SetAttrRequest,
    ) -> io::Result<AttrReply> {
        let target = self.table.resolve(header.node_id)?;
        let Some(mount) = target.live() else {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };
        let fs = mount.fs();
        let path = target.path.as_str();

        let mut first_err = None;
        if req.valid.contains(SetAttrValid::MODE) {
            remember(&mut first_err, fs.chmod(path, req.mode).await);
        }
        if req
            .valid
            .intersects(SetAttrValid::UID | SetAttrValid::GID)
        {
            remember(&mut first_err, fs.chown(path, req.uid, req.gid).await);
        }
        if req.valid.contains(SetAttrValid::SIZE) {
            remember(&mut first_err, fs.truncate(path, req.size).await);
        }
        if req.valid.intersects(
            SetAttrValid::ATIME
                | SetAttrValid::MTIME
                | SetAttrValid::ATIME_NOW
                | SetAttrValid::MTIME_NOW,
        ) {
            let atime_ns = if req.valid.contains(SetAttrValid::ATIME_NOW) {
                now_ns()
            } else {
                req.atime_ns
            };
            let mtime_ns = if req.valid.contains(SetAttrValid::MTIME_NOW) {
                now_ns()
            } else {
                req.mtime_ns
            };
            remember(&mut first_err, fs.utimens(path, atime_ns, mtime_ns).await);
        }
        if let Some(err) = first_err {
            return Err(err);
        }

        self.getattr(header).await
    }

    /// Target of the addressed symlink.
    #[instrument(name = "Connector::readlink", skip(self))]
    pub async fn readlink(&self, header: &RequestHeader) -> io::Result<Bytes> {
        let target = self.table.resolve(header.node_id)?;
        let Some(mount) = target.live() else {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };
        mount.fs().readlink(&target.path).await
    }

    /// Check accessibility of the addressed node.
    #[instrument(name = "Connector::access", skip(self))]
    pub async fn access(&self, header: &RequestHeader, req: &AccessRequest) -> io::Result<()> {
        let target = self.table.resolve(header.node_id)?;
        let Some(mount) = target.live() else {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };
        mount.fs().access(&target.path, req.mask).await
    }

    /// Create a filesystem node under the addressed directory and
    /// materialize its entry.
    #[instrument(name = "Connector::mknod", skip(self, req))]
    pub async fn mknod(
        &self,
        header: &RequestHeader,
        req: &MknodRequest,
        name: &str,
    ) -> io::Result<EntryReply> {
        let target = self.table.resolve(header.node_id)?;
        let Some(mount) = target.live() else {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };
        let path = join_path(&target.path, name);
        mount.fs().mknod(&path, req.mode, req.rdev).await?;
        self.lookup(header, name).await
    }

    /// Create a directory under the addressed directory and materialize
    /// its entry.
    #[instrument(name = "Connector::mkdir", skip(self, req))]
    pub async fn mkdir(
        &self,
        header: &RequestHeader,
        req: &MkdirRequest,
        name: &str,
    ) -> io::Result<EntryReply> {
        let target = self.table.resolve(header.node_id)?;
        let Some(mount) = target.live() else {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };
        let path = join_path(&target.path, name);
        mount.fs().mkdir(&path, req.mode).await?;
        self.lookup(header, name).await
    }

    /// Create a symlink under the addressed directory and materialize
    /// its entry.
    #[instrument(name = "Connector::symlink", skip(self))]
    pub async fn symlink(
        &self,
        header: &RequestHeader,
        target_path: &str,
        link_name: &str,
    ) -> io::Result<EntryReply> {
        let target = self.table.resolve(header.node_id)?;
        let Some(mount) = target.live() else {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };
        let path = join_path(&target.path, link_name);
        mount.fs().symlink(target_path, &path).await?;
        self.lookup(header, link_name).await
    }

    /// Create a hard link under the addressed directory to an existing
    /// node, which must live on the same mount (`EXDEV` otherwise).
    #[instrument(name = "Connector::link", skip(self, req))]
    pub async fn link(
        &self,
        header: &RequestHeader,
        req: &LinkRequest,
        name: &str,
    ) -> io::Result<EntryReply> {
        let old = self.table.resolve(req.old_node_id)?;
        let new_parent = self.table.resolve(header.node_id)?;
        let (Some(old_mount), Some(new_mount)) = (old.live(), new_parent.live()) else {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };
        if !Arc::ptr_eq(old_mount, new_mount) {
            return Err(io::Error::from_raw_os_error(libc::EXDEV));
        }

        let path = join_path(&new_parent.path, name);
        new_mount.fs().link(&old.path, &path).await?;
        self.lookup(header, name).await
    }

    /// Remove a file under the addressed directory.
    ///
    /// The name is dropped from the table even when the backend errors:
    /// the peer's view of it is gone regardless.
    #[instrument(name = "Connector::unlink", skip(self))]
    pub async fn unlink(&self, header: &RequestHeader, name: &str) -> io::Result<()> {
        let target = self.table.resolve(header.node_id)?;
        let Some(mount) = target.live() else {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };
        let path = join_path(&target.path, name);
        let result = mount.fs().unlink(&path).await;
        self.table.unlink_update(header.node_id, name);
        result
    }

    /// Remove a directory under the addressed directory. Table handling
    /// matches [`unlink`](Connector::unlink).
    #[instrument(name = "Connector::rmdir", skip(self))]
    pub async fn rmdir(&self, header: &RequestHeader, name: &str) -> io::Result<()> {
        let target = self.table.resolve(header.node_id)?;
        let Some(mount) = target.live() else {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };
        let path = join_path(&target.path, name);
        let result = mount.fs().rmdir(&path).await;
        self.table.unlink_update(header.node_id, name);
        result
    }

    /// Move a name between directories on the same mount.
    ///
    /// Crossing a mount boundary fails with `EXDEV` before either
    /// backend is invoked. On success the table is re-keyed, evicting
    /// any entry that occupied the destination.
    #[instrument(name = "Connector::rename", skip(self, req))]
    pub async fn rename(
        &self,
        header: &RequestHeader,
        req: &RenameRequest,
        old_name: &str,
        new_name: &str,
    ) -> io::Result<()> {
        let old_dir = self.table.resolve(header.node_id)?;
        let new_dir = self.table.resolve(req.new_dir)?;
        let (Some(old_mount), Some(new_mount)) = (old_dir.live(), new_dir.live()) else {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };
        if !Arc::ptr_eq(old_mount, new_mount) {
            return Err(io::Error::from_raw_os_error(libc::EXDEV));
        }

        let old_path = join_path(&old_dir.path, old_name);
        let new_path = join_path(&new_dir.path, new_name);
        new_mount.fs().rename(&old_path, &new_path).await?;

        self.table
            .rename_update(header.node_id, old_name, req.new_dir, new_name);
        Ok(())
    }

    /// Open the addressed file, handing back the backend's handle and
    /// bumping the mount's open-file count.
    #[instrument(name = "Connector::open", skip(self, req))]
    pub async fn open(&self, header: &RequestHeader, req: &OpenRequest) -> io::Result<OpenReply> {
        let target = self.table.resolve(header.node_id)?;
        let Some(mount) = target.live() else {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };
        let file = mount.fs().open(&target.path, req.flags).await?;
        mount.inc_open_files();
        Ok(OpenReply { file })
    }

    /// Open the addressed directory, handing back the backend's stream
    /// and bumping the mount's open-directory count.
    #[instrument(name = "Connector::opendir", skip(self, req))]
    pub async fn opendir(
        &self,
        header: &RequestHeader,
        req: &OpenRequest,
    ) -> io::Result<OpenDirReply> {
        let _ = req.flags;
        let target = self.table.resolve(header.node_id)?;
        let Some(mount) = target.live() else {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };
        let dir = mount.fs().opendir(&target.path).await?;
        mount.inc_open_dirs();
        Ok(OpenDirReply { dir })
    }

    /// Create and open a file under the addressed directory, returning
    /// the open handle together with the new entry.
    #[instrument(name = "Connector::create", skip(self, req))]
    pub async fn create(
        &self,
        header: &RequestHeader,
        req: &CreateRequest,
        name: &str,
    ) -> io::Result<CreateReply> {
        let target = self.table.resolve(header.node_id)?;
        let Some(mount) = target.live() else {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };
        let path = join_path(&target.path, name);
        let file = mount.fs().create(&path, req.flags, req.mode).await?;
        mount.inc_open_files();

        match self.lookup(header, name).await {
            Ok(entry) => Ok(CreateReply { file, entry }),
            Err(err) => {
                mount.dec_open_files();
                if let Err(close_err) = file.close().await {
                    debug!(error = %close_err, "closing handle after failed create lookup");
                }
                Err(err)
            }
        }
    }

    /// Surrender of an open-file handle. The handle itself is closed by
    /// its owner; this only balances the busy count. Tolerates a node
    /// or mount that already drained after an unmount.
    #[instrument(name = "Connector::release", skip(self))]
    pub fn release(&self, header: &RequestHeader) {
        match self.table.resolve(header.node_id) {
            Ok(target) => target.mount.dec_open_files(),
            Err(_) => debug!(node = header.node_id, "release after node drained"),
        }
    }

    /// Surrender of an open-directory handle; see
    /// [`release`](Connector::release).
    #[instrument(name = "Connector::release_dir", skip(self))]
    pub fn release_dir(&self, header: &RequestHeader) {
        match self.table.resolve(header.node_id) {
            Ok(target) => target.mount.dec_open_dirs(),
            Err(_) => debug!(node = header.node_id, "releasedir after node drained"),
        }
    }

    /// Extended attributes are not supported.
    pub fn setxattr(&self, _header: &RequestHeader) -> io::Result<()> {
        Err(io::Error::from_raw_os_error(libc::ENOSYS))
    }

    /// Extended attributes are not supported.
    pub fn getxattr(&self, _header: &RequestHeader) -> io::Result<Bytes> {
        Err(io::Error::from_raw_os_error(libc::ENOSYS))
    }

    /// Block mapping is not supported.
    pub fn bmap(&self, _header: &RequestHeader) -> io::Result<u64> {
        Err(io::Error::from_raw_os_error(libc::ENOSYS))
    }

    /// Device control is not supported.
    pub fn ioctl(&self, _header: &RequestHeader) -> io::Result<()> {
        Err(io::Error::from_raw_os_error(libc::ENOSYS))
    }

    /// Readiness polling is not supported.
    pub fn poll(&self, _header: &RequestHeader) -> io::Result<()> {
        Err(io::Error::from_raw_os_error(libc::ENOSYS))
    }
}
