//! Protocol-facing types shared by the connector and its backends.
//!
//! The peer addresses everything by [`NodeId`]; backends are addressed by
//! path strings relative to their mount point. Everything in this module
//! is plain data — the mapping between the two worlds lives in
//! [`table`] and [`connector`].

/// Backend filesystem capability consumed by the connector.
pub mod backend;
/// The connector: one entry point per kernel-level filesystem operation.
pub mod connector;
/// Passthrough backend onto a host directory.
pub mod local;
/// Per-mount state and the mount / unmount surface.
pub mod mount;
/// Timeout configuration.
pub mod options;
/// Two-keyed directory-entry table and path reconstruction.
pub mod table;

pub use backend::{PathFilesystem, RawDir, RawFile};
pub use connector::Connector;
pub use local::LocalFs;
pub use options::ConnectorOptions;

use std::time::SystemTime;

use bitflags::bitflags;

/// Opaque identifier the peer uses to address a directory entry.
///
/// Assigned and owned by the connector; never reused while the entry
/// exists.
pub type NodeId = u64;

/// The well-known node id of the filesystem root.
///
/// Id `0` is reserved as the root's parent-key sentinel; the monotonic
/// allocator starts at `ROOT_ID + 1`.
pub const ROOT_ID: NodeId = 1;

/// Mask a full `st_mode` value down to its file-type bits.
#[must_use]
pub fn mode_kind(mode: u32) -> u32 {
    mode & libc::S_IFMT
}

/// Whether the given file-type bits denote a directory.
#[must_use]
pub fn is_dir_kind(kind: u32) -> bool {
    kind & libc::S_IFMT == libc::S_IFDIR
}

bitflags! {
    /// Flags for opening a file, similar to Unix open(2) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;

        /// Append on each write.
        const APPEND = libc::O_APPEND;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create file if it does not exist.
        const CREAT = libc::O_CREAT;
        /// Error if file already exists (with `CREAT`).
        const EXCL = libc::O_EXCL;

        /// Non-blocking mode.
        const NONBLOCK = libc::O_NONBLOCK;
        /// Synchronous writes.
        const SYNC = libc::O_SYNC;
        /// Do not follow symlinks.
        const NOFOLLOW = libc::O_NOFOLLOW;
        /// Fail if not a directory.
        const DIRECTORY = libc::O_DIRECTORY;
    }
}

bitflags! {
    /// Which fields of a [`SetAttrRequest`] carry a requested change.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SetAttrValid: u32 {
        /// `mode` is valid.
        const MODE = 1 << 0;
        /// `uid` is valid.
        const UID = 1 << 1;
        /// `gid` is valid.
        const GID = 1 << 2;
        /// `size` is valid.
        const SIZE = 1 << 3;
        /// `atime_ns` is valid.
        const ATIME = 1 << 4;
        /// `mtime_ns` is valid.
        const MTIME = 1 << 5;
        /// Set atime to the current time.
        const ATIME_NOW = 1 << 7;
        /// Set mtime to the current time.
        const MTIME_NOW = 1 << 8;
    }
}

/// File attributes as reported by a backend.
///
/// `ino` is whatever the backend reported; the connector always
/// overwrites it with the assigned [`NodeId`] before replying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    /// Inode number. Overwritten by the connector in every reply.
    pub ino: u64,
    /// File size in bytes.
    pub size: u64,
    /// Number of 512-byte blocks.
    pub blocks: u64,
    /// Last access time.
    pub atime: SystemTime,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Last status change time.
    pub ctime: SystemTime,
    /// Full `st_mode` value (type bits and permissions).
    pub mode: u32,
    /// Number of hard links.
    pub nlink: u32,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Device number for device nodes.
    pub rdev: u32,
    /// Preferred I/O block size.
    pub blksize: u32,
}

impl Default for Attr {
    fn default() -> Self {
        Self {
            ino: 0,
            size: 0,
            blocks: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            mode: 0,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 4096,
        }
    }
}

/// Common request context carried by every kernel operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Node id the operation addresses.
    pub node_id: NodeId,
    /// Caller user id.
    pub uid: u32,
    /// Caller group id.
    pub gid: u32,
    /// Caller process id.
    pub pid: u32,
}

impl RequestHeader {
    /// A header addressing `node_id` with root credentials.
    #[must_use]
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            uid: 0,
            gid: 0,
            pid: 0,
        }
    }
}

/// Arguments for `setattr`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttrRequest {
    /// Which of the fields below carry a requested change.
    pub valid: SetAttrValid,
    /// New mode, if [`SetAttrValid::MODE`].
    pub mode: u32,
    /// New owner, if [`SetAttrValid::UID`].
    pub uid: u32,
    /// New group, if [`SetAttrValid::GID`].
    pub gid: u32,
    /// New size, if [`SetAttrValid::SIZE`].
    pub size: u64,
    /// New access time in nanoseconds since the epoch.
    pub atime_ns: u64,
    /// New modification time in nanoseconds since the epoch.
    pub mtime_ns: u64,
}

impl Default for SetAttrValid {
    fn default() -> Self {
        Self::empty()
    }
}

/// Arguments for `mknod`.
#[derive(Debug, Clone, Copy)]
pub struct MknodRequest {
    /// Mode (type bits and permissions) of the new node.
    pub mode: u32,
    /// Device number, for device nodes.
    pub rdev: u32,
}

/// Arguments for `mkdir`.
#[derive(Debug, Clone, Copy)]
pub struct MkdirRequest {
    /// Permission bits of the new directory.
    pub mode: u32,
}

/// Arguments for `rename`. The old directory is the header's node id.
#[derive(Debug, Clone, Copy)]
pub struct RenameRequest {
    /// Node id of the destination directory.
    pub new_dir: NodeId,
}

/// Arguments for `link`. The new parent is the header's node id.
#[derive(Debug, Clone, Copy)]
pub struct LinkRequest {
    /// Node id of the existing file to link to.
    pub old_node_id: NodeId,
}

/// Arguments for `open` and `opendir`.
#[derive(Debug, Clone, Copy)]
pub struct OpenRequest {
    /// Open flags.
    pub flags: OpenFlags,
}

/// Arguments for `create`.
#[derive(Debug, Clone, Copy)]
pub struct CreateRequest {
    /// Open flags for the handle returned alongside the entry.
    pub flags: OpenFlags,
    /// Mode of the new file.
    pub mode: u32,
}

/// Arguments for `access`.
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest {
    /// Access mask (`R_OK` / `W_OK` / `X_OK` combination).
    pub mask: u32,
}

/// Reply to a successful `lookup` (and to the entry-producing mutations).
///
/// `node_id == 0` is a *negative entry*: the name does not exist and the
/// peer may cache that fact for the entry-validity period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryReply {
    /// Connector-assigned node id; zero for a negative entry.
    pub node_id: NodeId,
    /// Generation number paired with the node id. Constant `1`: ids are
    /// never reused, so stale generations cannot arise.
    pub generation: u64,
    /// Seconds the peer may cache this entry.
    pub entry_valid: u64,
    /// Nanosecond part of the entry validity.
    pub entry_valid_nsec: u32,
    /// Seconds the peer may cache the attributes.
    pub attr_valid: u64,
    /// Nanosecond part of the attribute validity.
    pub attr_valid_nsec: u32,
    /// Attributes, with `ino` overwritten by the assigned node id.
    pub attr: Attr,
}

impl EntryReply {
    /// A negative entry valid for `timeout` seconds.
    #[must_use]
    pub fn negative(timeout: f64) -> Self {
        let (entry_valid, entry_valid_nsec) = split_secs(timeout);
        Self {
            node_id: 0,
            generation: 0,
            entry_valid,
            entry_valid_nsec,
            attr_valid: 0,
            attr_valid_nsec: 0,
            attr: Attr::default(),
        }
    }

    /// Whether this reply is a negative entry.
    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.node_id == 0
    }
}

/// Reply to `getattr` and `setattr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrReply {
    /// Seconds the peer may cache the attributes.
    pub attr_valid: u64,
    /// Nanosecond part of the attribute validity.
    pub attr_valid_nsec: u32,
    /// Attributes, with `ino` overwritten by the addressed node id.
    pub attr: Attr,
}

/// Reply to `open`: the backend-supplied file handle, surrendered to the
/// caller for reads and eventual closure.
pub struct OpenReply {
    /// The open file.
    pub file: Box<dyn RawFile>,
}

/// Reply to `opendir`: the backend-supplied directory stream.
pub struct OpenDirReply {
    /// The open directory stream.
    pub dir: Box<dyn RawDir>,
}

/// Reply to `create`: an open handle plus the entry for the new file.
pub struct CreateReply {
    /// The open file.
    pub file: Box<dyn RawFile>,
    /// Entry reply for the newly created name.
    pub entry: EntryReply,
}

/// Split a floating-point second count into whole seconds and
/// nanoseconds, the shape validity periods take on the wire.
#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "timeouts are small non-negative configuration values"
)]
#[must_use]
pub(crate) fn split_secs(secs: f64) -> (u64, u32) {
    let whole = secs.max(0.0).trunc();
    let nsec = ((secs.max(0.0) - whole) * 1e9) as u32;
    (whole as u64, nsec)
}
