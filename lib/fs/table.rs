//! Two-keyed directory-entry table.
//!
//! Every entry the peer has ever looked up is held here, reachable both
//! by its assigned [`NodeId`] and by `(parent NodeId, name)`. Parent
//! links are stored as node ids resolved through the id index — never as
//! shared ownership, which would cycle — and carry an explicit
//! `ref_count` on the parent for as long as the child is present in the
//! name index.
//!
//! One reader-writer lock protects both indices and the id allocator.
//! Reads (id lookups, name lookups, path walks) take it shared;
//! mutations take it exclusive. No guard ever outlives a call into a
//! backend: path resolution copies the joined path and an `Arc` of the
//! mount out before releasing.

use std::io;
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;
use tracing::{debug, error, trace, warn};

use super::mount::Mount;
use super::{NodeId, ROOT_ID, is_dir_kind};

/// Reserved name prefix for entries displaced by an overwriting rename.
///
/// Names beginning with this prefix never collide with legal names;
/// consumers must treat them as reserved.
pub const RENAME_EVICTION_PREFIX: &str = "overwrittenByRename";

/// One cached directory entry.
struct InodeEntry {
    node_id: NodeId,
    /// Leaf name within `parent`; empty only for the root.
    name: String,
    /// Structural parent, resolved through the id index. `None` only for
    /// the root.
    parent: Option<NodeId>,
    /// File-type bits (`S_IFMT`-masked).
    kind: u32,
    /// Outstanding peer lookups; balanced by `forget`.
    lookup_count: i64,
    /// Number of name-linked children pointing at this entry.
    ref_count: i64,
    /// Whether this entry currently occupies a slot in the name index.
    /// An entry holds exactly one reference on its parent while linked.
    linked: bool,
    /// Non-`None` iff this entry is the mount point of a backend.
    mount: Option<Arc<Mount>>,
}

impl InodeEntry {
    fn name_key(&self) -> (NodeId, String) {
        (self.parent.unwrap_or(0), self.name.clone())
    }
}

struct TableInner {
    by_id: FxHashMap<NodeId, InodeEntry>,
    by_name: FxHashMap<(NodeId, String), NodeId>,
    next_node_id: NodeId,
}

/// A resolved node: its path relative to the owning mount, plus the
/// mount record itself (which may be unmount-pending).
#[derive(Debug)]
pub(crate) struct PathTarget {
    pub(crate) path: String,
    pub(crate) mount: Arc<Mount>,
}

impl PathTarget {
    /// The mount, unless it is unmount-pending — a pending mount is
    /// invisible to new operations.
    pub(crate) fn live(&self) -> Option<&Arc<Mount>> {
        if self.mount.is_unmount_pending() {
            None
        } else {
            Some(&self.mount)
        }
    }
}

/// Result of the locked phase of an unmount.
pub(crate) enum UnmountOutcome {
    /// The record was detached immediately.
    Detached {
        /// Mount containing the mount point, for sub-mount accounting.
        parent: Option<Arc<Mount>>,
    },
    /// The mount point is still referenced; the record was marked
    /// pending and survives until the references drain.
    Pending {
        /// The now-pending mount, so the caller can notify its backend.
        mount: Arc<Mount>,
        /// Mount containing the mount point.
        parent: Option<Arc<Mount>>,
    },
}

fn unknown_node(node: NodeId) -> io::Error {
    error!(node, "node id not present in the table — peer protocol bug");
    io::Error::from_raw_os_error(libc::ENOENT)
}

/// The two-keyed store itself.
pub(crate) struct InodeTable {
    inner: RwLock<TableInner>,
}

#[expect(
    clippy::expect_used,
    reason = "RwLock poisoning is unrecoverable; panicking is the correct behavior"
)]
impl InodeTable {
    /// A table holding only the root entry, keyed `(0, "")`.
    pub(crate) fn new() -> Self {
        let mut by_id = FxHashMap::default();
        let mut by_name = FxHashMap::default();
        by_id.insert(
            ROOT_ID,
            InodeEntry {
                node_id: ROOT_ID,
                name: String::new(),
                parent: None,
                kind: libc::S_IFDIR,
                lookup_count: 0,
                ref_count: 0,
                linked: true,
                mount: None,
            },
        );
        by_name.insert((0, String::new()), ROOT_ID);
        Self {
            inner: RwLock::new(TableInner {
                by_id,
                by_name,
                next_node_id: ROOT_ID + 1,
            }),
        }
    }

    /// Record a successful peer lookup of `name` under `parent`.
    ///
    /// Returns the existing entry's id or creates a fresh one; either
    /// way the entry's lookup count is incremented and its type bits
    /// refreshed. The caller guarantees the backend already confirmed
    /// the name exists.
    pub(crate) fn register_lookup(
        &self,
        parent: NodeId,
        name: &str,
        kind: u32,
    ) -> io::Result<NodeId> {
        // Shared-lock fast path for the common repeat lookup.
        let existing = {
            let inner = self.inner.read().expect("poisoned");
            inner.by_name.get(&(parent, name.to_owned())).copied()
        };

        let mut inner = self.inner.write().expect("poisoned");
        let id = match existing {
            Some(id) if inner.by_id.contains_key(&id) => id,
            _ => {
                // Double-check under the exclusive lock: another caller
                // may have created (or removed) the entry since the read.
                let key = (parent, name.to_owned());
                if let Some(&id) = inner.by_name.get(&key) {
                    id
                } else {
                    if !inner.by_id.contains_key(&parent) {
                        return Err(unknown_node(parent));
                    }
                    let id = inner.next_node_id;
                    inner.next_node_id += 1;
                    inner.by_id.insert(
                        id,
                        InodeEntry {
                            node_id: id,
                            name: name.to_owned(),
                            parent: Some(parent),
                            kind,
                            lookup_count: 0,
                            ref_count: 0,
                            linked: true,
                            mount: None,
                        },
                    );
                    inner.by_name.insert(key, id);
                    if let Some(p) = inner.by_id.get_mut(&parent) {
                        p.ref_count += 1;
                    }
                    trace!(node = id, parent, name, "created entry");
                    id
                }
            }
        };

        let Some(entry) = inner.by_id.get_mut(&id) else {
            return Err(unknown_node(id));
        };
        entry.lookup_count += 1;
        entry.kind = kind;
        Ok(id)
    }

    /// Subtract `nlookup` from the entry's lookup count, evicting it
    /// (and cascading to drained ancestors) once nothing holds it.
    /// Never fails: a forget for an unknown node is only logged.
    pub(crate) fn forget_update(&self, node: NodeId, nlookup: u64) {
        let mut inner = self.inner.write().expect("poisoned");
        if let Some(entry) = inner.by_id.get_mut(&node) {
            // An overshooting forget drives the count to zero, not below:
            // a pinned entry (mount point, populated directory) must not
            // sit in the table with a negative count.
            let n = i64::try_from(nlookup).unwrap_or(i64::MAX);
            entry.lookup_count = entry.lookup_count.saturating_sub(n).max(0);
            trace!(node, lookup_count = entry.lookup_count, "forget");
            Self::maybe_evict(&mut inner, node);
        } else {
            warn!(node, "forget on unknown node");
        }
    }

    /// Drop the `(parent, name)` slot from the name index.
    ///
    /// The entry itself survives in the id index for as long as
    /// outstanding lookups or children keep it alive; it is simply no
    /// longer findable by name. Called regardless of backend success —
    /// the name is gone from the peer's view either way.
    pub(crate) fn unlink_update(&self, parent: NodeId, name: &str) {
        let mut inner = self.inner.write().expect("poisoned");
        let Some(id) = inner.by_name.remove(&(parent, name.to_owned())) else {
            return;
        };
        debug!(node = id, parent, name, "unlinked");
        if let Some(entry) = inner.by_id.get_mut(&id) {
            entry.linked = false;
        }
        if let Some(p) = inner.by_id.get_mut(&parent) {
            p.ref_count -= 1;
        }
        Self::maybe_evict(&mut inner, id);
        Self::maybe_evict(&mut inner, parent);
    }

    /// Re-key an entry after a rename the backend confirmed.
    ///
    /// A missing source key means the rename raced with an unlink or
    /// another rename and the stale notification is silently absorbed.
    /// An occupant of the destination key is *evicted*: reparented under
    /// the root with a reserved synthetic name, preserving its id so
    /// in-flight operations can still resolve it.
    pub(crate) fn rename_update(
        &self,
        old_parent: NodeId,
        old_name: &str,
        new_parent: NodeId,
        new_name: &str,
    ) {
        let mut inner = self.inner.write().expect("poisoned");
        let Some(id) = inner.by_name.remove(&(old_parent, old_name.to_owned())) else {
            debug!(old_parent, old_name, "rename source already gone");
            return;
        };
        if !inner.by_id.contains_key(&new_parent) {
            // Destination directory was forgotten mid-flight; the source
            // name is gone from the peer's view, so treat it as unlinked.
            warn!(new_parent, "rename destination parent unknown");
            if let Some(entry) = inner.by_id.get_mut(&id) {
                entry.linked = false;
            }
            if let Some(p) = inner.by_id.get_mut(&old_parent) {
                p.ref_count -= 1;
            }
            Self::maybe_evict(&mut inner, id);
            Self::maybe_evict(&mut inner, old_parent);
            return;
        }

        let moved_from = {
            let Some(entry) = inner.by_id.get_mut(&id) else {
                return;
            };
            let from = entry.parent;
            entry.parent = Some(new_parent);
            entry.name = new_name.to_owned();
            from
        };
        if moved_from != Some(new_parent) {
            if let Some(p) = inner.by_id.get_mut(&new_parent) {
                p.ref_count += 1;
            }
            if let Some(old) = moved_from
                && let Some(p) = inner.by_id.get_mut(&old)
            {
                p.ref_count -= 1;
            }
        }

        let new_key = (new_parent, new_name.to_owned());
        if let Some(victim) = inner.by_name.remove(&new_key)
            && inner.by_id.contains_key(&victim)
        {
            let serial = inner.next_node_id;
            inner.next_node_id += 1;
            let synthetic = format!("{RENAME_EVICTION_PREFIX}{serial}");
            debug!(node = victim, name = %synthetic, "evicting rename target");
            let victim_from = {
                let Some(v) = inner.by_id.get_mut(&victim) else {
                    unreachable!("checked above")
                };
                let from = v.parent;
                v.parent = Some(ROOT_ID);
                v.name = synthetic.clone();
                from
            };
            if victim_from != Some(ROOT_ID) {
                if let Some(root) = inner.by_id.get_mut(&ROOT_ID) {
                    root.ref_count += 1;
                }
                if let Some(old) = victim_from
                    && let Some(p) = inner.by_id.get_mut(&old)
                {
                    p.ref_count -= 1;
                }
            }
            inner.by_name.insert((ROOT_ID, synthetic), victim);
        }

        inner.by_name.insert(new_key, id);
        if moved_from != Some(new_parent)
            && let Some(old) = moved_from
        {
            Self::maybe_evict(&mut inner, old);
        }
    }

    /// Reconstruct `(path, mount)` for a node by walking parent links to
    /// the nearest mount boundary. The mount holder contributes no path
    /// component of its own.
    pub(crate) fn resolve(&self, node: NodeId) -> io::Result<PathTarget> {
        let inner = self.inner.read().expect("poisoned");
        let mut entry = inner.by_id.get(&node).ok_or_else(|| unknown_node(node))?;

        let mut components: Vec<&str> = Vec::new();
        let mount = loop {
            if let Some(mount) = &entry.mount {
                break Arc::clone(mount);
            }
            components.push(entry.name.as_str());
            let Some(parent_id) = entry.parent else {
                error!(node, "parent chain ended without a mount");
                debug_assert!(false, "every entry must live under some mount");
                return Err(io::Error::from_raw_os_error(libc::EIO));
            };
            entry = inner
                .by_id
                .get(&parent_id)
                .ok_or_else(|| unknown_node(parent_id))?;
        };

        components.reverse();
        Ok(PathTarget {
            path: components.join("/"),
            mount,
        })
    }

    /// Descend the cached tree from the root by path components.
    ///
    /// Only the human-facing mount surface uses this; a component that
    /// was never looked up is `ENOENT`.
    pub(crate) fn resolve_by_path(&self, path: &str) -> io::Result<NodeId> {
        let inner = self.inner.read().expect("poisoned");
        let mut node = ROOT_ID;
        for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            node = inner
                .by_name
                .get(&(node, component.to_owned()))
                .copied()
                .ok_or_else(|| {
                    debug!(path, component, "path component not cached");
                    io::Error::from_raw_os_error(libc::ENOENT)
                })?;
        }
        Ok(node)
    }

    /// Preconditions for mounting onto `node`: no cached children
    /// (`EBUSY`) and a directory (`EINVAL`). Checked before the backend
    /// is invoked.
    pub(crate) fn mount_checks(&self, node: NodeId) -> io::Result<()> {
        let inner = self.inner.read().expect("poisoned");
        let entry = inner.by_id.get(&node).ok_or_else(|| unknown_node(node))?;
        if entry.ref_count > 0 {
            debug!(node, ref_count = entry.ref_count, "mount target busy");
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        if !is_dir_kind(entry.kind) {
            debug!(node, kind = entry.kind, "mount target is not a directory");
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(())
    }

    /// Attach a mount record to `node`, returning the mount containing
    /// it (if any) for sub-mount accounting.
    pub(crate) fn attach_mount(
        &self,
        node: NodeId,
        mount: Arc<Mount>,
    ) -> io::Result<Option<Arc<Mount>>> {
        let mut inner = self.inner.write().expect("poisoned");
        let parent = inner
            .by_id
            .get(&node)
            .ok_or_else(|| unknown_node(node))?
            .parent;
        let parent_mount = parent.and_then(|p| Self::nearest_mount(&inner, p));
        if let Some(entry) = inner.by_id.get_mut(&node) {
            entry.mount = Some(mount);
        }
        Ok(parent_mount)
    }

    /// Locked phase of an unmount: the busy check and either immediate
    /// detach or the transition to unmount-pending.
    pub(crate) fn begin_unmount(&self, node: NodeId) -> io::Result<UnmountOutcome> {
        let mut inner = self.inner.write().expect("poisoned");
        let (mount, parent, referenced) = {
            let entry = inner.by_id.get(&node).ok_or_else(|| unknown_node(node))?;
            let Some(mount) = entry.mount.clone() else {
                warn!(node, "unmount target has no mount bound");
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            };
            (mount, entry.parent, entry.ref_count > 0)
        };
        if mount.busy() {
            debug!(node, ?mount, "unmount target busy");
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        let parent = parent.and_then(|p| Self::nearest_mount(&inner, p));
        if referenced {
            mount.set_unmount_pending();
            Ok(UnmountOutcome::Pending { mount, parent })
        } else {
            if let Some(entry) = inner.by_id.get_mut(&node) {
                entry.mount = None;
            }
            Self::maybe_evict(&mut inner, node);
            Ok(UnmountOutcome::Detached { parent })
        }
    }

    /// Walk up from `start` to the first entry carrying a mount record.
    fn nearest_mount(inner: &TableInner, start: NodeId) -> Option<Arc<Mount>> {
        let mut id = start;
        loop {
            let entry = inner.by_id.get(&id)?;
            if let Some(mount) = &entry.mount {
                return Some(Arc::clone(mount));
            }
            id = entry.parent?;
        }
    }

    /// Remove `start` if nothing holds it any more, cascading to
    /// ancestors whose last reference this removal released.
    ///
    /// An entry stays while any of these hold: it is the root, it has
    /// outstanding lookups, it has name-linked children, or it is the
    /// mount point of a live (non-pending) mount.
    fn maybe_evict(inner: &mut TableInner, start: NodeId) {
        let mut id = start;
        loop {
            let Some(entry) = inner.by_id.get(&id) else {
                return;
            };
            if id == ROOT_ID || entry.lookup_count > 0 || entry.ref_count > 0 {
                return;
            }
            if let Some(mount) = &entry.mount
                && !mount.is_unmount_pending()
            {
                return;
            }
            let Some(entry) = inner.by_id.remove(&id) else {
                return;
            };
            trace!(node = entry.node_id, "evicting entry");
            if !entry.linked {
                // The unlink that delinked it already released the
                // parent reference.
                return;
            }
            inner.by_name.remove(&entry.name_key());
            let Some(parent_id) = entry.parent else {
                return;
            };
            let Some(parent) = inner.by_id.get_mut(&parent_id) else {
                return;
            };
            parent.ref_count -= 1;
            id = parent_id;
        }
    }
}

#[cfg(test)]
#[expect(
    clippy::expect_used,
    reason = "RwLock poisoning is unrecoverable; panicking is the correct behavior"
)]
impl InodeTable {
    pub(crate) fn contains_id(&self, node: NodeId) -> bool {
        self.inner.read().expect("poisoned").by_id.contains_key(&node)
    }

    pub(crate) fn contains_name(&self, parent: NodeId, name: &str) -> bool {
        self.inner
            .read()
            .expect("poisoned")
            .by_name
            .contains_key(&(parent, name.to_owned()))
    }

    pub(crate) fn name_of(&self, node: NodeId) -> Option<String> {
        self.inner
            .read()
            .expect("poisoned")
            .by_id
            .get(&node)
            .map(|e| e.name.clone())
    }

    pub(crate) fn counters_of(&self, node: NodeId) -> Option<(i64, i64)> {
        self.inner
            .read()
            .expect("poisoned")
            .by_id
            .get(&node)
            .map(|e| (e.lookup_count, e.ref_count))
    }

    /// Assert every documented structural invariant over the whole
    /// table. Meant to be called after each mutation in tests.
    pub(crate) fn check_invariants(&self) {
        let inner = self.inner.read().expect("poisoned");

        for (id, entry) in &inner.by_id {
            assert_eq!(*id, entry.node_id, "id index key must match entry");
            assert!(entry.lookup_count >= 0, "negative lookup_count on {id}");
            assert!(entry.ref_count >= 0, "negative ref_count on {id}");
            assert!(
                entry.ref_count > 0
                    || entry.lookup_count > 0
                    || *id == ROOT_ID
                    || entry.mount.is_some(),
                "entry {id} is unreachable yet still stored"
            );

            // Parent chains must terminate at the root, cycle-free.
            let mut cursor = entry.parent;
            let mut steps = 0usize;
            while let Some(parent_id) = cursor {
                assert!(steps <= inner.by_id.len(), "parent cycle via {id}");
                let parent = inner
                    .by_id
                    .get(&parent_id)
                    .unwrap_or_else(|| panic!("entry {id} has dangling parent {parent_id}"));
                cursor = parent.parent;
                steps += 1;
            }
        }

        let mut linked_children: FxHashMap<NodeId, i64> = FxHashMap::default();
        for ((parent_id, name), id) in &inner.by_name {
            let entry = inner
                .by_id
                .get(id)
                .unwrap_or_else(|| panic!("name index points at missing id {id}"));
            assert!(entry.linked, "name-indexed entry {id} not marked linked");
            assert_eq!(entry.parent.unwrap_or(0), *parent_id);
            assert_eq!(&entry.name, name);
            if *id != ROOT_ID {
                *linked_children.entry(*parent_id).or_default() += 1;
            }
        }
        for (id, entry) in &inner.by_id {
            assert_eq!(
                entry.ref_count,
                linked_children.get(id).copied().unwrap_or(0),
                "ref_count of {id} disagrees with its linked children"
            );
        }
    }
}
