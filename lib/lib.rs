//! pathfs — a path-based filesystem connector.
//!
//! Bridges a kernel-style filesystem protocol, whose peer addresses
//! objects by opaque numeric node ids, to backend filesystems that
//! operate purely on absolute string paths. The connector owns the
//! node-id ↔ path mapping, keeps a directory-entry cache mirroring the
//! peer's view, and supports grafting independent backends onto
//! distinct directories.

/// Connector core, protocol types, and backend capabilities.
pub mod fs;
