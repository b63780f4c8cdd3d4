#![forbid(unsafe_code)]
//! Identifier and version newtypes shared across the MarlinFS MDS.
//!
//! Everything table-like in the MDS (directory fragments, the id allocator,
//! the anchor table, the client map) carries a monotonically increasing
//! [`Version`]. Journal entries record the version they produce; a table
//! whose committed version has caught up no longer needs the entry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of MDS nodes a cluster may contain. Stray directories reserve one
/// well-known inode per node.
pub const MAX_NODES: u64 = 0x100;

/// First inode number of the per-node stray directory range.
pub const STRAY_BASE: u64 = 0x100;

/// Rank of an MDS node within the cluster.
///
/// `NodeId::NONE` (-2) is the "no authority" sentinel used in authority
/// pairs while a subtree is mid-migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub i32);

impl NodeId {
    pub const NONE: Self = Self(-2);
}

/// The (primary, secondary) authority pair for a subtree.
///
/// A settled subtree has `(owner, NONE)`; during export/import the second
/// component names the other party and the pair is ambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPair(pub NodeId, pub NodeId);

impl AuthPair {
    pub const UNKNOWN: Self = Self(NodeId::NONE, NodeId::NONE);

    #[must_use]
    pub fn solo(node: NodeId) -> Self {
        Self(node, NodeId::NONE)
    }

    #[must_use]
    pub fn first(self) -> NodeId {
        self.0
    }

    #[must_use]
    pub fn second(self) -> NodeId {
        self.1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNo(pub u64);

impl InodeNo {
    pub const ROOT: Self = Self(1);

    /// Stray directory inode owned by `node`.
    #[must_use]
    pub fn stray(node: NodeId) -> Self {
        Self(STRAY_BASE + node.0 as u64)
    }

    /// Whether this inode is in the well-known stray range.
    #[must_use]
    pub fn is_stray(self) -> bool {
        (STRAY_BASE..STRAY_BASE + MAX_NODES).contains(&self.0)
    }

    /// The node whose stray directory this is. Only meaningful when
    /// [`is_stray`](Self::is_stray) holds.
    #[must_use]
    #[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn stray_owner(self) -> NodeId {
        NodeId((self.0 - STRAY_BASE) as i32)
    }
}

/// Fragment of a directory's hash space. `FragId::WHOLE` covers the entire
/// directory; sharded directories are not yet journaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FragId(pub u32);

impl FragId {
    pub const WHOLE: Self = Self(0);
}

/// Identifies one directory fragment: the unit of caching, commit, and
/// migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DirFragId {
    pub ino: InodeNo,
    pub frag: FragId,
}

impl DirFragId {
    #[must_use]
    pub fn whole(ino: InodeNo) -> Self {
        Self {
            ino,
            frag: FragId::WHOLE,
        }
    }
}

/// Monotonically increasing version of a table or directory fragment.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Version(pub u64);

impl Version {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Byte offset into the journal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct LogOffset(pub u64);

/// Anchor-table transaction id, assigned by the table's prepare phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AnchorTxId(pub u64);

/// Id handed out by the id allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdNo(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u64);

/// Identifies one client metadata request: the issuing client plus its
/// per-client transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReqId {
    pub client: ClientId,
    pub tid: u64,
}

impl ReqId {
    #[must_use]
    pub fn new(client: ClientId, tid: u64) -> Self {
        Self { client, tid }
    }
}

/// The inode payload carried by a journaled full dentry and by truncation
/// records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRecord {
    pub ino: InodeNo,
    pub size: u64,
}

/// An anchor: a pin recording that `ino` is reachable through `dirfrag`,
/// allowing cross-subtree references to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub ino: InodeNo,
    pub dirfrag: DirFragId,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for FragId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DirFragId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.ino, self.frag)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LogOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for AnchorTxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for IdNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client{}", self.0)
    }
}

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client, self.tid)
    }
}
