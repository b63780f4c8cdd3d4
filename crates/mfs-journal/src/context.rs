//! Subsystem contracts consumed by the journaling core.
//!
//! Journal entries never hold references into the cache; they carry stable
//! identifiers and navigate through these traits at expire/replay time. The
//! [`Mds`] context bundles one handle per subsystem for the duration of a
//! single event-loop call.
//!
//! Directory operations are keyed by [`DirFragId`] (and dentry operations
//! by fragment + name) rather than returning borrowed directory handles;
//! replay interleaves directory and inode surgery, and identifier-keyed
//! calls keep the cache as the single owner of that graph.

use crate::completion::Completion;
use crate::metablob::MetaBlob;
use mfs_types::{
    Anchor, AnchorTxId, AuthPair, ClientId, DirFragId, IdNo, InodeNo, InodeRecord, LogOffset,
    NodeId, ReqId, Version,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// What a cached dentry currently points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DentryLink {
    /// Negative dentry.
    Null,
    /// Primary link to a locally cached inode.
    Primary(InodeNo),
    /// Remote link to an inode whose primary lives elsewhere.
    Remote(InodeNo),
}

/// Waiter lists a directory fragment exposes to the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DirWaiter {
    /// Fires when the dir thaws and can be auth-pinned again.
    AuthPinnable,
    /// Fires when the subtree import covering the dir completes.
    Imported,
}

/// The metadata cache surface the journal depends on.
pub trait MetaCache {
    // Directory fragments.
    fn dirfrag_cached(&self, frag: DirFragId) -> bool;
    fn dir_authority(&self, frag: DirFragId) -> AuthPair;
    fn dir_committed_version(&self, frag: DirFragId) -> Version;
    fn dir_is_ambiguous_auth(&self, frag: DirFragId) -> bool;
    fn dir_is_exporting(&self, frag: DirFragId) -> bool;
    fn dir_can_auth_pin(&self, frag: DirFragId) -> bool;
    fn subtree_root(&self, frag: DirFragId) -> DirFragId;
    fn has_subtrees(&self) -> bool;

    /// Get-or-open a fragment. The containing inode must already be cached.
    fn open_dirfrag(&mut self, frag: DirFragId);
    fn set_dir_auth(&mut self, frag: DirFragId, auth: AuthPair);
    fn set_dir_version(&mut self, frag: DirFragId, version: Version);
    fn mark_dir_dirty(&mut self, frag: DirFragId);
    fn mark_dir_complete(&mut self, frag: DirFragId);

    /// Submit a commit of the fragment up through `want`; `c` fires when
    /// the committed version reaches it. Duplicate requests collapse to the
    /// maximum target.
    fn commit_dir(&mut self, frag: DirFragId, want: Version, c: Completion);
    fn add_dir_waiter(&mut self, frag: DirFragId, wait: DirWaiter, c: Completion);

    // Dentries.
    fn dentry_link(&self, frag: DirFragId, name: &str) -> Option<DentryLink>;
    fn add_dentry(&mut self, frag: DirFragId, name: &str);
    fn set_dentry_version(&mut self, frag: DirFragId, name: &str, version: Version);
    fn mark_dentry_dirty(&mut self, frag: DirFragId, name: &str);
    /// Detach whatever the dentry links, leaving it negative.
    fn unlink_dentry(&mut self, frag: DirFragId, name: &str);

    // Inodes.
    fn inode_cached(&self, ino: InodeNo) -> bool;
    fn inode_has_caps(&self, ino: InodeNo) -> bool;
    fn last_open_journaled(&self, ino: InodeNo) -> LogOffset;
    fn inode_primary_parent(&self, ino: InodeNo) -> Option<(DirFragId, String)>;
    fn create_root_inode(&mut self);
    fn create_stray_inode(&mut self, node: NodeId);
    fn add_inode(&mut self, record: InodeRecord, symlink: Option<&str>);
    /// Update a cached inode's record in place.
    fn update_inode(&mut self, record: InodeRecord, symlink: Option<&str>);
    fn link_primary(&mut self, frag: DirFragId, name: &str, ino: InodeNo);
    fn link_remote(&mut self, frag: DirFragId, name: &str, ino: InodeNo);
    fn mark_inode_dirty(&mut self, ino: InodeNo);

    // Purge queue.
    fn is_purging(&self, ino: InodeNo, size: u64) -> bool;
    fn wait_for_purge(&mut self, ino: InodeNo, size: u64, c: Completion);
    fn add_recovered_purge(&mut self, record: InodeRecord, size: u64);
    fn remove_recovered_purge(&mut self, ino: InodeNo, size: u64);

    // Subtree authority.
    fn adjust_subtree_auth(&mut self, frag: DirFragId, node: NodeId);
    fn adjust_bounded_subtree_auth(
        &mut self,
        base: DirFragId,
        bounds: &BTreeSet<DirFragId>,
        auth: AuthPair,
    );
    fn try_subtree_merge(&mut self, base: DirFragId);
    fn add_ambiguous_import(&mut self, base: DirFragId, bounds: &BTreeSet<DirFragId>);
    fn finish_ambiguous_import(&mut self, base: DirFragId);
    fn cancel_ambiguous_import(&mut self, base: DirFragId);

    // Prepared but uncommitted slave transactions, keyed by request.
    fn has_uncommitted_slave_update(&self, reqid: ReqId) -> bool;
    fn store_uncommitted_slave_update(&mut self, reqid: ReqId, blob: MetaBlob);
    fn take_uncommitted_slave_update(&mut self, reqid: ReqId) -> Option<MetaBlob>;
}

/// The subtree migrator's export-side surface.
pub trait Migrator {
    fn is_exporting(&self, frag: DirFragId) -> bool;
    fn add_export_finish_waiter(&mut self, frag: DirFragId, c: Completion);
}

/// The cluster anchor table (authoritative side of the two-phase protocol).
pub trait AnchorTable {
    fn version(&self) -> Version;
    fn committed_version(&self) -> Version;
    /// Persist the table; `c` fires once the save is durable.
    fn save(&mut self, c: Completion);
    fn create_prepare(&mut self, ino: InodeNo, trace: &[Anchor], reqmds: NodeId);
    fn destroy_prepare(&mut self, ino: InodeNo, reqmds: NodeId);
    fn update_prepare(&mut self, ino: InodeNo, trace: &[Anchor], reqmds: NodeId);
    fn commit(&mut self, atid: AnchorTxId);
}

/// Our participant side of anchor-table transactions.
pub trait AnchorClient {
    fn has_committed(&self, atid: AnchorTxId) -> bool;
    fn wait_for_ack(&mut self, atid: AnchorTxId, c: Completion);
    /// The prepare for `atid` is durably journaled.
    fn got_journaled_agree(&mut self, atid: AnchorTxId);
    /// The table's ack for `atid` is durably journaled.
    fn got_journaled_ack(&mut self, atid: AnchorTxId);
}

/// Live instance of a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInst {
    pub id: ClientId,
    pub addr: String,
}

/// Serialized form of the whole session map, as journaled by a
/// [`ClientMap`](crate::events::ClientMap) checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionMapSnapshot {
    pub version: Version,
    pub sessions: BTreeMap<ClientId, ClientInst>,
}

/// The client session map.
///
/// `version` advances with every session open/close; `committing` marks a
/// version with a write in flight and `committed` the last durable one.
pub trait SessionMap {
    fn version(&self) -> Version;
    fn committed(&self) -> Version;
    fn committing(&self) -> Version;
    fn set_committed(&mut self, version: Version);
    fn set_committing(&mut self, version: Version);
    fn add_commit_waiter(&mut self, c: Completion);

    /// True while `reqid` sits in the completed-request set awaiting trim.
    fn have_completed_request(&self, reqid: ReqId) -> bool;
    fn add_trim_waiter(&mut self, reqid: ReqId, c: Completion);
    fn add_completed_request(&mut self, reqid: ReqId);

    fn open_session(&mut self, inst: &ClientInst);
    fn close_session(&mut self, client: ClientId);
    /// Replace the live map with a journaled snapshot.
    fn load(&mut self, snapshot: &SessionMapSnapshot);
    /// Collapse projected state back onto the live version.
    fn reset_projected(&mut self);
}

/// The id allocator table.
pub trait IdAlloc {
    fn version(&self) -> Version;
    fn committed_version(&self) -> Version;
    /// Persist the table at `version`; `c` fires once durable.
    fn save(&mut self, c: Completion, version: Version);
    fn alloc_id(&mut self, replaying: bool) -> IdNo;
    fn reclaim_id(&mut self, id: IdNo, replaying: bool);
}

/// Journal-global state the trimmer and events consult.
pub trait LogStatus {
    /// Watermark of the most recent authority checkpoint written: entries
    /// that end at or before it are covered by a newer checkpoint.
    fn last_import_map(&self) -> LogOffset;
    /// Capped: shutting down, no further entries will be appended.
    fn is_capped(&self) -> bool;
    /// `c` fires when the next authority checkpoint is written (or at
    /// shutdown).
    fn add_import_map_expire_waiter(&mut self, c: Completion);
}

/// Server-side hooks for re-journaling open-file state and the session map.
pub trait Server {
    fn queue_journal_open(&mut self, ino: InodeNo);
    fn add_journal_open_waiter(&mut self, c: Completion);
    /// Flush queued opens into a fresh journal entry if any are pending.
    fn maybe_journal_opens(&mut self);
    /// Journal a fresh session-map checkpoint; `c` fires when it commits.
    fn log_clientmap(&mut self, c: Completion);
}

/// Borrowed handles to every subsystem an event may touch, plus our own
/// rank. Built per call; events hold it only for the duration of
/// `has_expired`, `expire`, or `replay`.
pub struct Mds<'a> {
    pub node: NodeId,
    pub cache: &'a mut dyn MetaCache,
    pub migrator: &'a mut dyn Migrator,
    pub anchor_table: &'a mut dyn AnchorTable,
    pub anchor_client: &'a mut dyn AnchorClient,
    pub session_map: &'a mut dyn SessionMap,
    pub id_alloc: &'a mut dyn IdAlloc,
    pub log: &'a mut dyn LogStatus,
    pub server: &'a mut dyn Server,
}
