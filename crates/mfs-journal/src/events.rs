//! The journal event set.
//!
//! Namespace events (`Update`, `SlaveUpdate`, `Open`) wrap a [`MetaBlob`]
//! with operation-specific replay semantics; subtree events (`Export`,
//! `ImportStart`, `ImportFinish`, `ImportMap`) record authority changes;
//! the rest track auxiliary tables. Dispatch lives on
//! [`LogEvent`](crate::LogEvent).

use crate::completion::Completion;
use crate::context::{ClientInst, Mds, SessionMapSnapshot};
use crate::metablob::MetaBlob;
use mfs_error::{MdsError, Result};
use mfs_types::{
    Anchor, AnchorTxId, AuthPair, DirFragId, IdNo, InodeNo, LogOffset, NodeId, ReqId, Version,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Inert heartbeat entry; never waits for anything, changes nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub msg: String,
}

impl Marker {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { msg: msg.into() }
    }

    pub(crate) fn replay(&self, _mds: &mut Mds<'_>) {
        debug!(msg = %self.msg, "marker replayed");
    }
}

/// A committed namespace mutation: pure MetaBlob semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub blob: MetaBlob,
}

impl Update {
    #[must_use]
    pub fn new(blob: MetaBlob) -> Self {
        Self { blob }
    }
}

/// Role of a slave-transaction entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlaveOp {
    Prepare,
    Commit,
    Abort,
}

/// Participant-side record of a distributed transaction led by another MDS.
///
/// A `Prepare` parks its blob; only a later `Commit` applies it, and an
/// `Abort` discards it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveUpdate {
    pub op: SlaveOp,
    pub reqid: ReqId,
    pub blob: MetaBlob,
}

impl SlaveUpdate {
    pub(crate) fn replay(&self, mds: &mut Mds<'_>) -> Result<()> {
        match self.op {
            SlaveOp::Prepare => {
                debug!(reqid = %self.reqid, "parking prepared slave blob");
                if mds.cache.has_uncommitted_slave_update(self.reqid) {
                    return Err(MdsError::DuplicatePrepare(self.reqid.to_string()));
                }
                mds.cache
                    .store_uncommitted_slave_update(self.reqid, self.blob.clone());
                Ok(())
            }
            SlaveOp::Commit => {
                if let Some(blob) = mds.cache.take_uncommitted_slave_update(self.reqid) {
                    debug!(reqid = %self.reqid, "applying prepared slave blob");
                    blob.replay(mds)
                } else {
                    debug!(reqid = %self.reqid, "commit without prepared blob, ignoring");
                    Ok(())
                }
            }
            SlaveOp::Abort => {
                if mds.cache.take_uncommitted_slave_update(self.reqid).is_some() {
                    debug!(reqid = %self.reqid, "discarding prepared slave blob");
                } else {
                    debug!(reqid = %self.reqid, "abort without prepared blob, ignoring");
                }
                Ok(())
            }
        }
    }
}

/// Records which inodes held client capabilities when journaled.
///
/// Stays live while any of those inodes still holds caps and no later open
/// record supersedes this one; expiring it re-journals a fresh record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Open {
    pub inos: Vec<InodeNo>,
    pub blob: MetaBlob,
    /// Start offset in the log; assigned at placement, not encoded.
    #[serde(skip)]
    pub start: LogOffset,
}

impl Open {
    #[must_use]
    pub fn new(inos: Vec<InodeNo>, blob: MetaBlob) -> Self {
        Self {
            inos,
            blob,
            start: LogOffset(0),
        }
    }

    pub(crate) fn has_expired(&self, mds: &Mds<'_>) -> bool {
        for ino in &self.inos {
            if !mds.cache.inode_cached(*ino) || !mds.cache.inode_has_caps(*ino) {
                continue;
            }
            let last = mds.cache.last_open_journaled(*ino);
            // A later record supersedes us; zero means the record was lost
            // across recovery and nothing holds us live.
            if last > self.start || last == LogOffset(0) {
                continue;
            }
            debug!(%ino, %last, "open record still covers live caps");
            return false;
        }
        true
    }

    pub(crate) fn expire(&self, mds: &mut Mds<'_>, c: Completion) -> Result<()> {
        if mds.log.is_capped() {
            warn!("log capped with unexpired open records");
            return Err(MdsError::CappedOpens);
        }

        for ino in &self.inos {
            if !mds.cache.inode_cached(*ino) || !mds.cache.inode_has_caps(*ino) {
                continue;
            }
            debug!(%ino, last = %mds.cache.last_open_journaled(*ino), "re-journaling open");
            mds.server.queue_journal_open(*ino);
        }
        mds.server.add_journal_open_waiter(c);
        mds.server.maybe_journal_opens();
        Ok(())
    }
}

/// We handed a subtree to another MDS; its final state rides in the blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Export {
    pub base: DirFragId,
    pub bounds: BTreeSet<DirFragId>,
    pub blob: MetaBlob,
}

impl Export {
    pub(crate) fn has_expired(&self, mds: &Mds<'_>) -> bool {
        if !mds.cache.dirfrag_cached(self.base) {
            return true;
        }
        if !mds.migrator.is_exporting(self.base) {
            return true;
        }
        debug!(base = %self.base, "still exporting");
        false
    }

    pub(crate) fn expire(&self, mds: &mut Mds<'_>, c: Completion) -> Result<()> {
        if !mds.cache.dirfrag_cached(self.base) || !mds.migrator.is_exporting(self.base) {
            return Err(MdsError::ExportNotActive(self.base.to_string()));
        }
        debug!(base = %self.base, "waiting for export to finish");
        mds.migrator.add_export_finish_waiter(self.base, c);
        Ok(())
    }

    pub(crate) fn replay(&self, mds: &mut Mds<'_>) -> Result<()> {
        debug!(base = %self.base, "replaying export");
        self.blob.replay(mds)?;
        mds.cache
            .adjust_bounded_subtree_auth(self.base, &self.bounds, AuthPair::UNKNOWN);
        mds.cache.try_subtree_merge(self.base);
        Ok(())
    }
}

/// We received a subtree; its outcome is settled by a later
/// [`ImportFinish`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportStart {
    pub base: DirFragId,
    pub bounds: BTreeSet<DirFragId>,
    pub blob: MetaBlob,
}

impl ImportStart {
    pub(crate) fn replay(&self, mds: &mut Mds<'_>) -> Result<()> {
        debug!(base = %self.base, "replaying import start");
        self.blob.replay(mds)?;
        mds.cache.add_ambiguous_import(self.base, &self.bounds);
        Ok(())
    }
}

/// Settles an ambiguous import one way or the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportFinish {
    pub base: DirFragId,
    pub success: bool,
}

impl ImportFinish {
    pub(crate) fn replay(&self, mds: &mut Mds<'_>) {
        debug!(base = %self.base, success = self.success, "replaying import finish");
        if self.success {
            mds.cache.finish_ambiguous_import(self.base);
        } else {
            mds.cache.cancel_ambiguous_import(self.base);
        }
    }
}

/// Periodic checkpoint of our authoritative subtree roots, with their
/// spanning tree in the blob. Replay keeps the first (newest) one seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportMap {
    pub imports: BTreeSet<DirFragId>,
    pub blob: MetaBlob,
    /// End offset in the log; assigned at placement, not encoded.
    #[serde(skip)]
    pub end: LogOffset,
}

impl ImportMap {
    pub(crate) fn has_expired(&self, mds: &Mds<'_>) -> bool {
        if mds.log.last_import_map() > self.end {
            debug!("newer authority checkpoint exists");
            true
        } else if mds.log.is_capped() {
            debug!("log capped, letting authority checkpoint expire");
            true
        } else {
            false
        }
    }

    pub(crate) fn expire(&self, mds: &mut Mds<'_>, c: Completion) {
        debug!("waiting for a newer authority checkpoint (or shutdown)");
        mds.log.add_import_map_expire_waiter(c);
    }

    pub(crate) fn replay(&self, mds: &mut Mds<'_>) -> Result<()> {
        if mds.cache.has_subtrees() {
            debug!("already have a subtree map, ignoring older checkpoint");
            return Ok(());
        }
        debug!(roots = self.imports.len(), "reconstructing subtree authority");
        self.blob.replay(mds)?;
        for frag in &self.imports {
            mds.cache.adjust_subtree_auth(*frag, mds.node);
        }
        Ok(())
    }
}

/// What an id-allocator entry did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocOp {
    Alloc,
    Free,
}

/// One id-allocator table mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alloc {
    pub what: AllocOp,
    pub id: IdNo,
    pub table_version: Version,
}

impl Alloc {
    pub(crate) fn has_expired(&self, mds: &Mds<'_>) -> bool {
        let cv = mds.id_alloc.committed_version();
        if cv < self.table_version {
            debug!(event = %self.table_version, committed = %cv, "idalloc still dirty");
            false
        } else {
            true
        }
    }

    pub(crate) fn expire(&self, mds: &mut Mds<'_>, c: Completion) {
        debug!("saving idalloc table");
        mds.id_alloc.save(c, self.table_version);
    }

    pub(crate) fn replay(&self, mds: &mut Mds<'_>) -> Result<()> {
        if mds.id_alloc.version() >= self.table_version {
            debug!(event = %self.table_version, table = %mds.id_alloc.version(), "idalloc already current");
            return Ok(());
        }
        if mds.id_alloc.version().next() != self.table_version {
            return Err(MdsError::ReplayOrder {
                table: "idalloc",
                event: self.table_version.0,
                found: mds.id_alloc.version().0,
            });
        }

        match self.what {
            AllocOp::Alloc => {
                let got = mds.id_alloc.alloc_id(true);
                if got != self.id {
                    return Err(MdsError::AllocMismatch {
                        want: self.id.0,
                        got: got.0,
                    });
                }
            }
            AllocOp::Free => mds.id_alloc.reclaim_id(self.id, true),
        }

        if mds.id_alloc.version() != self.table_version {
            return Err(MdsError::ReplayOrder {
                table: "idalloc",
                event: self.table_version.0,
                found: mds.id_alloc.version().0,
            });
        }
        Ok(())
    }
}

/// Anchor-table operation carried by an [`AnchorTxn`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnchorOp {
    CreatePrepare,
    DestroyPrepare,
    UpdatePrepare,
    Commit,
}

/// One step of an anchor-table transaction, as journaled by the table's
/// authority. Each entry advances the table by exactly one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorTxn {
    pub op: AnchorOp,
    pub ino: InodeNo,
    pub trace: Vec<Anchor>,
    pub reqmds: NodeId,
    pub atid: AnchorTxId,
    pub version: Version,
}

impl AnchorTxn {
    pub(crate) fn has_expired(&self, mds: &Mds<'_>) -> bool {
        let cv = mds.anchor_table.committed_version();
        if cv < self.version {
            debug!(event = %self.version, committed = %cv, "anchor table still dirty");
            false
        } else {
            true
        }
    }

    pub(crate) fn expire(&self, mds: &mut Mds<'_>, c: Completion) {
        debug!("saving anchor table");
        mds.anchor_table.save(c);
    }

    pub(crate) fn replay(&self, mds: &mut Mds<'_>) -> Result<()> {
        if mds.anchor_table.version() >= self.version {
            debug!(event = %self.version, table = %mds.anchor_table.version(), "anchor table already current");
            return Ok(());
        }
        if mds.anchor_table.version().next() != self.version {
            return Err(MdsError::ReplayOrder {
                table: "anchor",
                event: self.version.0,
                found: mds.anchor_table.version().0,
            });
        }

        match self.op {
            AnchorOp::CreatePrepare => {
                mds.anchor_table
                    .create_prepare(self.ino, &self.trace, self.reqmds);
            }
            AnchorOp::DestroyPrepare => mds.anchor_table.destroy_prepare(self.ino, self.reqmds),
            AnchorOp::UpdatePrepare => {
                mds.anchor_table
                    .update_prepare(self.ino, &self.trace, self.reqmds);
            }
            AnchorOp::Commit => mds.anchor_table.commit(self.atid),
        }

        if mds.anchor_table.version() != self.version {
            return Err(MdsError::ReplayOrder {
                table: "anchor",
                event: self.version.0,
                found: mds.anchor_table.version().0,
            });
        }
        Ok(())
    }
}

/// Participant-side note that the table acked `atid`. Replay-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorAck {
    pub atid: AnchorTxId,
}

impl AnchorAck {
    pub(crate) fn replay(&self, mds: &mut Mds<'_>) {
        debug!(atid = %self.atid, "replaying anchor ack");
        mds.anchor_client.got_journaled_ack(self.atid);
    }
}

/// Full checkpoint of the client session map at version `cmapv`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMap {
    pub map: SessionMapSnapshot,
    pub cmapv: Version,
}

impl ClientMap {
    pub(crate) fn replay(&self, mds: &mut Mds<'_>) {
        debug!(cmapv = %self.cmapv, "replaying session map snapshot");
        mds.session_map.load(&self.map);
        let v = mds.session_map.version();
        mds.session_map.set_committed(v);
        mds.session_map.set_committing(v);
    }
}

/// One session open/close at session-map version `cmapv`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub open: bool,
    pub inst: ClientInst,
    pub cmapv: Version,
}

impl Session {
    pub(crate) fn replay(&self, mds: &mut Mds<'_>) {
        debug!(client = %self.inst.id, open = self.open, "replaying session");
        if self.open {
            mds.session_map.open_session(&self.inst);
        } else {
            mds.session_map.close_session(self.inst.id);
        }
        mds.session_map.reset_projected();
    }
}

/// A truncation purge completed; replay drops the recovered-purge record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeFinish {
    pub ino: InodeNo,
    pub newsize: u64,
}

impl PurgeFinish {
    pub(crate) fn replay(&self, mds: &mut Mds<'_>) {
        debug!(ino = %self.ino, newsize = self.newsize, "replaying purge finish");
        mds.cache.remove_recovered_purge(self.ino, self.newsize);
    }
}

/// Shared expiration gate for entries that ride on the session map's
/// committed version: expired once `committed >= cmapv`.
pub(crate) fn session_map_expired(mds: &Mds<'_>, cmapv: Version) -> bool {
    if mds.session_map.committed() >= cmapv {
        true
    } else if mds.session_map.committing() >= cmapv {
        debug!(%cmapv, committing = %mds.session_map.committing(), "session map commit in flight");
        false
    } else {
        debug!(%cmapv, committed = %mds.session_map.committed(), "session map not committed");
        false
    }
}

/// Shared expire path for session-map-gated entries: piggyback on an
/// in-flight commit covering `cmapv`, or start a fresh one.
pub(crate) fn session_map_expire(mds: &mut Mds<'_>, cmapv: Version, c: Completion) {
    if mds.session_map.committing() >= cmapv {
        debug!(%cmapv, "waiting on in-flight session map commit");
        mds.session_map.add_commit_waiter(c);
    } else {
        debug!(%cmapv, "journaling session map");
        mds.server.log_clientmap(c);
    }
}
