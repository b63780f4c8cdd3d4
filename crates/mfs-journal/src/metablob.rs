//! The namespace mutation payload embedded in most journal entries.
//!
//! A `MetaBlob` is an ordered batch of directory-fragment mutations plus
//! tie-ins to the anchor table, the purge queue, and the client request
//! tracker. A journaled blob has expired once every fragment it touches is
//! either committed through the recorded version, expired from the cache,
//! or no longer ours, and every side table it references is durable.

use crate::completion::{Completion, Gather};
use crate::context::{DentryLink, DirWaiter, Mds};
use mfs_error::{MdsError, Result};
use mfs_types::{AnchorTxId, AuthPair, DirFragId, InodeNo, InodeRecord, ReqId, Version};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// A journaled dentry with its primary inode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullBit {
    pub name: String,
    pub dnv: Version,
    pub dirty: bool,
    pub inode: InodeRecord,
    pub symlink: Option<String>,
}

/// A journaled dentry holding a remote link to a foreign inode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteBit {
    pub name: String,
    pub dnv: Version,
    pub dirty: bool,
    pub ino: InodeNo,
}

/// A journaled negative dentry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NullBit {
    pub name: String,
    pub dnv: Version,
    pub dirty: bool,
}

/// All mutations targeting a single directory fragment.
///
/// `dirv` is the version the fragment reaches after the lump applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirLump {
    pub dirv: Version,
    pub dirty: bool,
    pub complete: bool,
    full: Vec<FullBit>,
    remote: Vec<RemoteBit>,
    null: Vec<NullBit>,
}

impl DirLump {
    fn new(dirv: Version, dirty: bool, complete: bool) -> Self {
        Self {
            dirv,
            dirty,
            complete,
            full: Vec::new(),
            remote: Vec::new(),
            null: Vec::new(),
        }
    }

    pub fn push_full(
        &mut self,
        name: impl Into<String>,
        dnv: Version,
        dirty: bool,
        inode: InodeRecord,
        symlink: Option<&str>,
    ) {
        self.full.push(FullBit {
            name: name.into(),
            dnv,
            dirty,
            inode,
            symlink: symlink.map(str::to_owned),
        });
    }

    pub fn push_remote(&mut self, name: impl Into<String>, dnv: Version, dirty: bool, ino: InodeNo) {
        self.remote.push(RemoteBit {
            name: name.into(),
            dnv,
            dirty,
            ino,
        });
    }

    pub fn push_null(&mut self, name: impl Into<String>, dnv: Version, dirty: bool) {
        self.null.push(NullBit {
            name: name.into(),
            dnv,
            dirty,
        });
    }
}

/// An ordered batch of dir-fragment mutations with side-table tie-ins.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetaBlob {
    /// Enumerates `lump_map` keys exactly once; lumps replay in this order.
    lump_order: Vec<DirFragId>,
    lump_map: BTreeMap<DirFragId, DirLump>,
    atids: Vec<AnchorTxId>,
    truncated_inodes: Vec<(InodeRecord, u64)>,
    client_reqs: Vec<ReqId>,
}

impl MetaBlob {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or revisit) the lump for `frag`. A revisit keeps the lump's
    /// position in the replay order and raises its target version.
    pub fn add_dir(
        &mut self,
        frag: DirFragId,
        dirv: Version,
        dirty: bool,
        complete: bool,
    ) -> &mut DirLump {
        let lump = match self.lump_map.entry(frag) {
            Entry::Vacant(slot) => {
                self.lump_order.push(frag);
                slot.insert(DirLump::new(dirv, dirty, complete))
            }
            Entry::Occupied(slot) => slot.into_mut(),
        };
        lump.dirv = lump.dirv.max(dirv);
        lump.dirty |= dirty;
        lump.complete |= complete;
        lump
    }

    pub fn add_anchor_transaction(&mut self, atid: AnchorTxId) {
        self.atids.push(atid);
    }

    pub fn add_truncated_inode(&mut self, record: InodeRecord, size: u64) {
        self.truncated_inodes.push((record, size));
    }

    pub fn add_client_request(&mut self, reqid: ReqId) {
        self.client_reqs.push(reqid);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lump_map.is_empty()
            && self.atids.is_empty()
            && self.truncated_inodes.is_empty()
            && self.client_reqs.is_empty()
    }

    #[must_use]
    pub fn lump_count(&self) -> usize {
        self.lump_map.len()
    }

    /// May the log trim past this blob?
    ///
    /// A fragment no longer cached, or no longer ours, was handled by
    /// whoever took it; a fragment mid-migration pins the blob until the
    /// migration resolves, whatever its committed version says.
    pub fn has_expired(&self, mds: &Mds<'_>) -> bool {
        for (frag, lump) in &self.lump_map {
            if !mds.cache.dirfrag_cached(*frag) {
                continue; // we already expired it
            }
            if mds.cache.dir_authority(*frag).first() != mds.node {
                trace!(%frag, dirv = %lump.dirv, "lump satisfied: not auth");
                continue;
            }
            // Mid-migration pins the blob no matter how far the dir has
            // committed; neither side may trim until the handoff settles.
            if mds.cache.dir_is_ambiguous_auth(*frag) {
                debug!(%frag, "lump unexpired: ambiguous auth, mid-migration");
                return false;
            }
            if mds.cache.dir_committed_version(*frag) >= lump.dirv {
                trace!(%frag, dirv = %lump.dirv, "lump satisfied: committed");
                continue;
            }
            debug!(%frag, dirv = %lump.dirv, "lump unexpired: not committed");
            return false;
        }

        for atid in &self.atids {
            if !mds.anchor_client.has_committed(*atid) {
                debug!(%atid, "anchor transaction not yet acked");
                return false;
            }
        }

        for (record, size) in &self.truncated_inodes {
            if mds.cache.is_purging(record.ino, *size) {
                debug!(ino = %record.ino, size, "still purging truncated inode");
                return false;
            }
        }

        for reqid in &self.client_reqs {
            if mds.session_map.have_completed_request(*reqid) {
                debug!(%reqid, "completed request not yet trimmed");
                return false;
            }
        }

        true
    }

    /// Drive every unsatisfied dependency toward durability; `c` fires
    /// once all of them land. Registers nothing for dependencies already
    /// satisfied, and fires `c` immediately when none remain.
    pub fn expire(&self, mds: &mut Mds<'_>, c: Completion) {
        // Fragments to commit (collapsed to the max target version), and
        // subtree roots whose migration must resolve first. A migrating
        // fragment goes on a migration list instead of the commit map.
        let mut commit: BTreeMap<DirFragId, Version> = BTreeMap::new();
        let mut waitfor_export: Vec<DirFragId> = Vec::new();
        let mut waitfor_import: Vec<DirFragId> = Vec::new();

        for (frag, lump) in &self.lump_map {
            if !mds.cache.dirfrag_cached(*frag) {
                continue;
            }
            if mds.cache.dir_authority(*frag).first() != mds.node {
                continue;
            }
            if mds.cache.dir_is_ambiguous_auth(*frag) {
                let root = mds.cache.subtree_root(*frag);
                if mds.cache.dir_is_exporting(root) {
                    debug!(%frag, %root, "waiting for export finish");
                    waitfor_export.push(root);
                } else {
                    debug!(%frag, %root, "waiting for import finish");
                    waitfor_import.push(root);
                }
                continue;
            }
            if mds.cache.dir_committed_version(*frag) >= lump.dirv {
                continue;
            }
            debug!(%frag, dirv = %lump.dirv, "committing for expiration");
            let want = commit.entry(*frag).or_insert(Version::ZERO);
            *want = (*want).max(lump.dirv);
        }

        let gather = Gather::new(c);

        for (frag, want) in commit {
            if mds.cache.dir_can_auth_pin(frag) {
                mds.cache.commit_dir(frag, want, gather.new_sub());
            } else {
                // Frozen for an export/split/merge; the next trim pass
                // retries once it thaws.
                mds.cache
                    .add_dir_waiter(frag, DirWaiter::AuthPinnable, gather.new_sub());
            }
        }
        for root in waitfor_export {
            mds.migrator.add_export_finish_waiter(root, gather.new_sub());
        }
        for root in waitfor_import {
            mds.cache
                .add_dir_waiter(root, DirWaiter::Imported, gather.new_sub());
        }

        for atid in &self.atids {
            if !mds.anchor_client.has_committed(*atid) {
                debug!(%atid, "waiting for anchor ack");
                mds.anchor_client.wait_for_ack(*atid, gather.new_sub());
            }
        }

        for (record, size) in &self.truncated_inodes {
            if mds.cache.is_purging(record.ino, *size) {
                debug!(ino = %record.ino, size, "waiting for purge");
                mds.cache.wait_for_purge(record.ino, *size, gather.new_sub());
            }
        }

        for reqid in &self.client_reqs {
            if mds.session_map.have_completed_request(*reqid) {
                debug!(%reqid, "waiting for completed-request trim");
                mds.session_map.add_trim_waiter(*reqid, gather.new_sub());
            }
        }

        gather.activate();
    }

    /// Rebuild the cached namespace this blob describes, in lump order.
    pub fn replay(&self, mds: &mut Mds<'_>) -> Result<()> {
        debug!(lumps = self.lump_map.len(), "replaying dir lumps");

        for frag in &self.lump_order {
            let lump = self
                .lump_map
                .get(frag)
                .ok_or_else(|| MdsError::Codec(format!("lump order names absent fragment {frag}")))?;

            if !mds.cache.dirfrag_cached(*frag) {
                if !mds.cache.inode_cached(frag.ino) {
                    if frag.ino == InodeNo::ROOT {
                        debug!("recreating root inode");
                        mds.cache.create_root_inode();
                    } else if frag.ino.is_stray() {
                        debug!(node = %frag.ino.stray_owner(), "recreating stray inode");
                        mds.cache.create_stray_inode(frag.ino.stray_owner());
                    } else {
                        return Err(MdsError::MissingInode(frag.ino.0));
                    }
                }
                mds.cache.open_dirfrag(*frag);
                if frag.ino == InodeNo::ROOT {
                    // Authority comes back from the ambient checkpoint.
                    mds.cache.set_dir_auth(*frag, AuthPair::UNKNOWN);
                }
                debug!(%frag, "added dir");
            }
            mds.cache.set_dir_version(*frag, lump.dirv);
            if lump.dirty {
                mds.cache.mark_dir_dirty(*frag);
            }
            if lump.complete {
                mds.cache.mark_dir_complete(*frag);
            }

            for bit in &lump.full {
                if mds.cache.dentry_link(*frag, &bit.name).is_none() {
                    mds.cache.add_dentry(*frag, &bit.name);
                }
                mds.cache.set_dentry_version(*frag, &bit.name, bit.dnv);
                if bit.dirty {
                    mds.cache.mark_dentry_dirty(*frag, &bit.name);
                }

                let ino = bit.inode.ino;
                if mds.cache.inode_cached(ino) {
                    if let Some((pfrag, pname)) = mds.cache.inode_primary_parent(ino) {
                        trace!(%ino, parent = %pfrag, "unlinking from prior parent");
                        mds.cache.unlink_dentry(pfrag, &pname);
                    }
                    mds.cache.update_inode(bit.inode, bit.symlink.as_deref());
                } else {
                    mds.cache.add_inode(bit.inode, bit.symlink.as_deref());
                }
                mds.cache.link_primary(*frag, &bit.name, ino);
                if bit.dirty {
                    mds.cache.mark_inode_dirty(ino);
                }
            }

            for bit in &lump.remote {
                match mds.cache.dentry_link(*frag, &bit.name) {
                    None => mds.cache.add_dentry(*frag, &bit.name),
                    Some(DentryLink::Null) => {}
                    Some(_) => mds.cache.unlink_dentry(*frag, &bit.name),
                }
                mds.cache.link_remote(*frag, &bit.name, bit.ino);
                mds.cache.set_dentry_version(*frag, &bit.name, bit.dnv);
                if bit.dirty {
                    mds.cache.mark_dentry_dirty(*frag, &bit.name);
                }
            }

            for bit in &lump.null {
                match mds.cache.dentry_link(*frag, &bit.name) {
                    None => mds.cache.add_dentry(*frag, &bit.name),
                    Some(DentryLink::Null) => {}
                    Some(_) => mds.cache.unlink_dentry(*frag, &bit.name),
                }
                mds.cache.set_dentry_version(*frag, &bit.name, bit.dnv);
                if bit.dirty {
                    mds.cache.mark_dentry_dirty(*frag, &bit.name);
                }
            }
        }

        for atid in &self.atids {
            debug!(%atid, "noting journaled anchor prepare");
            mds.anchor_client.got_journaled_agree(*atid);
        }

        for (record, size) in &self.truncated_inodes {
            debug!(ino = %record.ino, size, "queueing recovered purge");
            mds.cache.add_recovered_purge(*record, *size);
        }

        for reqid in &self.client_reqs {
            mds.session_map.add_completed_request(*reqid);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(ino: u64) -> DirFragId {
        DirFragId::whole(InodeNo(ino))
    }

    #[test]
    fn add_dir_keeps_order_and_collapses_revisits() {
        let mut blob = MetaBlob::new();
        blob.add_dir(frag(10), Version(3), true, false);
        blob.add_dir(frag(11), Version(1), false, false);
        // Revisit raises the target version but keeps position.
        blob.add_dir(frag(10), Version(5), false, true);

        assert_eq!(blob.lump_count(), 2);
        assert_eq!(blob.lump_order, vec![frag(10), frag(11)]);
        let lump = &blob.lump_map[&frag(10)];
        assert_eq!(lump.dirv, Version(5));
        assert!(lump.dirty);
        assert!(lump.complete);
    }

    #[test]
    fn empty_blob_is_empty() {
        let mut blob = MetaBlob::new();
        assert!(blob.is_empty());
        blob.add_client_request(ReqId::new(mfs_types::ClientId(1), 4));
        assert!(!blob.is_empty());
    }

    #[test]
    fn lump_bit_builders_accumulate() {
        let mut blob = MetaBlob::new();
        let lump = blob.add_dir(frag(10), Version(2), true, false);
        lump.push_full(
            "a",
            Version(1),
            true,
            InodeRecord {
                ino: InodeNo(100),
                size: 0,
            },
            None,
        );
        lump.push_remote("b", Version(1), false, InodeNo(200));
        lump.push_null("c", Version(1), true);
        assert_eq!(lump.full.len(), 1);
        assert_eq!(lump.remote.len(), 1);
        assert_eq!(lump.null.len(), 1);
    }
}
