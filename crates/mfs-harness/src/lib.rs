#![forbid(unsafe_code)]
//! In-memory MDS simulator for exercising the journaling core.
//!
//! `MemMds` implements every subsystem contract the journal consumes, with
//! inherent helpers that complete the asynchronous work a real MDS would
//! (dir commit IO, table saves, migration acks, purge completion).
//! `MemLog` frames events through the real entry codec, assigns log
//! bounds, trims head-to-tail, and replays the byte log into a fresh MDS.

use mfs_error::Result;
use mfs_journal::completion::Completion;
use mfs_journal::context::{
    AnchorClient, AnchorTable, ClientInst, DentryLink, DirWaiter, IdAlloc, LogStatus, Mds,
    MetaCache, Migrator, Server, SessionMap, SessionMapSnapshot,
};
use mfs_journal::{decode_entry, encode_entry, LogEvent, MetaBlob};
use mfs_types::{
    Anchor, AnchorTxId, AuthPair, ClientId, DirFragId, IdNo, InodeNo, InodeRecord, LogOffset,
    NodeId, ReqId, Version,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

// ── Cache ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemDentry {
    pub version: Version,
    pub dirty: bool,
    pub link: DentryLink,
}

#[derive(Debug)]
pub struct MemDir {
    pub version: Version,
    pub committed_version: Version,
    pub dirty: bool,
    pub complete: bool,
    pub auth: AuthPair,
    pub ambiguous_auth: bool,
    pub exporting: bool,
    pub can_auth_pin: bool,
    pub dentries: BTreeMap<String, MemDentry>,
}

impl MemDir {
    #[must_use]
    pub fn new(auth: AuthPair) -> Self {
        Self {
            version: Version::ZERO,
            committed_version: Version::ZERO,
            dirty: false,
            complete: false,
            auth,
            ambiguous_auth: false,
            exporting: false,
            can_auth_pin: true,
            dentries: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct MemInode {
    pub record: InodeRecord,
    pub symlink: Option<String>,
    pub dirty: bool,
    pub caps: bool,
    pub last_open_journaled: LogOffset,
    pub parent: Option<(DirFragId, String)>,
}

impl MemInode {
    #[must_use]
    pub fn new(record: InodeRecord) -> Self {
        Self {
            record,
            symlink: None,
            dirty: false,
            caps: false,
            last_open_journaled: LogOffset(0),
            parent: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct MemCache {
    pub dirs: BTreeMap<DirFragId, MemDir>,
    pub inodes: BTreeMap<InodeNo, MemInode>,
    /// Maps a fragment to its containing subtree root (defaults to itself).
    pub subtree_root_of: BTreeMap<DirFragId, DirFragId>,
    /// Authoritative subtree roots, as re-established on replay.
    pub subtree_auth: BTreeMap<DirFragId, NodeId>,
    pub purging: BTreeSet<(InodeNo, u64)>,
    purge_waiters: BTreeMap<(InodeNo, u64), Vec<Completion>>,
    pub recovered_purges: BTreeSet<(InodeNo, u64)>,
    pub ambiguous_imports: BTreeMap<DirFragId, BTreeSet<DirFragId>>,
    pub finished_imports: Vec<DirFragId>,
    pub cancelled_imports: Vec<DirFragId>,
    pub subtree_merges: Vec<DirFragId>,
    pub slave_updates: BTreeMap<ReqId, MetaBlob>,
    pending_commits: Vec<(DirFragId, Version, Completion)>,
    dir_waiters: Vec<(DirFragId, DirWaiter, Completion)>,
}

impl MemCache {
    /// Fixture helper: install a cached dir with the given authority.
    pub fn add_dir(&mut self, frag: DirFragId, auth: AuthPair) -> &mut MemDir {
        self.dirs.entry(frag).or_insert_with(|| MemDir::new(auth))
    }

    /// Fixture helper: install a cached inode.
    pub fn add_cached_inode(&mut self, record: InodeRecord) -> &mut MemInode {
        self.inodes
            .entry(record.ino)
            .or_insert_with(|| MemInode::new(record))
    }

    /// Apply every pending dir commit and fire its completion.
    pub fn complete_dir_commits(&mut self) -> usize {
        let pending = std::mem::take(&mut self.pending_commits);
        let n = pending.len();
        for (frag, want, c) in pending {
            if let Some(dir) = self.dirs.get_mut(&frag) {
                dir.committed_version = dir.committed_version.max(want);
            }
            c.finish();
        }
        n
    }

    /// Fire waiters registered on a dir for `wait`.
    pub fn fire_dir_waiters(&mut self, frag: DirFragId, wait: DirWaiter) -> usize {
        let (fire, keep) = std::mem::take(&mut self.dir_waiters)
            .into_iter()
            .partition::<Vec<_>, _>(|(f, w, _)| *f == frag && *w == wait);
        self.dir_waiters = keep;
        let n = fire.len();
        for (_, _, c) in fire {
            c.finish();
        }
        n
    }

    /// Finish an in-flight purge and fire its waiters.
    pub fn finish_purge(&mut self, ino: InodeNo, size: u64) {
        self.purging.remove(&(ino, size));
        for c in self.purge_waiters.remove(&(ino, size)).unwrap_or_default() {
            c.finish();
        }
    }
}

impl MetaCache for MemCache {
    fn dirfrag_cached(&self, frag: DirFragId) -> bool {
        self.dirs.contains_key(&frag)
    }

    fn dir_authority(&self, frag: DirFragId) -> AuthPair {
        self.dirs
            .get(&frag)
            .map_or(AuthPair::UNKNOWN, |dir| dir.auth)
    }

    fn dir_committed_version(&self, frag: DirFragId) -> Version {
        self.dirs
            .get(&frag)
            .map_or(Version::ZERO, |dir| dir.committed_version)
    }

    fn dir_is_ambiguous_auth(&self, frag: DirFragId) -> bool {
        self.dirs.get(&frag).is_some_and(|dir| dir.ambiguous_auth)
    }

    fn dir_is_exporting(&self, frag: DirFragId) -> bool {
        self.dirs.get(&frag).is_some_and(|dir| dir.exporting)
    }

    fn dir_can_auth_pin(&self, frag: DirFragId) -> bool {
        self.dirs.get(&frag).is_some_and(|dir| dir.can_auth_pin)
    }

    fn subtree_root(&self, frag: DirFragId) -> DirFragId {
        self.subtree_root_of.get(&frag).copied().unwrap_or(frag)
    }

    fn has_subtrees(&self) -> bool {
        !self.subtree_auth.is_empty()
    }

    fn open_dirfrag(&mut self, frag: DirFragId) {
        debug_assert!(
            self.inodes.contains_key(&frag.ino),
            "opening dirfrag without its inode"
        );
        self.dirs
            .entry(frag)
            .or_insert_with(|| MemDir::new(AuthPair::UNKNOWN));
    }

    fn set_dir_auth(&mut self, frag: DirFragId, auth: AuthPair) {
        if let Some(dir) = self.dirs.get_mut(&frag) {
            dir.auth = auth;
        }
    }

    fn set_dir_version(&mut self, frag: DirFragId, version: Version) {
        if let Some(dir) = self.dirs.get_mut(&frag) {
            dir.version = version;
        }
    }

    fn mark_dir_dirty(&mut self, frag: DirFragId) {
        if let Some(dir) = self.dirs.get_mut(&frag) {
            dir.dirty = true;
        }
    }

    fn mark_dir_complete(&mut self, frag: DirFragId) {
        if let Some(dir) = self.dirs.get_mut(&frag) {
            dir.complete = true;
        }
    }

    fn commit_dir(&mut self, frag: DirFragId, want: Version, c: Completion) {
        debug!(%frag, %want, "dir commit submitted");
        self.pending_commits.push((frag, want, c));
    }

    fn add_dir_waiter(&mut self, frag: DirFragId, wait: DirWaiter, c: Completion) {
        self.dir_waiters.push((frag, wait, c));
    }

    fn dentry_link(&self, frag: DirFragId, name: &str) -> Option<DentryLink> {
        self.dirs
            .get(&frag)
            .and_then(|dir| dir.dentries.get(name))
            .map(|dn| dn.link)
    }

    fn add_dentry(&mut self, frag: DirFragId, name: &str) {
        if let Some(dir) = self.dirs.get_mut(&frag) {
            dir.dentries.insert(
                name.to_owned(),
                MemDentry {
                    version: Version::ZERO,
                    dirty: false,
                    link: DentryLink::Null,
                },
            );
        }
    }

    fn set_dentry_version(&mut self, frag: DirFragId, name: &str, version: Version) {
        if let Some(dn) = self
            .dirs
            .get_mut(&frag)
            .and_then(|dir| dir.dentries.get_mut(name))
        {
            dn.version = version;
        }
    }

    fn mark_dentry_dirty(&mut self, frag: DirFragId, name: &str) {
        if let Some(dn) = self
            .dirs
            .get_mut(&frag)
            .and_then(|dir| dir.dentries.get_mut(name))
        {
            dn.dirty = true;
        }
    }

    fn unlink_dentry(&mut self, frag: DirFragId, name: &str) {
        let Some(dn) = self
            .dirs
            .get_mut(&frag)
            .and_then(|dir| dir.dentries.get_mut(name))
        else {
            return;
        };
        if let DentryLink::Primary(ino) = dn.link {
            if let Some(inode) = self.inodes.get_mut(&ino) {
                inode.parent = None;
            }
        }
        dn.link = DentryLink::Null;
    }

    fn inode_cached(&self, ino: InodeNo) -> bool {
        self.inodes.contains_key(&ino)
    }

    fn inode_has_caps(&self, ino: InodeNo) -> bool {
        self.inodes.get(&ino).is_some_and(|inode| inode.caps)
    }

    fn last_open_journaled(&self, ino: InodeNo) -> LogOffset {
        self.inodes
            .get(&ino)
            .map_or(LogOffset(0), |inode| inode.last_open_journaled)
    }

    fn inode_primary_parent(&self, ino: InodeNo) -> Option<(DirFragId, String)> {
        self.inodes.get(&ino).and_then(|inode| inode.parent.clone())
    }

    fn create_root_inode(&mut self) {
        self.inodes
            .entry(InodeNo::ROOT)
            .or_insert_with(|| MemInode::new(InodeRecord {
                ino: InodeNo::ROOT,
                size: 0,
            }));
    }

    fn create_stray_inode(&mut self, node: NodeId) {
        let ino = InodeNo::stray(node);
        self.inodes.entry(ino).or_insert_with(|| {
            MemInode::new(InodeRecord { ino, size: 0 })
        });
    }

    fn add_inode(&mut self, record: InodeRecord, symlink: Option<&str>) {
        let mut inode = MemInode::new(record);
        inode.symlink = symlink.map(str::to_owned);
        self.inodes.insert(record.ino, inode);
    }

    fn update_inode(&mut self, record: InodeRecord, symlink: Option<&str>) {
        if let Some(inode) = self.inodes.get_mut(&record.ino) {
            inode.record = record;
            inode.symlink = symlink.map(str::to_owned);
        }
    }

    fn link_primary(&mut self, frag: DirFragId, name: &str, ino: InodeNo) {
        if let Some(dn) = self
            .dirs
            .get_mut(&frag)
            .and_then(|dir| dir.dentries.get_mut(name))
        {
            dn.link = DentryLink::Primary(ino);
        }
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.parent = Some((frag, name.to_owned()));
        }
    }

    fn link_remote(&mut self, frag: DirFragId, name: &str, ino: InodeNo) {
        if let Some(dn) = self
            .dirs
            .get_mut(&frag)
            .and_then(|dir| dir.dentries.get_mut(name))
        {
            dn.link = DentryLink::Remote(ino);
        }
    }

    fn mark_inode_dirty(&mut self, ino: InodeNo) {
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.dirty = true;
        }
    }

    fn is_purging(&self, ino: InodeNo, size: u64) -> bool {
        self.purging.contains(&(ino, size))
    }

    fn wait_for_purge(&mut self, ino: InodeNo, size: u64, c: Completion) {
        self.purge_waiters.entry((ino, size)).or_default().push(c);
    }

    fn add_recovered_purge(&mut self, record: InodeRecord, size: u64) {
        self.recovered_purges.insert((record.ino, size));
    }

    fn remove_recovered_purge(&mut self, ino: InodeNo, size: u64) {
        self.recovered_purges.remove(&(ino, size));
    }

    fn adjust_subtree_auth(&mut self, frag: DirFragId, node: NodeId) {
        self.subtree_auth.insert(frag, node);
        if let Some(dir) = self.dirs.get_mut(&frag) {
            dir.auth = AuthPair::solo(node);
        }
    }

    fn adjust_bounded_subtree_auth(
        &mut self,
        base: DirFragId,
        _bounds: &BTreeSet<DirFragId>,
        auth: AuthPair,
    ) {
        self.subtree_auth.remove(&base);
        if let Some(dir) = self.dirs.get_mut(&base) {
            dir.auth = auth;
        }
    }

    fn try_subtree_merge(&mut self, base: DirFragId) {
        self.subtree_merges.push(base);
    }

    fn add_ambiguous_import(&mut self, base: DirFragId, bounds: &BTreeSet<DirFragId>) {
        self.ambiguous_imports.insert(base, bounds.clone());
    }

    fn finish_ambiguous_import(&mut self, base: DirFragId) {
        self.ambiguous_imports.remove(&base);
        self.finished_imports.push(base);
    }

    fn cancel_ambiguous_import(&mut self, base: DirFragId) {
        self.ambiguous_imports.remove(&base);
        self.cancelled_imports.push(base);
    }

    fn has_uncommitted_slave_update(&self, reqid: ReqId) -> bool {
        self.slave_updates.contains_key(&reqid)
    }

    fn store_uncommitted_slave_update(&mut self, reqid: ReqId, blob: MetaBlob) {
        self.slave_updates.insert(reqid, blob);
    }

    fn take_uncommitted_slave_update(&mut self, reqid: ReqId) -> Option<MetaBlob> {
        self.slave_updates.remove(&reqid)
    }
}

// ── Migrator ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemMigrator {
    exporting: BTreeMap<DirFragId, Vec<Completion>>,
}

impl MemMigrator {
    /// Fixture helper: mark a subtree as mid-export.
    pub fn begin_export(&mut self, frag: DirFragId) {
        self.exporting.entry(frag).or_default();
    }

    /// Finish an export, firing its waiters.
    pub fn finish_export(&mut self, frag: DirFragId) -> usize {
        let waiters = self.exporting.remove(&frag).unwrap_or_default();
        let n = waiters.len();
        for c in waiters {
            c.finish();
        }
        n
    }
}

impl Migrator for MemMigrator {
    fn is_exporting(&self, frag: DirFragId) -> bool {
        self.exporting.contains_key(&frag)
    }

    fn add_export_finish_waiter(&mut self, frag: DirFragId, c: Completion) {
        self.exporting.entry(frag).or_default().push(c);
    }
}

// ── Anchor table & client ───────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemAnchorTable {
    pub version: Version,
    pub committed_version: Version,
    pub anchored: BTreeMap<InodeNo, Vec<Anchor>>,
    pending_saves: Vec<(Version, Completion)>,
}

impl MemAnchorTable {
    /// Complete every outstanding save.
    pub fn complete_saves(&mut self) -> usize {
        let pending = std::mem::take(&mut self.pending_saves);
        let n = pending.len();
        for (version, c) in pending {
            self.committed_version = self.committed_version.max(version);
            c.finish();
        }
        n
    }
}

impl AnchorTable for MemAnchorTable {
    fn version(&self) -> Version {
        self.version
    }

    fn committed_version(&self) -> Version {
        self.committed_version
    }

    fn save(&mut self, c: Completion) {
        self.pending_saves.push((self.version, c));
    }

    fn create_prepare(&mut self, ino: InodeNo, trace: &[Anchor], _reqmds: NodeId) {
        self.anchored.insert(ino, trace.to_vec());
        self.version = self.version.next();
    }

    fn destroy_prepare(&mut self, ino: InodeNo, _reqmds: NodeId) {
        self.anchored.remove(&ino);
        self.version = self.version.next();
    }

    fn update_prepare(&mut self, ino: InodeNo, trace: &[Anchor], _reqmds: NodeId) {
        self.anchored.insert(ino, trace.to_vec());
        self.version = self.version.next();
    }

    fn commit(&mut self, _atid: AnchorTxId) {
        self.version = self.version.next();
    }
}

#[derive(Debug, Default)]
pub struct MemAnchorClient {
    committed: BTreeSet<AnchorTxId>,
    ack_waiters: BTreeMap<AnchorTxId, Vec<Completion>>,
    pub journaled_agrees: Vec<AnchorTxId>,
    pub journaled_acks: Vec<AnchorTxId>,
}

impl MemAnchorClient {
    /// Mark a transaction committed and fire its ack waiters.
    pub fn commit(&mut self, atid: AnchorTxId) {
        self.committed.insert(atid);
        for c in self.ack_waiters.remove(&atid).unwrap_or_default() {
            c.finish();
        }
    }
}

impl AnchorClient for MemAnchorClient {
    fn has_committed(&self, atid: AnchorTxId) -> bool {
        self.committed.contains(&atid)
    }

    fn wait_for_ack(&mut self, atid: AnchorTxId, c: Completion) {
        self.ack_waiters.entry(atid).or_default().push(c);
    }

    fn got_journaled_agree(&mut self, atid: AnchorTxId) {
        self.journaled_agrees.push(atid);
    }

    fn got_journaled_ack(&mut self, atid: AnchorTxId) {
        self.journaled_acks.push(atid);
    }
}

// ── Session map ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemSessionMap {
    pub version: Version,
    pub committed: Version,
    pub committing: Version,
    pub projected: Version,
    pub sessions: BTreeMap<ClientId, ClientInst>,
    pub completed: BTreeSet<ReqId>,
    trim_waiters: BTreeMap<ReqId, Vec<Completion>>,
    commit_waiters: Vec<Completion>,
}

impl MemSessionMap {
    /// Trim a completed request, firing its waiters.
    pub fn trim_request(&mut self, reqid: ReqId) {
        self.completed.remove(&reqid);
        for c in self.trim_waiters.remove(&reqid).unwrap_or_default() {
            c.finish();
        }
    }

    /// Land the in-flight commit and fire commit waiters.
    pub fn finish_commit(&mut self) {
        self.committed = self.committed.max(self.committing);
        for c in std::mem::take(&mut self.commit_waiters) {
            c.finish();
        }
    }
}

impl SessionMap for MemSessionMap {
    fn version(&self) -> Version {
        self.version
    }

    fn committed(&self) -> Version {
        self.committed
    }

    fn committing(&self) -> Version {
        self.committing
    }

    fn set_committed(&mut self, version: Version) {
        self.committed = version;
    }

    fn set_committing(&mut self, version: Version) {
        self.committing = version;
    }

    fn add_commit_waiter(&mut self, c: Completion) {
        self.commit_waiters.push(c);
    }

    fn have_completed_request(&self, reqid: ReqId) -> bool {
        self.completed.contains(&reqid)
    }

    fn add_trim_waiter(&mut self, reqid: ReqId, c: Completion) {
        self.trim_waiters.entry(reqid).or_default().push(c);
    }

    fn add_completed_request(&mut self, reqid: ReqId) {
        self.completed.insert(reqid);
    }

    fn open_session(&mut self, inst: &ClientInst) {
        self.sessions.insert(inst.id, inst.clone());
        self.version = self.version.next();
    }

    fn close_session(&mut self, client: ClientId) {
        self.sessions.remove(&client);
        self.version = self.version.next();
    }

    fn load(&mut self, snapshot: &SessionMapSnapshot) {
        self.sessions = snapshot.sessions.clone();
        self.version = snapshot.version;
    }

    fn reset_projected(&mut self) {
        self.projected = self.version;
    }
}

// ── Id allocator ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemIdAlloc {
    pub version: Version,
    pub committed_version: Version,
    next: u64,
    free: BTreeSet<IdNo>,
    pending_saves: Vec<(Version, Completion)>,
}

impl MemIdAlloc {
    /// Complete every outstanding save.
    pub fn complete_saves(&mut self) -> usize {
        let pending = std::mem::take(&mut self.pending_saves);
        let n = pending.len();
        for (version, c) in pending {
            self.committed_version = self.committed_version.max(version);
            c.finish();
        }
        n
    }
}

impl IdAlloc for MemIdAlloc {
    fn version(&self) -> Version {
        self.version
    }

    fn committed_version(&self) -> Version {
        self.committed_version
    }

    fn save(&mut self, c: Completion, version: Version) {
        self.pending_saves.push((version, c));
    }

    fn alloc_id(&mut self, replaying: bool) -> IdNo {
        self.version = self.version.next();
        let id = if let Some(id) = self.free.iter().next().copied() {
            self.free.remove(&id);
            id
        } else {
            self.next += 1;
            IdNo(self.next)
        };
        debug!(%id, replaying, "allocated id");
        id
    }

    fn reclaim_id(&mut self, id: IdNo, replaying: bool) {
        self.version = self.version.next();
        self.free.insert(id);
        debug!(%id, replaying, "reclaimed id");
    }
}

// ── Log status & server hooks ───────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemLogStatus {
    pub capped: bool,
    pub last_import_map: LogOffset,
    import_map_waiters: Vec<Completion>,
}

impl MemLogStatus {
    /// A newer authority checkpoint landed (or shutdown): release waiters.
    pub fn fire_import_map_waiters(&mut self) -> usize {
        let waiters = std::mem::take(&mut self.import_map_waiters);
        let n = waiters.len();
        for c in waiters {
            c.finish();
        }
        n
    }
}

impl LogStatus for MemLogStatus {
    fn last_import_map(&self) -> LogOffset {
        self.last_import_map
    }

    fn is_capped(&self) -> bool {
        self.capped
    }

    fn add_import_map_expire_waiter(&mut self, c: Completion) {
        self.import_map_waiters.push(c);
    }
}

#[derive(Debug, Default)]
pub struct MemServer {
    pub queued_opens: Vec<InodeNo>,
    pub open_flushes: u32,
    open_waiters: Vec<Completion>,
    clientmap_logs: Vec<Completion>,
}

impl Server for MemServer {
    fn queue_journal_open(&mut self, ino: InodeNo) {
        self.queued_opens.push(ino);
    }

    fn add_journal_open_waiter(&mut self, c: Completion) {
        self.open_waiters.push(c);
    }

    fn maybe_journal_opens(&mut self) {
        if !self.queued_opens.is_empty() {
            self.open_flushes += 1;
        }
    }

    fn log_clientmap(&mut self, c: Completion) {
        self.clientmap_logs.push(c);
    }
}

// ── The assembled MDS ───────────────────────────────────────────────────────

/// Every subsystem the journal touches, assembled for tests.
#[derive(Debug)]
pub struct MemMds {
    pub node: NodeId,
    pub cache: MemCache,
    pub migrator: MemMigrator,
    pub anchor_table: MemAnchorTable,
    pub anchor_client: MemAnchorClient,
    pub session_map: MemSessionMap,
    pub id_alloc: MemIdAlloc,
    pub log_status: MemLogStatus,
    pub server: MemServer,
}

impl MemMds {
    #[must_use]
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            cache: MemCache::default(),
            migrator: MemMigrator::default(),
            anchor_table: MemAnchorTable::default(),
            anchor_client: MemAnchorClient::default(),
            session_map: MemSessionMap::default(),
            id_alloc: MemIdAlloc::default(),
            log_status: MemLogStatus::default(),
            server: MemServer::default(),
        }
    }

    /// Borrow every subsystem as a journal context.
    pub fn mds(&mut self) -> Mds<'_> {
        Mds {
            node: self.node,
            cache: &mut self.cache,
            migrator: &mut self.migrator,
            anchor_table: &mut self.anchor_table,
            anchor_client: &mut self.anchor_client,
            session_map: &mut self.session_map,
            id_alloc: &mut self.id_alloc,
            log: &mut self.log_status,
            server: &mut self.server,
        }
    }

    /// The batch writer journaled the queued opens at `at`: advance each
    /// inode's open watermark and fire the waiters.
    pub fn complete_open_rejournal(&mut self, at: LogOffset) {
        for ino in std::mem::take(&mut self.server.queued_opens) {
            if let Some(inode) = self.cache.inodes.get_mut(&ino) {
                inode.last_open_journaled = at;
            }
        }
        for c in std::mem::take(&mut self.server.open_waiters) {
            c.finish();
        }
    }

    /// A requested session-map write reached disk: mark the live version
    /// committed and fire both the write's completions and any piggybacked
    /// commit waiters.
    pub fn complete_clientmap_log(&mut self) {
        let v = self.session_map.version;
        self.session_map.committing = v;
        self.session_map.committed = v;
        for c in std::mem::take(&mut self.server.clientmap_logs) {
            c.finish();
        }
        self.session_map.finish_commit();
    }
}

// ── Log driver ──────────────────────────────────────────────────────────────

/// One placed journal entry: the decoded event plus its log bounds.
#[derive(Debug)]
pub struct PlacedEntry {
    pub start: LogOffset,
    pub end: LogOffset,
    pub event: LogEvent,
}

/// Append-only byte log with head-to-tail trimming and full replay.
///
/// Entries run through the real codec on both append and replay, so the
/// recovered state is built from bytes, not from the in-memory events.
#[derive(Debug, Default)]
pub struct MemLog {
    buf: Vec<u8>,
    entries: Vec<PlacedEntry>,
    head: usize,
}

impl MemLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode and place an event, recording bounds. Writing an authority
    /// checkpoint advances the log's `last_import_map` watermark.
    pub fn append(&mut self, mds: &mut MemMds, mut event: LogEvent) -> Result<(LogOffset, LogOffset)> {
        let start = LogOffset(self.buf.len() as u64);
        let bytes = encode_entry(&event)?;
        self.buf.extend_from_slice(&bytes);
        let end = LogOffset(self.buf.len() as u64);
        event.set_bounds(start, end);

        if matches!(event, LogEvent::ImportMap(_)) {
            mds.log_status.last_import_map = end;
            mds.log_status.fire_import_map_waiters();
        }

        self.entries.push(PlacedEntry { start, end, event });
        Ok((start, end))
    }

    /// Entries not yet trimmed, oldest first.
    pub fn live_entries(&self) -> &[PlacedEntry] {
        &self.entries[self.head..]
    }

    /// Walk from the head, trimming expired entries. Stops at the first
    /// unexpired entry; later expired entries stay until it goes.
    pub fn trim(&mut self, mds: &mut MemMds) -> usize {
        let mut trimmed = 0;
        while self.head < self.entries.len() {
            let expired = self.entries[self.head].event.has_expired(&mds.mds());
            if !expired {
                break;
            }
            debug!(start = %self.entries[self.head].start, "trimming entry");
            self.head += 1;
            trimmed += 1;
        }
        trimmed
    }

    /// Decode the whole byte log in append order and replay it into `mds`,
    /// assigning bounds from read position. Returns the entry count.
    pub fn replay_into(&self, mds: &mut MemMds) -> Result<usize> {
        let mut off = 0_usize;
        let mut count = 0;
        while off < self.buf.len() {
            let (mut event, used) = decode_entry(&self.buf[off..])?;
            event.set_bounds(LogOffset(off as u64), LogOffset((off + used) as u64));
            event.replay(&mut mds.mds())?;
            off += used;
            count += 1;
        }
        Ok(count)
    }
}
