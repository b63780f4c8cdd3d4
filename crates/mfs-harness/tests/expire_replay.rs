#![forbid(unsafe_code)]
//! Expiration and replay behavior of individual journal entries against an
//! in-memory MDS.

use mfs_error::MdsError;
use mfs_harness::MemMds;
use mfs_journal::completion::Completion;
use mfs_journal::context::{ClientInst, DirWaiter};
use mfs_journal::events::{
    Alloc, AllocOp, AnchorOp, AnchorTxn, Export, ImportFinish, Marker, Open, PurgeFinish, Session,
    SlaveOp, SlaveUpdate, Update,
};
use mfs_journal::{LogEvent, MetaBlob};
use mfs_types::{
    AnchorTxId, AuthPair, ClientId, DirFragId, IdNo, InodeNo, InodeRecord, LogOffset, NodeId,
    ReqId, Version,
};
use std::cell::Cell;
use std::rc::Rc;

fn fired_flag() -> (Rc<Cell<bool>>, Completion) {
    let fired = Rc::new(Cell::new(false));
    let f = Rc::clone(&fired);
    (fired, Completion::new(move || f.set(true)))
}

fn self_node() -> NodeId {
    NodeId(0)
}

// ── MetaBlob expiration ─────────────────────────────────────────────────────

#[test]
fn empty_blob_expires_immediately() {
    let mut mds = MemMds::new(self_node());
    let blob = MetaBlob::new();

    assert!(blob.has_expired(&mds.mds()));

    let (fired, c) = fired_flag();
    blob.expire(&mut mds.mds(), c);
    assert!(fired.get());
}

#[test]
fn blob_waits_for_dir_commit() {
    let mut mds = MemMds::new(self_node());
    let d = DirFragId::whole(InodeNo(0x10));
    mds.cache.add_dir(d, AuthPair::solo(self_node())).committed_version = Version(5);

    let mut blob = MetaBlob::new();
    blob.add_dir(d, Version(7), true, false);
    assert!(!blob.has_expired(&mds.mds()));

    let (fired, c) = fired_flag();
    blob.expire(&mut mds.mds(), c);
    assert!(!fired.get());

    assert_eq!(mds.cache.complete_dir_commits(), 1);
    assert!(fired.get());
    assert!(mds.cache.dirs[&d].committed_version >= Version(7));
    assert!(blob.has_expired(&mds.mds()));
}

#[test]
fn blob_skips_dir_we_no_longer_own() {
    let mut mds = MemMds::new(self_node());
    let d = DirFragId::whole(InodeNo(0x10));
    mds.cache.add_dir(d, AuthPair::solo(NodeId(1))).committed_version = Version(5);

    let mut blob = MetaBlob::new();
    blob.add_dir(d, Version(7), true, false);

    assert!(blob.has_expired(&mds.mds()));
    let (fired, c) = fired_flag();
    blob.expire(&mut mds.mds(), c);
    assert!(fired.get());
}

#[test]
fn blob_skips_dir_no_longer_cached() {
    let mut mds = MemMds::new(self_node());
    let mut blob = MetaBlob::new();
    blob.add_dir(DirFragId::whole(InodeNo(0x10)), Version(7), true, false);
    assert!(blob.has_expired(&mds.mds()));
}

#[test]
fn ambiguous_exporting_dir_waits_for_export_finish() {
    let mut mds = MemMds::new(self_node());
    let root = DirFragId::whole(InodeNo(0x20));
    let d = DirFragId::whole(InodeNo(0x21));
    mds.cache.add_dir(root, AuthPair(self_node(), NodeId(1))).exporting = true;
    mds.cache.add_dir(d, AuthPair(self_node(), NodeId(1))).ambiguous_auth = true;
    mds.cache.subtree_root_of.insert(d, root);

    let mut blob = MetaBlob::new();
    blob.add_dir(d, Version(3), true, false);

    // Committed version is irrelevant while the migration is unresolved.
    mds.cache.dirs.get_mut(&d).unwrap().committed_version = Version(9);
    assert!(!blob.has_expired(&mds.mds()));

    let (fired, c) = fired_flag();
    blob.expire(&mut mds.mds(), c);
    assert!(!fired.get());

    mds.migrator.finish_export(root);
    assert!(fired.get());
}

#[test]
fn ambiguous_importing_dir_waits_for_import_finish() {
    let mut mds = MemMds::new(self_node());
    let root = DirFragId::whole(InodeNo(0x30));
    let d = DirFragId::whole(InodeNo(0x31));
    mds.cache.add_dir(root, AuthPair(NodeId(1), self_node()));
    mds.cache.add_dir(d, AuthPair(self_node(), NodeId(1))).ambiguous_auth = true;
    mds.cache.subtree_root_of.insert(d, root);

    let mut blob = MetaBlob::new();
    blob.add_dir(d, Version(3), true, false);
    assert!(!blob.has_expired(&mds.mds()));

    let (fired, c) = fired_flag();
    blob.expire(&mut mds.mds(), c);
    assert!(!fired.get());

    assert_eq!(mds.cache.fire_dir_waiters(root, DirWaiter::Imported), 1);
    assert!(fired.get());
}

#[test]
fn frozen_dir_registers_auth_pin_waiter_instead_of_commit() {
    let mut mds = MemMds::new(self_node());
    let d = DirFragId::whole(InodeNo(0x40));
    let dir = mds.cache.add_dir(d, AuthPair::solo(self_node()));
    dir.can_auth_pin = false;

    let mut blob = MetaBlob::new();
    blob.add_dir(d, Version(2), true, false);

    let (fired, c) = fired_flag();
    blob.expire(&mut mds.mds(), c);

    // No commit was submitted; the blob retries after the dir thaws.
    assert_eq!(mds.cache.complete_dir_commits(), 0);
    assert!(!fired.get());
    assert_eq!(mds.cache.fire_dir_waiters(d, DirWaiter::AuthPinnable), 1);
    assert!(fired.get());
}

#[test]
fn two_lumps_one_dir_commit_to_the_larger_version() {
    let mut mds = MemMds::new(self_node());
    let d = DirFragId::whole(InodeNo(0x50));
    mds.cache.add_dir(d, AuthPair::solo(self_node()));

    let mut blob = MetaBlob::new();
    blob.add_dir(d, Version(4), true, false);
    blob.add_dir(d, Version(9), true, false);

    let (fired, c) = fired_flag();
    blob.expire(&mut mds.mds(), c);
    assert_eq!(mds.cache.complete_dir_commits(), 1);
    assert!(fired.get());
    assert_eq!(mds.cache.dirs[&d].committed_version, Version(9));
}

#[test]
fn blob_waits_for_anchor_purge_and_request_trim() {
    let mut mds = MemMds::new(self_node());
    let atid = AnchorTxId(11);
    let ino = InodeNo(0x60);
    let reqid = ReqId::new(ClientId(2), 8);
    mds.cache.purging.insert((ino, 4096));
    mds.session_map.completed.insert(reqid);

    let mut blob = MetaBlob::new();
    blob.add_anchor_transaction(atid);
    blob.add_truncated_inode(InodeRecord { ino, size: 1 << 20 }, 4096);
    blob.add_client_request(reqid);
    assert!(!blob.has_expired(&mds.mds()));

    let (fired, c) = fired_flag();
    blob.expire(&mut mds.mds(), c);
    assert!(!fired.get());

    mds.anchor_client.commit(atid);
    assert!(!fired.get());
    mds.cache.finish_purge(ino, 4096);
    assert!(!fired.get());
    mds.session_map.trim_request(reqid);
    assert!(fired.get());

    assert!(blob.has_expired(&mds.mds()));
}

// ── Always-expired entries ──────────────────────────────────────────────────

#[test]
fn immediate_entries_never_drive_expiration() {
    let mut mds = MemMds::new(self_node());
    let entries = vec![
        LogEvent::Marker(Marker::new("heartbeat")),
        LogEvent::PurgeFinish(PurgeFinish {
            ino: InodeNo(0x70),
            newsize: 0,
        }),
        LogEvent::ImportFinish(ImportFinish {
            base: DirFragId::whole(InodeNo(0x71)),
            success: true,
        }),
        LogEvent::AnchorAck(mfs_journal::events::AnchorAck { atid: AnchorTxId(3) }),
    ];

    for entry in entries {
        assert!(entry.has_expired(&mds.mds()));
        let err = entry
            .expire(&mut mds.mds(), Completion::noop())
            .expect_err("expire must be rejected");
        assert!(matches!(err, MdsError::IllegalExpire { .. }));
    }
}

// ── Table-backed entries ────────────────────────────────────────────────────

#[test]
fn alloc_expires_once_table_commits() {
    let mut mds = MemMds::new(self_node());
    mds.id_alloc.version = Version(5);
    mds.id_alloc.committed_version = Version(3);

    let ev = LogEvent::Alloc(Alloc {
        what: AllocOp::Alloc,
        id: IdNo(17),
        table_version: Version(5),
    });
    assert!(!ev.has_expired(&mds.mds()));

    let (fired, c) = fired_flag();
    ev.expire(&mut mds.mds(), c).expect("expire");
    assert!(!fired.get());
    assert_eq!(mds.id_alloc.complete_saves(), 1);
    assert!(fired.get());
    assert!(ev.has_expired(&mds.mds()));
}

#[test]
fn alloc_replay_applies_once_and_verifies_id() {
    let mut mds = MemMds::new(self_node());
    let ev = LogEvent::Alloc(Alloc {
        what: AllocOp::Alloc,
        id: IdNo(1),
        table_version: Version(1),
    });

    ev.replay(&mut mds.mds()).expect("first replay");
    assert_eq!(mds.id_alloc.version, Version(1));
    ev.replay(&mut mds.mds()).expect("replay is idempotent");
    assert_eq!(mds.id_alloc.version, Version(1));
}

#[test]
fn alloc_replay_rejects_version_gap() {
    let mut mds = MemMds::new(self_node());
    let ev = LogEvent::Alloc(Alloc {
        what: AllocOp::Alloc,
        id: IdNo(1),
        table_version: Version(4),
    });
    let err = ev.replay(&mut mds.mds()).expect_err("gap must fail");
    assert!(matches!(
        err,
        MdsError::ReplayOrder {
            table: "idalloc",
            ..
        }
    ));
}

#[test]
fn anchor_replay_is_ordered_and_idempotent() {
    let mut mds = MemMds::new(self_node());
    mds.anchor_table.version = Version(9);

    let ev = LogEvent::AnchorTxn(AnchorTxn {
        op: AnchorOp::CreatePrepare,
        ino: InodeNo(0x99),
        trace: Vec::new(),
        reqmds: NodeId(1),
        atid: AnchorTxId(4),
        version: Version(10),
    });

    ev.replay(&mut mds.mds()).expect("first replay");
    assert_eq!(mds.anchor_table.version, Version(10));

    // Table already caught up: a second replay changes nothing.
    ev.replay(&mut mds.mds()).expect("second replay");
    assert_eq!(mds.anchor_table.version, Version(10));
}

#[test]
fn anchor_replay_rejects_version_gap() {
    let mut mds = MemMds::new(self_node());
    mds.anchor_table.version = Version(7);

    let ev = LogEvent::AnchorTxn(AnchorTxn {
        op: AnchorOp::Commit,
        ino: InodeNo(0x99),
        trace: Vec::new(),
        reqmds: NodeId(1),
        atid: AnchorTxId(4),
        version: Version(10),
    });
    let err = ev.replay(&mut mds.mds()).expect_err("gap must fail");
    assert!(matches!(err, MdsError::ReplayOrder { table: "anchor", .. }));
}

// ── Session-map gated entries ───────────────────────────────────────────────

fn session_event(cmapv: u64) -> LogEvent {
    LogEvent::Session(Session {
        open: true,
        inst: ClientInst {
            id: ClientId(1),
            addr: "10.0.0.9:6789".to_owned(),
        },
        cmapv: Version(cmapv),
    })
}

#[test]
fn session_entry_expired_once_map_committed() {
    let mut mds = MemMds::new(self_node());
    mds.session_map.version = Version(5);
    mds.session_map.committed = Version(5);
    assert!(session_event(3).has_expired(&mds.mds()));
}

#[test]
fn session_entry_piggybacks_on_inflight_commit() {
    let mut mds = MemMds::new(self_node());
    mds.session_map.version = Version(4);
    mds.session_map.committed = Version(2);
    mds.session_map.committing = Version(3);

    let ev = session_event(3);
    assert!(!ev.has_expired(&mds.mds()));

    let (fired, c) = fired_flag();
    ev.expire(&mut mds.mds(), c).expect("expire");
    assert!(!fired.get());
    mds.session_map.finish_commit();
    assert!(fired.get());
    assert!(ev.has_expired(&mds.mds()));
}

#[test]
fn session_entry_starts_a_fresh_map_commit() {
    let mut mds = MemMds::new(self_node());
    mds.session_map.version = Version(3);
    mds.session_map.committed = Version(2);
    mds.session_map.committing = Version(2);

    let ev = session_event(3);
    let (fired, c) = fired_flag();
    ev.expire(&mut mds.mds(), c).expect("expire");
    assert!(!fired.get());

    mds.complete_clientmap_log();
    assert!(fired.get());
    assert!(ev.has_expired(&mds.mds()));
}

// ── Open records ────────────────────────────────────────────────────────────

#[test]
fn open_superseded_by_later_record_expires() {
    let mut mds = MemMds::new(self_node());
    let ino = InodeNo(0x42);
    let inode = mds.cache.add_cached_inode(InodeRecord { ino, size: 0 });
    inode.caps = true;
    inode.last_open_journaled = LogOffset(500);

    let mut ev = LogEvent::Open(Open::new(vec![ino], MetaBlob::new()));
    ev.set_bounds(LogOffset(400), LogOffset(460));
    assert!(ev.has_expired(&mds.mds()));
}

#[test]
fn open_with_live_caps_rejournals_to_expire() {
    let mut mds = MemMds::new(self_node());
    let ino = InodeNo(0x42);
    let inode = mds.cache.add_cached_inode(InodeRecord { ino, size: 0 });
    inode.caps = true;
    inode.last_open_journaled = LogOffset(300);

    let mut ev = LogEvent::Open(Open::new(vec![ino], MetaBlob::new()));
    ev.set_bounds(LogOffset(400), LogOffset(460));
    assert!(!ev.has_expired(&mds.mds()));

    let (fired, c) = fired_flag();
    ev.expire(&mut mds.mds(), c).expect("expire");
    assert_eq!(mds.server.queued_opens, vec![ino]);
    assert_eq!(mds.server.open_flushes, 1);
    assert!(!fired.get());

    mds.complete_open_rejournal(LogOffset(600));
    assert!(fired.get());
    assert!(ev.has_expired(&mds.mds()));
}

#[test]
fn open_lost_across_recovery_counts_as_superseded() {
    let mut mds = MemMds::new(self_node());
    let ino = InodeNo(0x42);
    mds.cache.add_cached_inode(InodeRecord { ino, size: 0 }).caps = true;
    // last_open_journaled stays 0.

    let mut ev = LogEvent::Open(Open::new(vec![ino], MetaBlob::new()));
    ev.set_bounds(LogOffset(400), LogOffset(460));
    assert!(ev.has_expired(&mds.mds()));
}

#[test]
fn open_expire_after_cap_is_fatal() {
    let mut mds = MemMds::new(self_node());
    let ino = InodeNo(0x42);
    mds.cache.add_cached_inode(InodeRecord { ino, size: 0 }).caps = true;
    mds.log_status.capped = true;

    let ev = LogEvent::Open(Open::new(vec![ino], MetaBlob::new()));
    let err = ev
        .expire(&mut mds.mds(), Completion::noop())
        .expect_err("capped log with live opens");
    assert!(matches!(err, MdsError::CappedOpens));
}

// ── Export entries ──────────────────────────────────────────────────────────

#[test]
fn export_waits_for_migration_ack() {
    let mut mds = MemMds::new(self_node());
    let base = DirFragId::whole(InodeNo(0x80));
    mds.cache.add_dir(base, AuthPair(self_node(), NodeId(1)));
    mds.migrator.begin_export(base);

    let ev = LogEvent::Export(Export {
        base,
        bounds: Default::default(),
        blob: MetaBlob::new(),
    });
    assert!(!ev.has_expired(&mds.mds()));

    let (fired, c) = fired_flag();
    ev.expire(&mut mds.mds(), c).expect("expire");
    assert!(!fired.get());
    mds.migrator.finish_export(base);
    assert!(fired.get());
    assert!(ev.has_expired(&mds.mds()));
}

#[test]
fn export_expire_without_active_export_is_fatal() {
    let mut mds = MemMds::new(self_node());
    let base = DirFragId::whole(InodeNo(0x80));
    mds.cache.add_dir(base, AuthPair::solo(self_node()));

    let ev = LogEvent::Export(Export {
        base,
        bounds: Default::default(),
        blob: MetaBlob::new(),
    });
    assert!(ev.has_expired(&mds.mds()));
    let err = ev
        .expire(&mut mds.mds(), Completion::noop())
        .expect_err("no export in progress");
    assert!(matches!(err, MdsError::ExportNotActive(_)));
}

// ── Slave transactions ──────────────────────────────────────────────────────

fn victim_blob(frag: DirFragId) -> MetaBlob {
    let mut blob = MetaBlob::new();
    let lump = blob.add_dir(frag, Version(2), true, false);
    lump.push_full(
        "victim",
        Version(1),
        true,
        InodeRecord {
            ino: InodeNo(0x500),
            size: 0,
        },
        None,
    );
    blob
}

#[test]
fn slave_abort_discards_prepared_blob() {
    let mut mds = MemMds::new(self_node());
    let reqid = ReqId::new(ClientId(7), 3);
    let frag = DirFragId::whole(InodeNo::ROOT);

    LogEvent::SlaveUpdate(SlaveUpdate {
        op: SlaveOp::Prepare,
        reqid,
        blob: victim_blob(frag),
    })
    .replay(&mut mds.mds())
    .expect("prepare");
    assert!(mds.cache.slave_updates.contains_key(&reqid));
    // Prepare parks the blob without applying it.
    assert!(mds.cache.dirs.is_empty());

    LogEvent::SlaveUpdate(SlaveUpdate {
        op: SlaveOp::Abort,
        reqid,
        blob: MetaBlob::new(),
    })
    .replay(&mut mds.mds())
    .expect("abort");
    assert!(mds.cache.slave_updates.is_empty());
    assert!(mds.cache.dirs.is_empty());
}

#[test]
fn slave_commit_applies_prepared_blob() {
    let mut mds = MemMds::new(self_node());
    let reqid = ReqId::new(ClientId(7), 4);
    let frag = DirFragId::whole(InodeNo::ROOT);

    LogEvent::SlaveUpdate(SlaveUpdate {
        op: SlaveOp::Prepare,
        reqid,
        blob: victim_blob(frag),
    })
    .replay(&mut mds.mds())
    .expect("prepare");

    LogEvent::SlaveUpdate(SlaveUpdate {
        op: SlaveOp::Commit,
        reqid,
        blob: MetaBlob::new(),
    })
    .replay(&mut mds.mds())
    .expect("commit");

    assert!(mds.cache.slave_updates.is_empty());
    let dir = &mds.cache.dirs[&frag];
    assert_eq!(dir.version, Version(2));
    assert!(dir.dentries.contains_key("victim"));
}

#[test]
fn slave_commit_without_prepare_is_ignored() {
    let mut mds = MemMds::new(self_node());
    LogEvent::SlaveUpdate(SlaveUpdate {
        op: SlaveOp::Commit,
        reqid: ReqId::new(ClientId(7), 5),
        blob: MetaBlob::new(),
    })
    .replay(&mut mds.mds())
    .expect("stray commit is benign");
    assert!(mds.cache.dirs.is_empty());
}

#[test]
fn duplicate_slave_prepare_is_fatal() {
    let mut mds = MemMds::new(self_node());
    let reqid = ReqId::new(ClientId(7), 6);
    let frag = DirFragId::whole(InodeNo::ROOT);

    let prepare = LogEvent::SlaveUpdate(SlaveUpdate {
        op: SlaveOp::Prepare,
        reqid,
        blob: victim_blob(frag),
    });
    prepare.replay(&mut mds.mds()).expect("first prepare");
    let err = prepare
        .replay(&mut mds.mds())
        .expect_err("second prepare for the same request");
    assert!(matches!(err, MdsError::DuplicatePrepare(_)));
}

// ── Update forwards to its blob ─────────────────────────────────────────────

#[test]
fn update_forwards_lifecycle_to_blob() {
    let mut mds = MemMds::new(self_node());
    let d = DirFragId::whole(InodeNo(0x10));
    mds.cache.add_dir(d, AuthPair::solo(self_node()));

    let mut blob = MetaBlob::new();
    blob.add_dir(d, Version(7), true, false);
    let ev = LogEvent::Update(Update::new(blob));

    assert!(!ev.has_expired(&mds.mds()));
    let (fired, c) = fired_flag();
    ev.expire(&mut mds.mds(), c).expect("expire");
    mds.cache.complete_dir_commits();
    assert!(fired.get());
    assert!(ev.has_expired(&mds.mds()));
}
