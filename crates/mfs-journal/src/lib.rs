#![forbid(unsafe_code)]
//! Journaling core of the MarlinFS metadata server.
//!
//! Every mutation to authoritative metadata is first recorded as a journal
//! entry. Entries move through a three-phase lifecycle:
//!
//! 1. **append**: the mutating operation constructs a [`LogEvent`] and the
//!    log writer frames it with [`encode_entry`];
//! 2. **expire**: a background trim pass walks from the log head asking
//!    [`LogEvent::has_expired`]; unexpired entries get
//!    [`LogEvent::expire`], which drives their dependencies toward
//!    durability and fires a completion once the entry is trimmable;
//! 3. **replay**: on recovery, entries are decoded in append order and
//!    [`LogEvent::replay`] rebuilds the in-memory state idempotently.
//!
//! Events navigate the MDS only through the contracts in [`context`]; they
//! hold identifiers, never cache references.

pub mod completion;
pub mod context;
pub mod events;
pub mod metablob;

pub use crate::completion::{Completion, Gather};
pub use crate::context::Mds;
pub use crate::metablob::MetaBlob;

use crate::events::{
    Alloc, AnchorAck, AnchorTxn, ClientMap, Export, ImportFinish, ImportMap, ImportStart, Marker,
    Open, PurgeFinish, Session, SlaveUpdate, Update,
};
use mfs_error::{MdsError, Result};
use mfs_types::LogOffset;
use serde::{Deserialize, Serialize};

/// On-disk type code of a journal entry. Doubles as the envelope tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventKind {
    Marker = 1,
    ClientMap = 2,
    Session = 3,
    ImportMap = 4,
    Update = 5,
    SlaveUpdate = 6,
    Open = 7,
    Alloc = 8,
    PurgeFinish = 9,
    Export = 10,
    ImportStart = 11,
    ImportFinish = 12,
    AnchorTxn = 13,
    AnchorAck = 14,
}

impl EventKind {
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => Self::Marker,
            2 => Self::ClientMap,
            3 => Self::Session,
            4 => Self::ImportMap,
            5 => Self::Update,
            6 => Self::SlaveUpdate,
            7 => Self::Open,
            8 => Self::Alloc,
            9 => Self::PurgeFinish,
            10 => Self::Export,
            11 => Self::ImportStart,
            12 => Self::ImportFinish,
            13 => Self::AnchorTxn,
            14 => Self::AnchorAck,
            _ => return None,
        })
    }
}

/// A journal entry payload: one event of the taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEvent {
    Marker(Marker),
    ClientMap(ClientMap),
    Session(Session),
    ImportMap(ImportMap),
    Update(Update),
    SlaveUpdate(SlaveUpdate),
    Open(Open),
    Alloc(Alloc),
    PurgeFinish(PurgeFinish),
    Export(Export),
    ImportStart(ImportStart),
    ImportFinish(ImportFinish),
    AnchorTxn(AnchorTxn),
    AnchorAck(AnchorAck),
}

impl LogEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Marker(_) => EventKind::Marker,
            Self::ClientMap(_) => EventKind::ClientMap,
            Self::Session(_) => EventKind::Session,
            Self::ImportMap(_) => EventKind::ImportMap,
            Self::Update(_) => EventKind::Update,
            Self::SlaveUpdate(_) => EventKind::SlaveUpdate,
            Self::Open(_) => EventKind::Open,
            Self::Alloc(_) => EventKind::Alloc,
            Self::PurgeFinish(_) => EventKind::PurgeFinish,
            Self::Export(_) => EventKind::Export,
            Self::ImportStart(_) => EventKind::ImportStart,
            Self::ImportFinish(_) => EventKind::ImportFinish,
            Self::AnchorTxn(_) => EventKind::AnchorTxn,
            Self::AnchorAck(_) => EventKind::AnchorAck,
        }
    }

    /// Record where in the log this entry landed. Only open-file records
    /// and authority checkpoints consult their position.
    pub fn set_bounds(&mut self, start: LogOffset, end: LogOffset) {
        match self {
            Self::Open(open) => open.start = start,
            Self::ImportMap(map) => map.end = end,
            _ => {}
        }
    }

    /// May the log trim past this entry? Pure and monotone: once true for
    /// a given state epoch, it stays true.
    #[must_use]
    pub fn has_expired(&self, mds: &Mds<'_>) -> bool {
        match self {
            Self::Marker(_) | Self::PurgeFinish(_) | Self::ImportFinish(_) | Self::AnchorAck(_) => {
                true
            }
            Self::ClientMap(ev) => events::session_map_expired(mds, ev.cmapv),
            Self::Session(ev) => events::session_map_expired(mds, ev.cmapv),
            Self::ImportMap(ev) => ev.has_expired(mds),
            Self::Update(ev) => ev.blob.has_expired(mds),
            Self::SlaveUpdate(ev) => ev.blob.has_expired(mds),
            Self::Open(ev) => ev.has_expired(mds),
            Self::Alloc(ev) => ev.has_expired(mds),
            Self::Export(ev) => ev.has_expired(mds),
            Self::ImportStart(ev) => ev.blob.has_expired(mds),
            Self::AnchorTxn(ev) => ev.has_expired(mds),
        }
    }

    /// Arrange for `c` to fire exactly once when this entry's dependencies
    /// are durable. Never blocks; registers continuations and returns.
    ///
    /// Calling this on an always-expired entry is a logic violation.
    pub fn expire(&self, mds: &mut Mds<'_>, c: Completion) -> Result<()> {
        match self {
            Self::Marker(_) => Err(MdsError::IllegalExpire { kind: "marker" }),
            Self::PurgeFinish(_) => Err(MdsError::IllegalExpire {
                kind: "purge-finish",
            }),
            Self::ImportFinish(_) => Err(MdsError::IllegalExpire {
                kind: "import-finish",
            }),
            Self::AnchorAck(_) => Err(MdsError::IllegalExpire { kind: "anchor-ack" }),
            Self::ClientMap(ev) => {
                events::session_map_expire(mds, ev.cmapv, c);
                Ok(())
            }
            Self::Session(ev) => {
                events::session_map_expire(mds, ev.cmapv, c);
                Ok(())
            }
            Self::ImportMap(ev) => {
                ev.expire(mds, c);
                Ok(())
            }
            Self::Update(ev) => {
                ev.blob.expire(mds, c);
                Ok(())
            }
            Self::SlaveUpdate(ev) => {
                ev.blob.expire(mds, c);
                Ok(())
            }
            Self::Open(ev) => ev.expire(mds, c),
            Self::Alloc(ev) => {
                ev.expire(mds, c);
                Ok(())
            }
            Self::Export(ev) => ev.expire(mds, c),
            Self::ImportStart(ev) => {
                ev.blob.expire(mds, c);
                Ok(())
            }
            Self::AnchorTxn(ev) => {
                ev.expire(mds, c);
                Ok(())
            }
        }
    }

    /// Apply this entry to in-memory state exactly as if the original
    /// operation had just run, but idempotently: targets whose version has
    /// already caught up are left alone.
    pub fn replay(&self, mds: &mut Mds<'_>) -> Result<()> {
        match self {
            Self::Marker(ev) => {
                ev.replay(mds);
                Ok(())
            }
            Self::ClientMap(ev) => {
                ev.replay(mds);
                Ok(())
            }
            Self::Session(ev) => {
                ev.replay(mds);
                Ok(())
            }
            Self::ImportMap(ev) => ev.replay(mds),
            Self::Update(ev) => ev.blob.replay(mds),
            Self::SlaveUpdate(ev) => ev.replay(mds),
            Self::Open(ev) => ev.blob.replay(mds),
            Self::Alloc(ev) => ev.replay(mds),
            Self::PurgeFinish(ev) => {
                ev.replay(mds);
                Ok(())
            }
            Self::Export(ev) => ev.replay(mds),
            Self::ImportStart(ev) => ev.replay(mds),
            Self::ImportFinish(ev) => {
                ev.replay(mds);
                Ok(())
            }
            Self::AnchorTxn(ev) => ev.replay(mds),
            Self::AnchorAck(ev) => {
                ev.replay(mds);
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Entry framing
// ---------------------------------------------------------------------------

const ENTRY_MAGIC: u32 = 0x4A53_464D; // "MFSJ" in little-endian payload.
const ENTRY_HEADER_SIZE: usize = 16;

/// Frame an event as one journal entry:
/// `[magic][kind][payload len][payload crc32c][payload]`, payload encoded
/// with bincode. The decoder sees the same logical event the writer
/// produced.
pub fn encode_entry(event: &LogEvent) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(event, bincode::config::standard())
        .map_err(|e| MdsError::Codec(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| MdsError::Codec("entry payload exceeds u32 length".to_owned()))?;

    let mut out = Vec::with_capacity(ENTRY_HEADER_SIZE + payload.len());
    out.extend_from_slice(&ENTRY_MAGIC.to_le_bytes());
    out.extend_from_slice(&(event.kind() as u32).to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode one entry from the front of `buf`, returning the event and the
/// number of bytes consumed.
pub fn decode_entry(buf: &[u8]) -> Result<(LogEvent, usize)> {
    let magic = read_le_u32(buf, 0)?;
    if magic != ENTRY_MAGIC {
        return Err(MdsError::Codec(format!(
            "bad entry magic {magic:#010x} (expected {ENTRY_MAGIC:#010x})"
        )));
    }

    let code = read_le_u32(buf, 4)?;
    let kind =
        EventKind::from_code(code).ok_or(MdsError::UnknownEventKind(code))?;

    let len = read_le_u32(buf, 8)? as usize;
    let crc = read_le_u32(buf, 12)?;

    let end = ENTRY_HEADER_SIZE
        .checked_add(len)
        .ok_or_else(|| MdsError::Codec("entry length overflow".to_owned()))?;
    let payload = buf
        .get(ENTRY_HEADER_SIZE..end)
        .ok_or_else(|| MdsError::Codec("truncated entry payload".to_owned()))?;

    let actual = crc32c::crc32c(payload);
    if actual != crc {
        return Err(MdsError::Checksum {
            expected: crc,
            actual,
        });
    }

    let (event, read): (LogEvent, usize) =
        bincode::serde::decode_from_slice(payload, bincode::config::standard())
            .map_err(|e| MdsError::Codec(e.to_string()))?;
    if read != payload.len() {
        return Err(MdsError::Codec(format!(
            "entry payload has {} trailing bytes",
            payload.len() - read
        )));
    }
    if event.kind() != kind {
        return Err(MdsError::Codec(format!(
            "entry type code {code} does not match decoded payload"
        )));
    }

    Ok((event, end))
}

fn read_le_u32(buf: &[u8], offset: usize) -> Result<u32> {
    let end = offset
        .checked_add(4)
        .ok_or_else(|| MdsError::Codec("entry header offset overflow".to_owned()))?;
    let bytes: [u8; 4] = buf
        .get(offset..end)
        .ok_or_else(|| MdsError::Codec("truncated entry header".to_owned()))?
        .try_into()
        .map_err(|_| MdsError::Codec("truncated entry header".to_owned()))?;
    Ok(u32::from_le_bytes(bytes))
}
