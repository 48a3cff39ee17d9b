//! Blockstore operations
//!
//! Operations are owned values identified by a stable id: the queue holds
//! ids, the operation table owns the payloads, and completions refer back
//! by id. Per-operation progress lives here too, so an operation that
//! suspends on a busy resource (journal space, an unsynced big write)
//! resumes where it left off on the next queue pass.

use stripeio_common::{ObjVer, Oid, PgNum, Result};

pub type OpId = u64;

/// A queued blockstore operation.
#[derive(Debug)]
pub enum BsOp {
    /// Write `data` at `offset` within the object's block. `version == 0`
    /// requests auto-assignment (max existing + 1). Writes of exactly one
    /// aligned block take the big-write path, everything else goes through
    /// the journal.
    Write {
        oid: Oid,
        version: u64,
        offset: u32,
        len: u32,
        data: Vec<u8>,
        instant: bool,
    },
    Read {
        oid: Oid,
        offset: u32,
        len: u32,
    },
    /// Make every write accepted so far durable.
    Sync,
    /// Promote synced versions to stable.
    Stabilize { versions: Vec<ObjVer> },
    /// Discard dirty versions above the given one, per object.
    Rollback { versions: Vec<ObjVer> },
    Delete {
        oid: Oid,
        version: u64,
    },
    /// Enumerate stable and unstable versions, optionally restricted to
    /// one PG.
    List { filter: Option<ListFilter> },
}

#[derive(Clone, Copy, Debug)]
pub struct ListFilter {
    pub pg_count: u32,
    pub pg_num: PgNum,
    pub pg_stripe_size: u64,
}

/// Successful operation output.
#[derive(Debug, PartialEq, Eq)]
pub enum BsOut {
    Done,
    /// The version the write landed at (relevant for auto-assignment).
    Written { version: u64 },
    Data(Vec<u8>),
    ObjectList {
        stable: Vec<ObjVer>,
        unstable: Vec<ObjVer>,
    },
}

#[derive(Debug)]
pub struct BsCompletion {
    pub id: OpId,
    pub result: Result<BsOut>,
}

/// Saved progress of a suspended operation.
#[derive(Debug, Default)]
pub enum Progress {
    /// Not started, or waiting without intermediate state.
    #[default]
    Queued,
    /// A write whose dirty entry exists but whose device work is deferred
    /// behind an unsynced big write of the same object.
    WaitBig { version: u64 },
    Sync(SyncProgress),
}

/// Sync state machine: a linear sequence, with the data fsync skipped
/// when the batch has no big writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Start,
    DataFsyncDone,
    JournalWriteDone,
    Done,
}

/// Batch captured by a sync at the instant it was first dequeued. Writes
/// accepted later are carried by the next sync.
#[derive(Debug)]
pub struct SyncProgress {
    pub state: SyncState,
    pub big: Vec<ObjVer>,
    pub small: Vec<ObjVer>,
}
