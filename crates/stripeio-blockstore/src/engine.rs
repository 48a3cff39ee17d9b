//! Blockstore engine
//!
//! All mutable state lives behind one value and is driven cooperatively:
//! operations are enqueued, then [`Blockstore::process`] advances every
//! operation that can make progress and returns the completions. An
//! operation suspends when a resource it needs is unavailable (journal
//! space, an unsynced big write ahead of it) and is retried on the next
//! pass.

use crate::allocator::BlockBitmap;
use crate::journal::Journal;
use crate::meta::MetaArea;
use crate::op::{BsCompletion, BsOp, BsOut, OpId, Progress};
use crate::raw_io::{AlignedBuffer, Device};
use std::collections::{BTreeMap, HashMap, VecDeque};
use stripeio_common::{
    BlockstoreConfig, Error, ObjVer, ObjectState, Oid, Result, Workflow, WriteKind,
};
use tracing::trace;

/// One clean (stable, durable) version per object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CleanEntry {
    pub version: u64,
    /// Block number on the data device.
    pub location: u64,
}

/// In-memory record of an object version that is not stable yet.
#[derive(Debug)]
pub struct DirtyEntry {
    pub state: ObjectState,
    /// Block number, present for big writes once allocated.
    pub location: Option<u64>,
    pub offset: u32,
    pub len: u32,
    /// Journal sector carrying this entry's newest journal record. The
    /// entry holds exactly one usage reference on it.
    pub journal_sector: Option<u64>,
    /// Small-write payload, kept for reads until the version is stable.
    pub payload: Option<Vec<u8>>,
}

pub(crate) enum Step {
    Done(Result<BsOut>),
    NotReady,
}

pub struct Blockstore {
    pub(crate) cfg: BlockstoreConfig,
    pub(crate) block_size: u32,
    pub(crate) data: Device,
    pub(crate) journal: Journal,
    pub(crate) meta: MetaArea,
    pub(crate) alloc: BlockBitmap,

    /// oid -> its single clean entry.
    pub(crate) clean: HashMap<Oid, CleanEntry>,
    /// Ordered (oid, version) -> dirty entry; all versions of an oid above
    /// its clean version, contiguous and increasing.
    pub(crate) dirty: BTreeMap<ObjVer, DirtyEntry>,
    /// oid -> highest synced-but-not-stable version, published to peers.
    pub(crate) unstable: HashMap<Oid, u64>,
    /// Rollback ceilings: versions at or below these were discarded and
    /// must never be reassigned.
    pub(crate) max_seen: HashMap<Oid, u64>,

    pub(crate) unsynced_big: Vec<ObjVer>,
    pub(crate) unsynced_small: Vec<ObjVer>,

    queue: VecDeque<OpId>,
    ops: HashMap<OpId, (BsOp, Progress)>,
    next_id: OpId,
    pub(crate) sync_in_progress: Option<OpId>,
}

impl Blockstore {
    pub(crate) fn from_parts(
        cfg: BlockstoreConfig,
        data: Device,
        journal: Journal,
        meta: MetaArea,
        alloc: BlockBitmap,
    ) -> Self {
        let block_size = cfg.block_size;
        Self {
            cfg,
            block_size,
            data,
            journal,
            meta,
            alloc,
            clean: HashMap::new(),
            dirty: BTreeMap::new(),
            unstable: HashMap::new(),
            max_seen: HashMap::new(),
            unsynced_big: Vec::new(),
            unsynced_small: Vec::new(),
            queue: VecDeque::new(),
            ops: HashMap::new(),
            next_id: 1,
            sync_in_progress: None,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn free_blocks(&self) -> u64 {
        self.alloc.free_blocks()
    }

    pub fn journal_free_bytes(&self) -> u64 {
        self.journal.free_bytes()
    }

    /// Current synced-but-unstable versions, highest per object.
    pub fn unstable_writes(&self) -> &HashMap<Oid, u64> {
        &self.unstable
    }

    /// The clean entry of an object, if it has a stable version.
    pub fn clean_entry(&self, oid: Oid) -> Option<CleanEntry> {
        self.clean.get(&oid).copied()
    }

    /// All dirty versions of an object, in increasing order.
    pub fn dirty_versions(&self, oid: Oid) -> Vec<u64> {
        self.dirty
            .range(ObjVer::new(oid, 0)..=ObjVer::new(oid, u64::MAX))
            .map(|(ov, _)| ov.version)
            .collect()
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    /// fsync counters, for observability and tests.
    pub fn data_sync_count(&self) -> u64 {
        self.data
            .stats()
            .syncs
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn journal_sync_count(&self) -> u64 {
        self.journal
            .device_stats()
            .syncs
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Enqueue an operation. Nothing happens until [`Self::process`].
    pub fn enqueue(&mut self, op: BsOp) -> OpId {
        let id = self.next_id;
        self.next_id += 1;
        self.ops.insert(id, (op, Progress::Queued));
        self.queue.push_back(id);
        id
    }

    /// Drive every queued operation as far as it can go and collect
    /// completions. Operations waiting on resources stay queued.
    pub fn process(&mut self) -> Vec<BsCompletion> {
        let mut out = Vec::new();
        loop {
            let mut progressed = false;
            let ids: Vec<OpId> = self.queue.iter().copied().collect();
            for id in ids {
                match self.step_op(id) {
                    Step::Done(result) => {
                        self.queue.retain(|&q| q != id);
                        self.ops.remove(&id);
                        if self.sync_in_progress == Some(id) {
                            self.sync_in_progress = None;
                        }
                        out.push(BsCompletion { id, result });
                        progressed = true;
                    }
                    Step::NotReady => {}
                }
            }
            if !progressed {
                break;
            }
        }
        out
    }

    /// Convenience for callers that issue one operation at a time: enqueue,
    /// process, and pull out this operation's completion. Any other
    /// completions that became ready are returned too.
    pub fn execute(&mut self, op: BsOp) -> (Result<BsOut>, Vec<BsCompletion>) {
        let id = self.enqueue(op);
        let mut completions = self.process();
        match completions.iter().position(|c| c.id == id) {
            Some(idx) => {
                let c = completions.remove(idx);
                (c.result, completions)
            }
            None => (
                Err(Error::internal("operation did not complete; resource starvation")),
                completions,
            ),
        }
    }

    /// Abandon a queued operation that has not completed. A write whose
    /// device work never happened takes its dirty entry with it.
    pub fn cancel(&mut self, id: OpId) -> bool {
        let Some((op, progress)) = self.ops.remove(&id) else {
            return false;
        };
        self.queue.retain(|&q| q != id);
        if self.sync_in_progress == Some(id) {
            // Re-queueing the captured batch keeps it for the next sync.
            if let Progress::Sync(sp) = progress {
                self.unsynced_big.extend(sp.big);
                self.unsynced_small.extend(sp.small);
            }
            self.sync_in_progress = None;
            return true;
        }
        if let (BsOp::Write { oid, .. } | BsOp::Delete { oid, .. }, Progress::WaitBig { version }) =
            (&op, &progress)
        {
            let ov = ObjVer::new(*oid, *version);
            if let Some(e) = self.dirty.get(&ov) {
                if e.state.workflow() < Workflow::Written {
                    self.dirty.remove(&ov);
                }
            }
        }
        true
    }

    fn step_op(&mut self, id: OpId) -> Step {
        let (op, progress) = match self.ops.remove(&id) {
            Some(v) => v,
            None => return Step::NotReady,
        };
        let (step, op, progress) = self.dispatch(id, op, progress);
        if !matches!(step, Step::Done(_)) {
            self.ops.insert(id, (op, progress));
        }
        step
    }

    fn dispatch(&mut self, id: OpId, op: BsOp, progress: Progress) -> (Step, BsOp, Progress) {
        match &op {
            BsOp::Write { .. } | BsOp::Delete { .. } => self.progress_write(op, progress),
            BsOp::Read { .. } => {
                let step = self.progress_read(&op);
                (step, op, progress)
            }
            BsOp::Sync => self.progress_sync(id, op, progress),
            BsOp::Stabilize { .. } => {
                let step = self.progress_stabilize(&op);
                (step, op, progress)
            }
            BsOp::Rollback { .. } => {
                let step = self.progress_rollback(&op);
                (step, op, progress)
            }
            BsOp::List { .. } => {
                let step = self.progress_list(&op);
                (step, op, progress)
            }
        }
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Highest version ever associated with the object: clean, dirty, or a
    /// rollback ceiling. Versions are strictly monotonic per object, so
    /// auto-assignment and conflict checks both run against this.
    pub fn max_version(&self, oid: Oid) -> u64 {
        let clean = self.clean.get(&oid).map(|c| c.version).unwrap_or(0);
        let dirty = self
            .dirty
            .range(ObjVer::new(oid, 0)..=ObjVer::new(oid, u64::MAX))
            .next_back()
            .map(|(ov, _)| ov.version)
            .unwrap_or(0);
        let ceiling = self.max_seen.get(&oid).copied().unwrap_or(0);
        clean.max(dirty).max(ceiling)
    }

    /// Whether a version of this object below `version` is a big write
    /// whose device I/O has not completed yet (later writes serialise
    /// behind it until it reaches WRITTEN).
    fn blocked_by_big(&self, oid: Oid, version: u64) -> bool {
        self.dirty
            .range(ObjVer::new(oid, 0)..ObjVer::new(oid, version))
            .any(|(_, e)| {
                e.state.kind() == WriteKind::Big && e.state.workflow() < Workflow::Written
            })
    }

    fn progress_write(&mut self, op: BsOp, progress: Progress) -> (Step, BsOp, Progress) {
        let (oid, requested_version, offset, len, instant, is_delete) = match &op {
            BsOp::Write {
                oid,
                version,
                offset,
                len,
                instant,
                ..
            } => (*oid, *version, *offset, *len, *instant, false),
            BsOp::Delete { oid, version } => (*oid, *version, 0, 0, false, true),
            _ => unreachable!(),
        };

        let version = match progress {
            Progress::Queued => {
                // First pass: validate and insert the dirty entry.
                match self.admit_write(oid, requested_version, offset, len, is_delete, instant, &op)
                {
                    Ok(version) => version,
                    Err(e) => return (Step::Done(Err(e)), op, Progress::Queued),
                }
            }
            Progress::WaitBig { version } => version,
            other => {
                return (
                    Step::Done(Err(Error::internal(format!(
                        "write in unexpected progress state {other:?}"
                    )))),
                    op,
                    Progress::Queued,
                )
            }
        };

        let ov = ObjVer::new(oid, version);
        let Some(entry) = self.dirty.get(&ov) else {
            // Rolled back while we were waiting.
            return (
                Step::Done(Err(Error::invalid_input(format!(
                    "write {ov} was rolled back before completion"
                )))),
                op,
                Progress::Queued,
            );
        };

        if entry.state.workflow() == Workflow::WaitBig {
            if self.blocked_by_big(oid, version) {
                return (Step::NotReady, op, Progress::WaitBig { version });
            }
            let entry = self.dirty.get_mut(&ov).unwrap();
            entry.state = entry.state.advanced_to(Workflow::InFlight);
        }

        match self.submit_write_io(ov, &op) {
            Ok(()) => (
                Step::Done(Ok(BsOut::Written { version })),
                op,
                Progress::Queued,
            ),
            Err(Error::JournalFull) => (Step::NotReady, op, Progress::WaitBig { version }),
            Err(e) => (Step::Done(Err(e)), op, Progress::Queued),
        }
    }

    /// Validate a write and insert its dirty entry. Returns the assigned
    /// version.
    fn admit_write(
        &mut self,
        oid: Oid,
        requested_version: u64,
        offset: u32,
        len: u32,
        is_delete: bool,
        instant: bool,
        op: &BsOp,
    ) -> Result<u64> {
        if !is_delete && (u64::from(offset) + u64::from(len) > u64::from(self.block_size)) {
            return Err(Error::invalid_input(format!(
                "write beyond block end: offset {offset} len {len} block {}",
                self.block_size
            )));
        }
        if is_delete && self.clean.get(&oid).is_none() && self.latest_dirty(oid).is_none() {
            return Err(Error::ObjectNotFound(oid));
        }

        let current = self.max_version(oid);
        let version = if requested_version == 0 {
            current + 1
        } else if requested_version <= current {
            return Err(Error::VersionConflict {
                oid,
                supplied: requested_version,
                current,
            });
        } else {
            requested_version
        };

        let kind = if is_delete {
            WriteKind::Delete
        } else if offset == 0 && len == self.block_size {
            WriteKind::Big
        } else {
            WriteKind::Small
        };

        let workflow = if self.blocked_by_big(oid, version) {
            Workflow::WaitBig
        } else {
            Workflow::InFlight
        };

        let payload = match (kind, op) {
            (WriteKind::Small, BsOp::Write { data, .. }) => Some(data.clone()),
            _ => None,
        };

        trace!(%oid, version, ?kind, "admitting write");
        self.dirty.insert(
            ObjVer::new(oid, version),
            DirtyEntry {
                state: ObjectState::new(kind, workflow, instant),
                location: None,
                offset,
                len,
                journal_sector: None,
                payload,
            },
        );
        Ok(version)
    }

    /// Perform the device work for an admitted write. On `JournalFull` the
    /// dirty entry stays in place and the operation retries later.
    fn submit_write_io(&mut self, ov: ObjVer, op: &BsOp) -> Result<()> {
        let (kind, already_written, instant) = {
            let e = self.dirty.get(&ov).unwrap();
            (
                e.state.kind(),
                e.state.workflow() >= Workflow::Written,
                e.state.is_instant(),
            )
        };
        if already_written {
            return Ok(());
        }

        match kind {
            WriteKind::Big => {
                let BsOp::Write { data, .. } = op else {
                    unreachable!()
                };
                let location = self.alloc.allocate().ok_or(Error::DiskFull)?;
                let mut buf = AlignedBuffer::new(self.block_size as usize, self.data.alignment());
                buf.copy_from(data);
                if let Err(e) = self
                    .data
                    .write_at(location * u64::from(self.block_size), buf.as_slice())
                {
                    self.alloc.free(location);
                    return Err(e);
                }
                let entry = self.dirty.get_mut(&ov).unwrap();
                entry.location = Some(location);
                entry.state = entry.state.advanced_to(Workflow::Written);
                self.unsynced_big.push(ov);
            }
            WriteKind::Small => {
                let BsOp::Write { data, .. } = op else {
                    unreachable!()
                };
                let (len, offset) = {
                    let e = self.dirty.get(&ov).unwrap();
                    (e.len, e.offset)
                };
                if !self.journal.reserve(
                    1,
                    56,
                    u64::from(len),
                    crate::layout::JOURNAL_STABILIZE_RESERVATION + self.pending_big_entry_bytes(),
                ) {
                    return Err(Error::JournalFull);
                }
                let (pos, _data_offset) = self.journal.append_small_write(
                    ov.oid, ov.version, offset, len, instant, data,
                )?;
                self.journal.ref_sector(pos.sector);
                let entry = self.dirty.get_mut(&ov).unwrap();
                entry.journal_sector = Some(pos.sector);
                entry.state = entry.state.advanced_to(Workflow::Written);
                self.unsynced_small.push(ov);
            }
            WriteKind::Delete => {
                if !self.journal.reserve(
                    1,
                    40,
                    0,
                    crate::layout::JOURNAL_STABILIZE_RESERVATION + self.pending_big_entry_bytes(),
                ) {
                    return Err(Error::JournalFull);
                }
                let pos = self.journal.append(&crate::layout::JournalEntry::Delete {
                    oid: ov.oid,
                    version: ov.version,
                    instant,
                })?;
                self.journal.ref_sector(pos.sector);
                let entry = self.dirty.get_mut(&ov).unwrap();
                entry.journal_sector = Some(pos.sector);
                entry.state = entry.state.advanced_to(Workflow::Written);
                self.unsynced_small.push(ov);
            }
        }
        Ok(())
    }

    /// Journal bytes the pending big writes will need for their entries at
    /// the next sync; small writes must not starve that space.
    pub(crate) fn pending_big_entry_bytes(&self) -> u64 {
        (self.unsynced_big.len() as u64 + 1) * 56
    }

    pub(crate) fn latest_dirty(&self, oid: Oid) -> Option<(ObjVer, &DirtyEntry)> {
        self.dirty
            .range(ObjVer::new(oid, 0)..=ObjVer::new(oid, u64::MAX))
            .next_back()
            .map(|(ov, e)| (*ov, e))
    }

    // ------------------------------------------------------------------
    // Consistency checking
    // ------------------------------------------------------------------

    /// Verify the universal invariants: unique clean entries with dirty
    /// versions strictly above them, journal sector usage counts matching
    /// live dirty entries, and allocator agreement for big-write blocks.
    pub fn verify_consistency(&self) -> Result<()> {
        let mut sector_refs: BTreeMap<u64, u64> = BTreeMap::new();
        let mut per_oid_last: HashMap<Oid, u64> = HashMap::new();

        for (ov, entry) in &self.dirty {
            if let Some(clean) = self.clean.get(&ov.oid) {
                if ov.version <= clean.version {
                    return Err(Error::internal(format!(
                        "dirty {} at or below clean version {}",
                        ov, clean.version
                    )));
                }
            }
            if let Some(prev) = per_oid_last.get(&ov.oid) {
                if ov.version <= *prev {
                    return Err(Error::internal(format!("dirty order violation at {ov}")));
                }
            }
            per_oid_last.insert(ov.oid, ov.version);

            if let Some(sector) = entry.journal_sector {
                *sector_refs.entry(sector).or_insert(0) += 1;
            }
            if entry.state.kind() == WriteKind::Big {
                if let Some(location) = entry.location {
                    if !self.alloc.is_used(location) {
                        return Err(Error::internal(format!(
                            "big write {ov} block {location} not marked used"
                        )));
                    }
                }
            }
        }

        if &sector_refs != self.journal.used_sectors() {
            return Err(Error::internal(format!(
                "journal sector usage {:?} != live dirty refs {:?}",
                self.journal.used_sectors(),
                sector_refs
            )));
        }
        Ok(())
    }
}
