//! Blockstore initialisation and crash recovery
//!
//! `format` lays the journal and metadata structures onto the configured
//! devices; `open` reconstructs the full in-memory state: metadata scan
//! for the clean index, then journal replay in entry order to rebuild the
//! dirty index. Replayed writes are durable by definition, so they come
//! back in state SYNCED; STABLE, ROLLBACK and DELETE entries are
//! re-applied, which makes recovery idempotent across repeated crashes.
//!
//! Replay applies everything to memory first and touches the devices only
//! after the walk: block ownership is only unambiguous once the whole
//! journal has been seen (a block freed by a rollback may be claimed by a
//! later big write), so the allocator is rebuilt from the final state and
//! pending small-write copies and metadata records are materialised last.

use crate::allocator::BlockBitmap;
use crate::engine::{Blockstore, CleanEntry, DirtyEntry};
use crate::journal::Journal;
use crate::layout::{JournalEntry, MetaRecord};
use crate::meta::MetaArea;
use crate::raw_io::{AlignedBuffer, Device, RawFile};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use stripeio_common::{
    BlockstoreConfig, Error, ObjVer, ObjectState, Oid, Result, Workflow, WriteKind,
};
use tracing::{info, warn};

const DATA_ALIGNMENT: usize = 512;
const JOURNAL_ALIGNMENT: usize = 512;
const META_ALIGNMENT: usize = 4096;

/// Clean-entry location of an object whose block is assigned during
/// materialisation (small writes folded onto an object with no block yet).
const UNALLOCATED: u64 = u64::MAX;

struct Areas {
    data: Device,
    journal: Device,
    meta: Device,
    block_count: u64,
}

/// Open (or create) the three device areas, sharing one file handle when
/// paths coincide.
fn open_areas(cfg: &BlockstoreConfig, create: bool) -> Result<Areas> {
    let block_size = u64::from(cfg.block_size);
    if !cfg.block_size.is_power_of_two() || cfg.block_size < 4096 {
        return Err(Error::Configuration(format!(
            "block size {} must be a power of two >= 4096",
            cfg.block_size
        )));
    }

    let mut files: HashMap<PathBuf, Arc<RawFile>> = HashMap::new();
    let mut open = |path: &PathBuf, min_size: u64| -> Result<Arc<RawFile>> {
        if let Some(f) = files.get(path) {
            return Ok(f.clone());
        }
        let file = if create && !path.exists() {
            Arc::new(RawFile::create(path, min_size)?)
        } else {
            let f = Arc::new(RawFile::open(path)?);
            if create && f.size() < min_size {
                return Err(Error::Configuration(format!(
                    "{} is smaller than the configured layout needs ({min_size} bytes)",
                    path.display()
                )));
            }
            f
        };
        files.insert(path.clone(), file.clone());
        Ok(file)
    };

    // Sizing: block count either configured or derived from the data area.
    let data_file_probe = open(
        &cfg.data_device,
        cfg.data_offset + cfg.block_count.max(1) * block_size,
    )?;
    let block_count = if cfg.block_count > 0 {
        cfg.block_count
    } else {
        (data_file_probe.size().saturating_sub(cfg.data_offset)) / block_size
    };
    if block_count == 0 {
        return Err(Error::Configuration(
            "data device has no room for even one block".into(),
        ));
    }

    let meta_len = MetaArea::required_size(block_count);
    let journal_file = open(&cfg.journal_device, cfg.journal_offset + cfg.journal_size)?;
    let meta_file = open(&cfg.meta_device, cfg.meta_offset + meta_len)?;
    let data_file = open(&cfg.data_device, cfg.data_offset + block_count * block_size)?;

    let data = Device::new(
        data_file,
        cfg.data_offset,
        block_count * block_size,
        DATA_ALIGNMENT,
    )?;
    let journal = Device::new(
        journal_file,
        cfg.journal_offset,
        cfg.journal_size,
        JOURNAL_ALIGNMENT,
    )?;
    let meta = Device::new(meta_file, cfg.meta_offset, meta_len, META_ALIGNMENT)?;

    Ok(Areas {
        data,
        journal,
        meta,
        block_count,
    })
}

/// What a replayed stabilisation still owes the data device: the block to
/// write into (or none, if one must be allocated) and the small-write
/// payloads to fold onto it, in version order.
struct PendingMod {
    base: Option<u64>,
    payloads: Vec<(u32, Vec<u8>)>,
}

#[derive(Default)]
struct ReplayCtx {
    pending: HashMap<Oid, PendingMod>,
    /// Blocks whose metadata record may differ from disk.
    meta_touched: HashSet<u64>,
}

impl Blockstore {
    /// Initialise fresh on-disk structures. Destroys existing content.
    pub fn format(cfg: &BlockstoreConfig) -> Result<()> {
        let areas = open_areas(cfg, true)?;
        info!(
            blocks = areas.block_count,
            block_size = cfg.block_size,
            journal = cfg.journal_size,
            "formatting blockstore"
        );
        Journal::format(areas.journal)?;
        MetaArea::format(areas.meta, cfg.block_size, areas.block_count)?;
        Ok(())
    }

    /// Open formatted devices and recover state.
    pub fn open(cfg: &BlockstoreConfig) -> Result<Self> {
        let areas = open_areas(cfg, false)?;
        let journal = Journal::open(areas.journal)?;
        let meta = MetaArea::open(areas.meta, cfg.block_size, areas.block_count)?;
        let alloc = BlockBitmap::new(areas.block_count);

        let mut bs = Blockstore::from_parts(cfg.clone(), areas.data, journal, meta, alloc);
        bs.recover()?;
        info!(
            objects = bs.clean.len(),
            dirty = bs.dirty.len(),
            free_blocks = bs.alloc.free_blocks(),
            "blockstore recovered"
        );
        Ok(bs)
    }

    fn recover(&mut self) -> Result<()> {
        let mut ctx = ReplayCtx::default();

        // 1. Clean index from the metadata area. A crash between the two
        // sector writes of a stabilise can leave the same object claimed
        // by two blocks; the higher version wins and the loser's record
        // is rewritten at the end.
        let mut scanned: Vec<(u64, Oid, u64)> = Vec::new();
        self.meta.load(|block, rec| {
            scanned.push((block, rec.oid, rec.version));
        })?;
        for (block, oid, version) in scanned {
            match self.clean.get(&oid) {
                Some(existing) if existing.version >= version => {
                    warn!(%oid, version, "dropping duplicate clean entry");
                    ctx.meta_touched.insert(block);
                }
                _ => {
                    if let Some(old) = self.clean.insert(
                        oid,
                        CleanEntry {
                            version,
                            location: block,
                        },
                    ) {
                        warn!(%oid, old_version = old.version, "dropping duplicate clean entry");
                        ctx.meta_touched.insert(old.location);
                    }
                }
            }
        }

        // 2. Journal replay, applied to memory strictly in entry order.
        let entries = self.journal.replay()?;
        for (entry, pos) in entries {
            self.replay_entry(entry, pos.sector, &mut ctx)?;
        }

        // 3. Device materialisation now that ownership is final.
        self.materialize(ctx)?;

        // 4. Everything replayed is durable; publish unstable versions.
        self.unstable.clear();
        for (ov, e) in &self.dirty {
            if e.state.workflow() == Workflow::Synced {
                let v = self.unstable.entry(ov.oid).or_insert(0);
                *v = (*v).max(ov.version);
            }
        }

        self.reclaim_journal_space()?;
        Ok(())
    }

    fn replay_entry(
        &mut self,
        entry: JournalEntry,
        sector: u64,
        ctx: &mut ReplayCtx,
    ) -> Result<()> {
        match entry {
            JournalEntry::Start { .. } => {} // only lives in sector 0
            JournalEntry::SmallWrite {
                oid,
                version,
                offset,
                len,
                data_offset,
                instant,
            } => {
                if version <= self.clean_version(oid) {
                    return Ok(()); // already folded into the clean state
                }
                let payload = self.journal.read_payload(data_offset, len)?;
                self.dirty.insert(
                    ObjVer::new(oid, version),
                    DirtyEntry {
                        state: ObjectState::new(WriteKind::Small, Workflow::Synced, instant),
                        location: None,
                        offset,
                        len,
                        journal_sector: Some(sector),
                        payload: Some(payload),
                    },
                );
                self.journal.ref_sector(sector);
                if instant {
                    self.fold_stable_replay(ObjVer::new(oid, version), ctx);
                }
            }
            JournalEntry::BigWrite {
                oid,
                version,
                location,
                instant,
            } => {
                if version <= self.clean_version(oid) {
                    return Ok(());
                }
                self.dirty.insert(
                    ObjVer::new(oid, version),
                    DirtyEntry {
                        state: ObjectState::new(WriteKind::Big, Workflow::Synced, instant),
                        location: Some(location),
                        offset: 0,
                        len: self.block_size,
                        journal_sector: Some(sector),
                        payload: None,
                    },
                );
                self.journal.ref_sector(sector);
                if instant {
                    self.fold_stable_replay(ObjVer::new(oid, version), ctx);
                }
            }
            JournalEntry::Stable { oid, version } => {
                self.fold_stable_replay(ObjVer::new(oid, version), ctx);
            }
            JournalEntry::Rollback { oid, version } => {
                self.discard_above(oid, version);
            }
            JournalEntry::Delete {
                oid,
                version,
                instant: _,
            } => {
                if version <= self.clean_version(oid) {
                    return Ok(());
                }
                self.dirty.insert(
                    ObjVer::new(oid, version),
                    DirtyEntry {
                        state: ObjectState::new(WriteKind::Delete, Workflow::Synced, false),
                        location: None,
                        offset: 0,
                        len: 0,
                        journal_sector: Some(sector),
                        payload: None,
                    },
                );
                self.journal.ref_sector(sector);
                // Deletes are stable as soon as they are synced.
                self.fold_stable_replay(ObjVer::new(oid, version), ctx);
            }
        }
        Ok(())
    }

    /// The in-memory half of stabilisation during replay: fold dirty
    /// versions up to `target` into the clean index and queue the device
    /// work (payload copies, metadata records) for materialisation.
    fn fold_stable_replay(&mut self, target: ObjVer, ctx: &mut ReplayCtx) {
        let oid = target.oid;
        let folded: Vec<ObjVer> = self
            .dirty
            .range(ObjVer::new(oid, 0)..=ObjVer::new(oid, target.version))
            .map(|(ov, _)| *ov)
            .collect();
        if folded.is_empty() {
            return; // already stable (idempotent replay)
        }

        let prior = self.clean.get(&oid).copied();
        let mut cur: Option<(u64, Option<u64>)> =
            prior.map(|c| (c.version, (c.location != UNALLOCATED).then_some(c.location)));
        let mut pm = ctx.pending.remove(&oid).unwrap_or(PendingMod {
            base: cur.and_then(|(_, l)| l),
            payloads: Vec::new(),
        });

        for ov in &folded {
            let entry = self.dirty.remove(ov).unwrap();
            if let Some(sector) = entry.journal_sector {
                self.journal.unref_sector(sector);
            }
            match entry.state.kind() {
                WriteKind::Big => {
                    let location = entry.location.expect("replayed big write without block");
                    if let Some((_, Some(old))) = cur {
                        ctx.meta_touched.insert(old);
                    }
                    cur = Some((ov.version, Some(location)));
                    pm = PendingMod {
                        base: Some(location),
                        payloads: Vec::new(),
                    };
                    ctx.meta_touched.insert(location);
                }
                WriteKind::Small => {
                    pm.payloads
                        .push((entry.offset, entry.payload.unwrap_or_default()));
                    let base = cur.and_then(|(_, l)| l);
                    cur = Some((ov.version, base));
                }
                WriteKind::Delete => {
                    if let Some((_, Some(old))) = cur {
                        ctx.meta_touched.insert(old);
                    }
                    cur = None;
                    pm = PendingMod {
                        base: None,
                        payloads: Vec::new(),
                    };
                }
            }
        }

        match cur {
            Some((version, location)) => {
                if let Some(old) = prior {
                    if old.location != UNALLOCATED {
                        ctx.meta_touched.insert(old.location);
                    }
                }
                let location = location.unwrap_or(UNALLOCATED);
                if location != UNALLOCATED {
                    ctx.meta_touched.insert(location);
                }
                self.clean.insert(oid, CleanEntry { version, location });
                if !pm.payloads.is_empty() || location == UNALLOCATED {
                    ctx.pending.insert(oid, pm);
                }
            }
            None => {
                if let Some(old) = prior {
                    if old.location != UNALLOCATED {
                        ctx.meta_touched.insert(old.location);
                    }
                }
                self.clean.remove(&oid);
            }
        }

        if self.unstable.get(&oid).is_some_and(|v| *v <= target.version) {
            self.unstable.remove(&oid);
        }
    }

    /// Write out everything replay owes the devices: rebuild the
    /// allocator from final ownership, assign blocks to objects that
    /// still need one, fold pending payloads, and rewrite every touched
    /// metadata record.
    fn materialize(&mut self, mut ctx: ReplayCtx) -> Result<()> {
        self.alloc = BlockBitmap::new(self.meta.block_count());
        for c in self.clean.values() {
            if c.location != UNALLOCATED {
                self.alloc.mark_used(c.location)?;
            }
        }
        for e in self.dirty.values() {
            if e.state.kind() == WriteKind::Big {
                if let Some(location) = e.location {
                    self.alloc.mark_used(location)?;
                }
            }
        }

        let mut wrote_data = false;
        for (oid, pm) in std::mem::take(&mut ctx.pending) {
            let Some(clean) = self.clean.get(&oid).copied() else {
                continue; // deleted later in the journal
            };
            let block = match pm.base {
                Some(b) => b,
                None => {
                    let b = self.alloc.allocate().ok_or(Error::DiskFull)?;
                    let zero = AlignedBuffer::new(self.block_size as usize, self.data.alignment());
                    self.data
                        .write_at(b * u64::from(self.block_size), zero.as_slice())?;
                    b
                }
            };
            if clean.location == UNALLOCATED {
                self.clean.insert(
                    oid,
                    CleanEntry {
                        version: clean.version,
                        location: block,
                    },
                );
            }
            for (offset, payload) in &pm.payloads {
                self.write_block_range(block, *offset, payload)?;
                wrote_data = true;
            }
            ctx.meta_touched.insert(block);
        }
        if wrote_data && !self.cfg.disable_data_fsync {
            self.data.sync()?;
        }

        if !ctx.meta_touched.is_empty() {
            let owners: HashMap<u64, (Oid, u64)> = self
                .clean
                .iter()
                .map(|(oid, c)| (c.location, (*oid, c.version)))
                .collect();
            for block in ctx.meta_touched {
                if block == UNALLOCATED {
                    continue;
                }
                let rec = owners
                    .get(&block)
                    .map(|(oid, version)| MetaRecord {
                        oid: *oid,
                        version: *version,
                    });
                self.meta.write_record(block, rec.as_ref())?;
            }
            self.meta.sync()?;
        }
        Ok(())
    }

    fn clean_version(&self, oid: Oid) -> u64 {
        self.clean.get(&oid).map(|c| c.version).unwrap_or(0)
    }
}
