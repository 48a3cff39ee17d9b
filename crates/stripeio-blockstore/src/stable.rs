//! Stabilize and rollback
//!
//! Stabilize promotes synced versions to the clean index: a STABLE entry
//! is journalled and fsynced, small-write payloads are copied from the
//! journal onto the data device, the metadata area is updated sector-wise,
//! and every superseded resource (older journal entries, data blocks of
//! older big writes) is released. Rollback is the mirror image: it
//! discards dirty versions above a given one and journals the fact so a
//! crash cannot resurrect them.
//!
//! Both operations batch their journal entries into shared sectors under a
//! single fsync.

use crate::engine::{Blockstore, Step};
use crate::layout::{JournalEntry, MetaRecord};
use crate::op::{BsOp, BsOut};
use crate::raw_io::AlignedBuffer;
use stripeio_common::{Error, ObjVer, Oid, Result, Workflow, WriteKind};
use tracing::{debug, trace};

impl Blockstore {
    pub(crate) fn progress_stabilize(&mut self, op: &BsOp) -> Step {
        let BsOp::Stabilize { versions } = op else {
            unreachable!()
        };

        let mut todo: Vec<ObjVer> = Vec::new();
        for ov in versions {
            match self.dirty.get(ov) {
                None => {
                    let already_stable = self
                        .clean
                        .get(&ov.oid)
                        .is_some_and(|c| c.version >= ov.version);
                    if !already_stable {
                        return Step::Done(Err(Error::invalid_input(format!(
                            "no such object version {ov}"
                        ))));
                    }
                }
                Some(e) if !e.state.is_synced() => {
                    return Step::Done(Err(Error::SyncRequired(*ov)));
                }
                Some(e) if e.state.is_stable() => {}
                Some(_) => todo.push(*ov),
            }
        }
        if todo.is_empty() {
            // Everything listed is already stable.
            return Step::Done(Ok(BsOut::Done));
        }

        // Stabilize runs against the reservation, so it proceeds even when
        // ordinary writes are refused. It also reclaims space as it goes,
        // so a batch larger than the current free tail is simply applied
        // in chunks.
        let mut idx = 0;
        while idx < todo.len() {
            let mut n = 0;
            while idx + n < todo.len() && self.journal.reserve(n + 1, 40, 0, 0) {
                n += 1;
            }
            if n == 0 {
                return Step::NotReady;
            }
            let chunk: Vec<_> = todo[idx..idx + n].to_vec();
            for ov in &chunk {
                let je = JournalEntry::Stable {
                    oid: ov.oid,
                    version: ov.version,
                };
                if let Err(e) = self.journal.append(&je) {
                    return Step::Done(Err(e));
                }
            }
            if let Err(e) = self.flush_and_sync_journal() {
                return Step::Done(Err(e));
            }
            if let Err(e) = self.apply_stable_batch(&chunk) {
                return Step::Done(Err(e));
            }
            idx += n;
        }
        Step::Done(Ok(BsOut::Done))
    }

    pub(crate) fn progress_rollback(&mut self, op: &BsOp) -> Step {
        let BsOp::Rollback { versions } = op else {
            unreachable!()
        };

        // Validate before journalling anything.
        let mut todo: Vec<ObjVer> = Vec::new();
        for ov in versions {
            if let Some(clean) = self.clean.get(&ov.oid) {
                if ov.version < clean.version {
                    return Step::Done(Err(Error::invalid_input(format!(
                        "cannot roll {} back below stable version {}",
                        ov.oid, clean.version
                    ))));
                }
            }
            let mut any = false;
            for (dv, e) in self
                .dirty
                .range(ObjVer::new(ov.oid, ov.version + 1)..=ObjVer::new(ov.oid, u64::MAX))
            {
                if e.state.workflow() < Workflow::Written {
                    // Device work still outstanding; settle first.
                    return Step::Done(Err(Error::SyncRequired(*dv)));
                }
                any = true;
            }
            if any {
                todo.push(*ov);
            }
        }
        if todo.is_empty() {
            return Step::Done(Ok(BsOut::Done));
        }

        if !self.journal.reserve(todo.len(), 40, 0, 0) {
            return Step::NotReady;
        }
        for ov in &todo {
            let je = JournalEntry::Rollback {
                oid: ov.oid,
                version: ov.version,
            };
            if let Err(e) = self.journal.append(&je) {
                return Step::Done(Err(e));
            }
        }
        if let Err(e) = self.flush_and_sync_journal() {
            return Step::Done(Err(e));
        }

        for ov in &todo {
            self.discard_above(ov.oid, ov.version);
        }
        if let Err(e) = self.reclaim_journal_space() {
            return Step::Done(Err(e));
        }
        Step::Done(Ok(BsOut::Done))
    }

    pub(crate) fn flush_and_sync_journal(&mut self) -> Result<()> {
        self.journal.flush_cur_sector()?;
        if !self.cfg.disable_journal_fsync {
            self.journal.fsync()?;
        }
        Ok(())
    }

    /// Discard every dirty version of `oid` strictly above `version`,
    /// releasing journal references and data blocks, and record the
    /// ceiling so the versions are never reassigned.
    pub(crate) fn discard_above(&mut self, oid: Oid, version: u64) {
        let doomed: Vec<ObjVer> = self
            .dirty
            .range(ObjVer::new(oid, version + 1)..=ObjVer::new(oid, u64::MAX))
            .map(|(ov, _)| *ov)
            .collect();
        let mut ceiling = 0;
        for ov in &doomed {
            let entry = self.dirty.remove(ov).unwrap();
            debug!(%ov, "rolling back");
            if let Some(sector) = entry.journal_sector {
                self.journal.unref_sector(sector);
            }
            if entry.state.kind() == WriteKind::Big {
                if let Some(location) = entry.location {
                    self.alloc.free(location);
                }
            }
            self.unsynced_big.retain(|u| u != ov);
            self.unsynced_small.retain(|u| u != ov);
            ceiling = ceiling.max(ov.version);
        }
        if ceiling > 0 {
            let seen = self.max_seen.entry(oid).or_insert(0);
            *seen = (*seen).max(ceiling);
        }

        // Recompute the published unstable version for the object.
        let remaining = self
            .dirty
            .range(ObjVer::new(oid, 0)..=ObjVer::new(oid, u64::MAX))
            .filter(|(_, e)| e.state.is_synced() && !e.state.is_stable())
            .map(|(ov, _)| ov.version)
            .next_back();
        match remaining {
            Some(v) => {
                self.unstable.insert(oid, v);
            }
            None => {
                self.unstable.remove(&oid);
            }
        }
    }

    /// Apply stabilisation of the given versions (all must be SYNCED
    /// dirty entries) and release everything they supersede. One metadata
    /// fsync covers the batch; the journal start then advances over the
    /// reclaimed entries.
    pub(crate) fn apply_stable_batch(&mut self, versions: &[ObjVer]) -> Result<()> {
        let mut wrote_data = false;
        for ov in versions {
            wrote_data |= self.apply_stable_one(*ov)?;
        }
        if wrote_data && !self.cfg.disable_data_fsync {
            // Small-write copies must be durable before the metadata
            // claims their version: the journal entries backing them are
            // reclaimed right below.
            self.data.sync()?;
        }
        self.meta.sync()?;
        self.reclaim_journal_space()?;
        Ok(())
    }

    pub(crate) fn reclaim_journal_space(&mut self) -> Result<()> {
        if self.journal.advance_start()? && !self.cfg.disable_journal_fsync {
            self.journal.fsync()?;
        }
        Ok(())
    }

    /// Stabilize a single version: fold every dirty version of the object
    /// up to and including it into the clean state, bottom-up. Returns
    /// whether the data device was written (small-write copies).
    pub(crate) fn apply_stable_one(&mut self, target: ObjVer) -> Result<bool> {
        let oid = target.oid;
        let folded: Vec<ObjVer> = self
            .dirty
            .range(ObjVer::new(oid, 0)..=ObjVer::new(oid, target.version))
            .map(|(ov, _)| *ov)
            .collect();
        if folded.is_empty() {
            return Ok(false); // already stable (idempotent replay)
        }

        let prior_clean = self.clean.get(&oid).copied();
        let mut cur = prior_clean;
        let mut wrote_data = false;
        let mut freed_blocks: Vec<u64> = Vec::new();

        for ov in &folded {
            let entry = self.dirty.get(ov).expect("folded entry disappeared");
            debug_assert!(entry.state.is_synced(), "stabilizing unsynced {ov}");
            match entry.state.kind() {
                WriteKind::Big => {
                    let location = entry
                        .location
                        .ok_or_else(|| Error::internal(format!("big write {ov} has no block")))?;
                    if let Some(old) = cur {
                        if old.location != location {
                            freed_blocks.push(old.location);
                        }
                    }
                    cur = Some(crate::engine::CleanEntry {
                        version: ov.version,
                        location,
                    });
                }
                WriteKind::Small => {
                    let (location, is_fresh) = match cur {
                        Some(c) => (c.location, false),
                        None => (self.alloc.allocate().ok_or(Error::DiskFull)?, true),
                    };
                    if is_fresh {
                        // Stale device content must not show through the
                        // unwritten parts of the block.
                        let zero =
                            AlignedBuffer::new(self.block_size as usize, self.data.alignment());
                        self.data
                            .write_at(location * u64::from(self.block_size), zero.as_slice())?;
                    }
                    let offset = entry.offset;
                    let payload = entry
                        .payload
                        .clone()
                        .ok_or_else(|| Error::internal(format!("small write {ov} lost payload")))?;
                    self.write_block_range(location, offset, &payload)?;
                    wrote_data = true;
                    cur = Some(crate::engine::CleanEntry {
                        version: ov.version,
                        location,
                    });
                }
                WriteKind::Delete => {
                    if let Some(old) = cur {
                        freed_blocks.push(old.location);
                        self.meta.write_record(old.location, None)?;
                    }
                    cur = None;
                }
            }
        }

        // Publish the folded result in the metadata area.
        match (prior_clean, cur) {
            (_, Some(new)) => {
                self.meta.write_record(
                    new.location,
                    Some(&MetaRecord {
                        oid,
                        version: new.version,
                    }),
                )?;
                if let Some(old) = prior_clean {
                    if old.location != new.location {
                        self.meta.write_record(old.location, None)?;
                    }
                }
                self.clean.insert(oid, new);
            }
            (Some(_), None) => {
                // Deleted; records were cleared in the fold.
                self.clean.remove(&oid);
            }
            (None, None) => {
                self.clean.remove(&oid);
            }
        }

        // Release superseded resources: journal references of every folded
        // entry, data blocks of replaced big writes.
        for ov in &folded {
            let entry = self.dirty.remove(ov).unwrap();
            if let Some(sector) = entry.journal_sector {
                self.journal.unref_sector(sector);
            }
            if entry.state.kind() == WriteKind::Big {
                if let Some(location) = entry.location {
                    let kept = cur.is_some_and(|c| c.location == location);
                    if !kept && !freed_blocks.contains(&location) {
                        freed_blocks.push(location);
                    }
                }
            }
            trace!(%ov, "stable");
        }
        for block in freed_blocks {
            let kept = cur.is_some_and(|c| c.location == block);
            if !kept {
                self.alloc.free(block);
            }
        }

        // The object is no longer unstable up to the folded version.
        if self.unstable.get(&oid).is_some_and(|v| *v <= target.version) {
            self.unstable.remove(&oid);
        }
        if self.max_seen.get(&oid).is_some_and(|v| {
            *v <= self.clean.get(&oid).map(|c| c.version).unwrap_or(0)
        }) {
            self.max_seen.remove(&oid);
        }

        Ok(wrote_data)
    }

    /// Read-modify-write an arbitrary byte range of a data block through
    /// aligned I/O.
    pub(crate) fn write_block_range(&self, location: u64, offset: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let align = self.data.alignment() as u64;
        let block_base = location * u64::from(self.block_size);
        let start = u64::from(offset) / align * align;
        let end = (u64::from(offset) + data.len() as u64).div_ceil(align) * align;

        let mut buf = AlignedBuffer::new((end - start) as usize, self.data.alignment());
        self.data.read_at(block_base + start, buf.as_mut_slice())?;
        let patch_at = (u64::from(offset) - start) as usize;
        buf.as_mut_slice()[patch_at..patch_at + data.len()].copy_from_slice(data);
        self.data.write_at(block_base + start, buf.as_slice())
    }
}
