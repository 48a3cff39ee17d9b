//! Sync: make accepted writes durable
//!
//! A sync captures every unsynced write known at the instant it is first
//! dequeued and runs them through a linear state machine:
//!
//! ```text
//! start -> (has big writes) data fsync
//!       -> journal write (big-write entries + the dirty current sector)
//!       -> journal fsync -> done
//! ```
//!
//! With only small writes the data fsync is skipped; with
//! `immediate_commit = all` the whole sync is a no-op. Syncs acknowledge
//! in FIFO order; writes accepted after a sync started are carried by the
//! next one.

use crate::engine::{Blockstore, Step};
use crate::layout::{JournalEntry, JOURNAL_STABILIZE_RESERVATION};
use crate::op::{BsOp, BsOut, OpId, Progress, SyncProgress, SyncState};
use stripeio_common::{Error, ImmediateCommit, ObjVer, Result, Workflow, WriteKind};
use tracing::trace;

impl Blockstore {
    pub(crate) fn progress_sync(
        &mut self,
        id: OpId,
        op: BsOp,
        progress: Progress,
    ) -> (Step, BsOp, Progress) {
        if self.cfg.immediate_commit == ImmediateCommit::All {
            // The devices commit synchronously; there is nothing to flush.
            return (Step::Done(Ok(BsOut::Done)), op, progress);
        }

        let mut sp = match progress {
            Progress::Queued => {
                if self.sync_in_progress.is_some_and(|other| other != id) {
                    // An earlier sync has not acknowledged yet.
                    return (Step::NotReady, op, Progress::Queued);
                }
                self.sync_in_progress = Some(id);
                SyncProgress {
                    state: SyncState::Start,
                    big: std::mem::take(&mut self.unsynced_big),
                    small: std::mem::take(&mut self.unsynced_small),
                }
            }
            Progress::Sync(sp) => sp,
            other => {
                return (
                    Step::Done(Err(Error::internal(format!(
                        "sync in unexpected progress state {other:?}"
                    )))),
                    op,
                    Progress::Queued,
                )
            }
        };

        loop {
            match sp.state {
                SyncState::Start => {
                    if sp.big.is_empty() && sp.small.is_empty() {
                        // Nothing to do; completes without any I/O.
                        return (Step::Done(Ok(BsOut::Done)), op, Progress::Sync(sp));
                    }
                    if !sp.big.is_empty() && !self.cfg.disable_data_fsync {
                        if let Err(e) = self.data.sync() {
                            return (Step::Done(Err(e)), op, Progress::Sync(sp));
                        }
                    }
                    sp.state = SyncState::DataFsyncDone;
                }
                SyncState::DataFsyncDone => {
                    if !sp.big.is_empty()
                        && !self
                            .journal
                            .reserve(sp.big.len(), 56, 0, JOURNAL_STABILIZE_RESERVATION)
                    {
                        // Suspend; the data fsync is not repeated.
                        return (Step::NotReady, op, Progress::Sync(sp));
                    }
                    if let Err(e) = self.write_big_entries(&sp.big) {
                        return (Step::Done(Err(e)), op, Progress::Sync(sp));
                    }
                    if let Err(e) = self.journal.flush_cur_sector() {
                        return (Step::Done(Err(e)), op, Progress::Sync(sp));
                    }
                    sp.state = SyncState::JournalWriteDone;
                }
                SyncState::JournalWriteDone => {
                    if !self.cfg.disable_journal_fsync {
                        if let Err(e) = self.journal.fsync() {
                            return (Step::Done(Err(e)), op, Progress::Sync(sp));
                        }
                    }
                    sp.state = SyncState::Done;
                }
                SyncState::Done => {
                    let result = self.ack_sync(&sp);
                    return (Step::Done(result.map(|()| BsOut::Done)), op, Progress::Sync(sp));
                }
            }
        }
    }

    /// Append the metadata journal entries for the batch's big writes and
    /// attach their sector references.
    fn write_big_entries(&mut self, big: &[ObjVer]) -> Result<()> {
        for ov in big {
            let Some(entry) = self.dirty.get(ov) else {
                continue; // rolled back while the sync was suspended
            };
            let je = JournalEntry::BigWrite {
                oid: ov.oid,
                version: ov.version,
                location: entry
                    .location
                    .ok_or_else(|| Error::internal(format!("big write {ov} has no block")))?,
                instant: entry.state.is_instant(),
            };
            let pos = self.journal.append(&je)?;
            self.journal.ref_sector(pos.sector);
            let entry = self.dirty.get_mut(ov).unwrap();
            debug_assert!(entry.journal_sector.is_none());
            entry.journal_sector = Some(pos.sector);
        }
        Ok(())
    }

    /// The batch is durable: advance every carried write to SYNCED,
    /// publish it as unstable, and promote INSTANT writes and deletes
    /// straight to stable.
    fn ack_sync(&mut self, sp: &SyncProgress) -> Result<()> {
        let mut to_stabilize = Vec::new();

        for ov in sp.big.iter().chain(sp.small.iter()) {
            let Some(entry) = self.dirty.get_mut(ov) else {
                continue; // rolled back while the sync was suspended
            };
            if entry.state.workflow() >= Workflow::Synced {
                continue;
            }
            entry.state = entry.state.advanced_to(Workflow::Synced);
            trace!(ov = %ov, "synced");

            let unstab = self.unstable.entry(ov.oid).or_insert(0);
            *unstab = (*unstab).max(ov.version);

            if entry.state.is_instant() || entry.state.kind() == WriteKind::Delete {
                to_stabilize.push(*ov);
            }
        }

        if !to_stabilize.is_empty() {
            self.apply_stable_batch(&to_stabilize)?;
        }
        Ok(())
    }
}
