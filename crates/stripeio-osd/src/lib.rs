//! stripeio OSD core
//!
//! One `OsdCore` owns one blockstore and the PGs this OSD serves. Client
//! operations arrive through the dispatcher; for PGs where this OSD is
//! primary they run the replication pipeline, everything else maps
//! directly onto the local blockstore. Cluster configuration changes
//! (PG assignment, peer liveness) come in through `apply_*` calls and
//! drive peering, flush and recovery.

pub mod dispatcher;
pub mod flush;
pub mod net;
pub mod peering;
pub mod peers;
pub mod pg;
pub mod primary;
pub mod recovery;

use parking_lot::Mutex;
use pg::Pg;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stripeio_blockstore::{Blockstore, BsOp, BsOut};
use stripeio_common::pg_states::*;
use stripeio_common::{Error, Oid, OsdConfig, OsdNum, PgNum, Result};
use stripeio_proto::Messenger;
use tokio::sync::{mpsc, Notify};
use tracing::info;

pub use peers::PeerPool;

pub struct OsdCore {
    pub cfg: OsdConfig,
    pub osd_num: OsdNum,
    pub(crate) bs: Mutex<Blockstore>,
    pub(crate) pgs: Mutex<HashMap<PgNum, Pg>>,
    pub(crate) peers: PeerPool,
    /// Peers the cluster store currently reports up.
    pub(crate) up_peers: Mutex<HashSet<OsdNum>>,
    /// PG count of the pool (object → PG mapping).
    pg_count: AtomicU32,
    /// Wakes the recovery loop when degraded/misplaced sets change.
    pub(crate) recovery_kick: Notify,
    /// PG state reports for publication in the cluster store.
    state_reports: mpsc::UnboundedSender<(PgNum, OsdNum, u32)>,
}

impl OsdCore {
    pub fn new(
        cfg: OsdConfig,
        bs: Blockstore,
        messenger: Arc<dyn Messenger>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<(PgNum, OsdNum, u32)>) {
        let op_timeout = Duration::from_millis(cfg.peer_op_timeout_ms);
        let (tx, rx) = mpsc::unbounded_channel();
        let core = Arc::new(Self {
            osd_num: cfg.osd_num,
            peers: PeerPool::new(messenger, op_timeout),
            bs: Mutex::new(bs),
            pgs: Mutex::new(HashMap::new()),
            up_peers: Mutex::new(HashSet::new()),
            pg_count: AtomicU32::new(1),
            recovery_kick: Notify::new(),
            state_reports: tx,
            cfg,
        });
        (core, rx)
    }

    pub fn set_pg_count(&self, pg_count: u32) {
        self.pg_count.store(pg_count.max(1), Ordering::SeqCst);
    }

    pub fn pg_count(&self) -> u32 {
        self.pg_count.load(Ordering::SeqCst)
    }

    pub fn pg_of(&self, oid: Oid) -> PgNum {
        oid.to_pg(self.pg_count(), self.cfg.pg_stripe_size)
    }

    /// Run a blockstore operation to completion. A write serialised
    /// behind an unsynced big write of the same object is unblocked by an
    /// inline sync; an operation parked on journal pressure is abandoned
    /// with `JournalFull` and the caller retries after stabilisation
    /// reclaims space.
    pub fn bs_execute(&self, op: BsOp) -> Result<BsOut> {
        let mut bs = self.bs.lock();
        let id = bs.enqueue(op);
        let mut completions = bs.process();
        if let Some(idx) = completions.iter().position(|c| c.id == id) {
            return completions.swap_remove(idx).result;
        }

        // Parked. Drive a sync through the queue: it advances the big
        // writes later operations serialise behind.
        let sync_id = bs.enqueue(BsOp::Sync);
        let mut completions = bs.process();
        if let Some(idx) = completions.iter().position(|c| c.id == id) {
            return completions.swap_remove(idx).result;
        }
        bs.cancel(sync_id);
        bs.cancel(id);
        Err(Error::JournalFull)
    }

    /// Apply one PG's configuration. Returns `true` when the change
    /// requires (re-)peering by this OSD as primary.
    pub fn apply_pg_config(
        &self,
        pg_num: PgNum,
        primary: OsdNum,
        target_set: Vec<OsdNum>,
        target_history: Vec<Vec<OsdNum>>,
        all_peers: Vec<OsdNum>,
        pause: bool,
    ) -> bool {
        let mut pgs = self.pgs.lock();
        if primary != self.osd_num {
            if pgs.remove(&pg_num).is_some() {
                info!(pg_num, "no longer primary for PG");
            }
            return false;
        }

        let mut union: Vec<OsdNum> = target_set.clone();
        for p in all_peers.iter().chain(target_history.iter().flatten()) {
            if *p != 0 && !union.contains(p) {
                union.push(*p);
            }
        }

        match pgs.get_mut(&pg_num) {
            Some(pg) if pg.target_set == target_set && pg.is_active() && !pause => false,
            Some(pg) => {
                pg.target_set = target_set;
                pg.target_history = target_history;
                pg.all_peers = union;
                pg.state = if pause { PG_OFFLINE } else { PG_PEERING };
                !pause
            }
            None => {
                let mut pg = Pg::new(pg_num, target_set, union);
                pg.target_history = target_history;
                pg.state = if pause { PG_OFFLINE } else { PG_PEERING };
                pgs.insert(pg_num, pg);
                !pause
            }
        }
    }

    /// Peer liveness change from the cluster store.
    pub fn apply_peer_state(&self, osd_num: OsdNum, up: bool) -> Vec<PgNum> {
        let mut up_peers = self.up_peers.lock();
        let changed = if up {
            up_peers.insert(osd_num)
        } else {
            up_peers.remove(&osd_num)
        };
        if !changed {
            return Vec::new();
        }
        drop(up_peers);
        info!(osd_num, up, "peer state changed");

        // Every PG whose set contains the peer must re-peer.
        let mut affected = Vec::new();
        let mut pgs = self.pgs.lock();
        for (pg_num, pg) in pgs.iter_mut() {
            if pg.target_set.contains(&osd_num) || pg.all_peers.contains(&osd_num) {
                pg.state = PG_PEERING;
                affected.push(*pg_num);
            }
        }
        affected
    }

    pub fn peer_is_up(&self, osd_num: OsdNum) -> bool {
        osd_num == self.osd_num || self.up_peers.lock().contains(&osd_num)
    }

    pub fn up_peer_list(&self) -> Vec<OsdNum> {
        self.up_peers.lock().iter().copied().collect()
    }

    /// Mark a PG for re-peering after a peer sub-operation failed.
    pub(crate) fn repeer_pg(&self, pg_num: PgNum) {
        let mut pgs = self.pgs.lock();
        if let Some(pg) = pgs.get_mut(&pg_num) {
            if pg.is_active() {
                pg.state = PG_REPEERING;
            }
        }
    }

    pub(crate) fn report_pg_state(&self, pg_num: PgNum, state: u32) {
        let _ = self.state_reports.send((pg_num, self.osd_num, state));
    }

    /// Fatal local failure: in-memory and on-disk state may have
    /// diverged, the daemon must not continue serving.
    pub(crate) fn fatal(&self, context: &str, e: &Error) -> ! {
        tracing::error!("fatal error during {context}: {e}; aborting OSD");
        std::process::abort();
    }

    /// Snapshot of a PG's state bits (for tests and status reporting).
    pub fn pg_state(&self, pg_num: PgNum) -> Option<u32> {
        self.pgs.lock().get(&pg_num).map(|pg| pg.state)
    }

    /// Point-in-time status for observability endpoints.
    pub fn status(&self) -> OsdStatus {
        let bs = self.bs.lock();
        let pgs = self.pgs.lock();
        OsdStatus {
            osd_num: self.osd_num,
            free_blocks: bs.free_blocks(),
            journal_free_bytes: bs.journal_free_bytes(),
            dirty_entries: bs.dirty_len(),
            unstable_objects: bs.unstable_writes().len(),
            data_syncs: bs.data_sync_count(),
            journal_syncs: bs.journal_sync_count(),
            pgs: pgs
                .iter()
                .map(|(n, pg)| PgStatus {
                    pg_num: *n,
                    state: pg.state,
                    degraded: pg.degraded.len(),
                    misplaced: pg.misplaced.len(),
                    flush_actions: pg.flush_actions.len(),
                })
                .collect(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct OsdStatus {
    pub osd_num: OsdNum,
    pub free_blocks: u64,
    pub journal_free_bytes: u64,
    pub dirty_entries: usize,
    pub unstable_objects: usize,
    pub data_syncs: u64,
    pub journal_syncs: u64,
    pub pgs: Vec<PgStatus>,
}

#[derive(Clone, Debug)]
pub struct PgStatus {
    pub pg_num: PgNum,
    pub state: u32,
    pub degraded: usize,
    pub misplaced: usize,
    pub flush_actions: usize,
}
