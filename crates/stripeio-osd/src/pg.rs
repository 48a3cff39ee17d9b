//! Placement group state
//!
//! A PG is the unit of replication and peering. The primary OSD of an
//! active PG fans client writes out to the PG's replica set; after
//! peering it reconciles diverging replicas through flush actions
//! (rollback or make-stable per object and OSD) and schedules recovery
//! for degraded and misplaced objects.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use stripeio_common::pg_states::*;
use stripeio_common::{ObjVer, Oid, OsdNum, PgNum};
use tokio::sync::oneshot;

/// One reconciliation step for an (object, OSD) pair.
#[derive(Clone, Copy, Debug, Default)]
pub struct FlushAction {
    /// Discard this replica's versions above the value.
    pub rollback_to: Option<u64>,
    /// Promote this replica to stable at the value.
    pub stable_to: Option<u64>,
    /// Part of the batch currently in flight.
    pub submitted: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FlushKey {
    pub oid: Oid,
    pub osd: OsdNum,
}

pub struct Pg {
    pub pg_num: PgNum,
    pub state: u32,
    /// Desired replica set from configuration.
    pub target_set: Vec<OsdNum>,
    /// Historical replica sets; peering refuses to start while any of
    /// them has no live member (data could be silently lost).
    pub target_history: Vec<Vec<OsdNum>>,
    /// Everybody who may hold data: target set, historical sets, extras.
    pub all_peers: Vec<OsdNum>,
    /// Reconciliation work produced by peering, keyed (object, osd).
    pub flush_actions: BTreeMap<FlushKey, FlushAction>,
    /// Version overrides while an object is being reconciled.
    pub ver_override: HashMap<Oid, u64>,
    /// Writes parked until their object's flush actions complete.
    pub write_queue: HashMap<Oid, Vec<oneshot::Sender<()>>>,
    /// Objects missing from live target replicas.
    pub degraded: BTreeSet<Oid>,
    /// Objects whose copies live outside the target set.
    pub misplaced: BTreeSet<Oid>,
    /// (oid, version) pairs written since the last stabilize broadcast.
    pub unstable_writes: Vec<ObjVer>,
    /// Client operations currently in flight.
    pub inflight: usize,
    /// Operating with fewer live replicas than the target set.
    pub missing_members: bool,
}

impl Pg {
    pub fn new(pg_num: PgNum, target_set: Vec<OsdNum>, all_peers: Vec<OsdNum>) -> Self {
        Self {
            pg_num,
            state: PG_OFFLINE,
            target_set,
            target_history: Vec::new(),
            all_peers,
            flush_actions: BTreeMap::new(),
            ver_override: HashMap::new(),
            write_queue: HashMap::new(),
            degraded: BTreeSet::new(),
            misplaced: BTreeSet::new(),
            unstable_writes: Vec::new(),
            inflight: 0,
            missing_members: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state & PG_ACTIVE != 0
    }

    /// Whether writes to this object must wait for reconciliation.
    pub fn has_pending_flush(&self, oid: Oid) -> bool {
        self.flush_actions
            .range(
                FlushKey { oid, osd: 0 }..=FlushKey {
                    oid,
                    osd: OsdNum::MAX,
                },
            )
            .next()
            .is_some()
    }

    /// Park a write until the object's flush actions finish.
    pub fn park_write(&mut self, oid: Oid) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.write_queue.entry(oid).or_default().push(tx);
        rx
    }

    /// Wake writes parked on an object.
    pub fn wake_writes(&mut self, oid: Oid) {
        if let Some(waiters) = self.write_queue.remove(&oid) {
            for tx in waiters {
                let _ = tx.send(());
            }
        }
    }

    /// Recompute the degraded/misplaced state bits.
    pub fn refresh_state_bits(&mut self) {
        self.state &= !(PG_HAS_DEGRADED | PG_HAS_MISPLACED | PG_HAS_UNCLEAN | PG_DEGRADED);
        if !self.degraded.is_empty() {
            self.state |= PG_HAS_DEGRADED;
        }
        if self.missing_members || !self.degraded.is_empty() {
            self.state |= PG_DEGRADED;
        }
        if !self.misplaced.is_empty() {
            self.state |= PG_HAS_MISPLACED;
        }
        if !self.flush_actions.is_empty() {
            self.state |= PG_HAS_UNCLEAN;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_key_range_per_object() {
        let mut pg = Pg::new(1, vec![1, 2, 3], vec![1, 2, 3]);
        let a = Oid::new(1, 0);
        let b = Oid::new(1, 4096);
        pg.flush_actions.insert(
            FlushKey { oid: a, osd: 2 },
            FlushAction {
                stable_to: Some(3),
                ..Default::default()
            },
        );
        assert!(pg.has_pending_flush(a));
        assert!(!pg.has_pending_flush(b));
    }

    #[test]
    fn test_state_bits_refresh() {
        let mut pg = Pg::new(1, vec![1, 2, 3], vec![1, 2, 3]);
        pg.state = PG_ACTIVE;
        pg.degraded.insert(Oid::new(1, 0));
        pg.refresh_state_bits();
        assert!(pg.state & PG_HAS_DEGRADED != 0);
        assert!(pg.state & PG_DEGRADED != 0);

        pg.degraded.clear();
        pg.misplaced.insert(Oid::new(2, 0));
        pg.refresh_state_bits();
        assert!(pg.state & PG_HAS_DEGRADED == 0);
        assert!(pg.state & PG_HAS_MISPLACED != 0);
        assert!(pg.state & PG_ACTIVE != 0);
    }
}
