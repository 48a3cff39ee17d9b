//! Flush coordinator
//!
//! Turns the flush actions produced by peering into secondary-rollback
//! and secondary-stabilize sub-operations, batched per peer. A batch
//! never splits one object's versions across sub-operations, and holds at
//! most [`FLUSH_BATCH`] entries per peer. When a whole batch completes,
//! the submitted actions are erased, version overrides are cleared, and
//! writes parked on those objects resume.
//!
//! A failed sub-operation to a peer drops that peer's connection and
//! abandons the batch; the PG re-peers. A failure on the local
//! blockstore is fatal to the daemon.

use crate::pg::FlushKey;
use crate::OsdCore;
use std::collections::HashMap;
use stripeio_blockstore::BsOp;
use stripeio_common::pg_states::*;
use stripeio_common::{ObjVer, Oid, OsdNum, PgNum};
use stripeio_proto::OsdRequest;
use tracing::{info, warn};

/// Maximum reconciliation entries per peer per batch.
pub const FLUSH_BATCH: usize = 512;

/// One batch: per-peer rollback and stabilize lists.
#[derive(Debug, Default)]
struct FlushBatch {
    rollback_lists: HashMap<OsdNum, Vec<ObjVer>>,
    stable_lists: HashMap<OsdNum, Vec<ObjVer>>,
    /// Keys included in this batch (marked submitted in the PG).
    keys: Vec<FlushKey>,
}

impl OsdCore {
    /// Drain a PG's flush actions, batch by batch.
    pub fn flush_pg(
        self: std::sync::Arc<Self>,
        pg_num: PgNum,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(self.flush_pg_inner(pg_num))
    }

    async fn flush_pg_inner(self: std::sync::Arc<Self>, pg_num: PgNum) {
        loop {
            let batch = {
                let mut pgs = self.pgs.lock();
                let Some(pg) = pgs.get_mut(&pg_num) else { return };
                if !pg.is_active() {
                    return;
                }
                build_batch(&mut pg.flush_actions)
            };
            let Some(batch) = batch else {
                break; // nothing left
            };

            if !self.run_batch(pg_num, &batch).await {
                // Abandoned; the PG will re-peer and rebuild its actions.
                self.repeer_pg(pg_num);
                return;
            }

            // The batch is done: erase submitted actions, clear version
            // overrides of completed objects, resume parked writes.
            let (state, done) = {
                let mut pgs = self.pgs.lock();
                let Some(pg) = pgs.get_mut(&pg_num) else { return };
                let mut completed: Vec<Oid> = Vec::new();
                for key in &batch.keys {
                    pg.flush_actions.remove(key);
                    if !pg.has_pending_flush(key.oid) {
                        completed.push(key.oid);
                    }
                }
                completed.dedup();
                for oid in completed {
                    pg.ver_override.remove(&oid);
                    pg.wake_writes(oid);
                }
                let done = pg.flush_actions.is_empty();
                if done {
                    pg.state &= !PG_HAS_UNCLEAN;
                }
                (pg.state, done)
            };
            if done {
                self.report_pg_state(pg_num, state);
                info!(pg_num, "flush complete");
                break;
            }
        }

        // A re-peer requested while reconciling runs now that the PG is
        // clean.
        let repeer = self
            .pgs
            .lock()
            .get(&pg_num)
            .is_some_and(|pg| pg.state & PG_REPEERING != 0);
        if repeer {
            let this = self.clone();
            tokio::spawn(async move {
                let _ = this.peer_pg(pg_num).await;
            });
        }
    }

    /// Issue one secondary-rollback/secondary-stabilize per (peer, kind).
    /// Returns whether the whole batch succeeded.
    async fn run_batch(&self, pg_num: PgNum, batch: &FlushBatch) -> bool {
        for (lists, rollback) in [
            (&batch.rollback_lists, true),
            (&batch.stable_lists, false),
        ] {
            for (&osd, versions) in lists {
                if versions.is_empty() {
                    continue;
                }
                let result = if osd == self.osd_num {
                    // A local flush failure means local state cannot be
                    // trusted any more.
                    let op = if rollback {
                        BsOp::Rollback {
                            versions: versions.clone(),
                        }
                    } else {
                        BsOp::Stabilize {
                            versions: versions.clone(),
                        }
                    };
                    match self.bs_execute(op) {
                        Ok(_) => Ok(()),
                        Err(e) if e.is_retryable() => Err(e),
                        Err(e) => self.fatal("local flush operation", &e),
                    }
                } else {
                    let req = if rollback {
                        OsdRequest::SecRollback {
                            versions: versions.clone(),
                        }
                    } else {
                        OsdRequest::SecStabilize {
                            versions: versions.clone(),
                        }
                    };
                    self.peers.call(osd, req).await.map(|_| ())
                };
                if let Err(e) = result {
                    warn!(pg_num, osd, rollback, "flush sub-operation failed: {e}");
                    if osd != self.osd_num {
                        self.peers.drop_peer(osd).await;
                    }
                    return false;
                }
            }
        }
        true
    }
}

/// Pull the next batch out of the action map: up to [`FLUSH_BATCH`]
/// entries per peer, stopping only at an object boundary.
fn build_batch(
    actions: &mut std::collections::BTreeMap<FlushKey, crate::pg::FlushAction>,
) -> Option<FlushBatch> {
    if actions.is_empty() {
        return None;
    }
    let mut batch = FlushBatch::default();
    let mut prev_oid: Option<Oid> = None;

    for (key, action) in actions.iter_mut() {
        let at_boundary = prev_oid != Some(key.oid);
        if at_boundary {
            let over = batch
                .rollback_lists
                .values()
                .chain(batch.stable_lists.values())
                .any(|l| l.len() >= FLUSH_BATCH);
            if over {
                break; // stop only between objects
            }
        }
        action.submitted = true;
        batch.keys.push(*key);
        if let Some(version) = action.rollback_to {
            batch
                .rollback_lists
                .entry(key.osd)
                .or_default()
                .push(ObjVer::new(key.oid, version));
        }
        if let Some(version) = action.stable_to {
            batch
                .stable_lists
                .entry(key.osd)
                .or_default()
                .push(ObjVer::new(key.oid, version));
        }
        prev_oid = Some(key.oid);
    }
    Some(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::FlushAction;
    use std::collections::BTreeMap;

    #[test]
    fn test_batch_respects_object_boundaries() {
        let mut actions = BTreeMap::new();
        // FLUSH_BATCH stable entries for osd 2, then one more object with
        // two per-osd actions.
        for i in 0..FLUSH_BATCH as u64 {
            actions.insert(
                FlushKey {
                    oid: Oid::new(1, i * 4096),
                    osd: 2,
                },
                FlushAction {
                    stable_to: Some(1),
                    ..Default::default()
                },
            );
        }
        let tail_oid = Oid::new(2, 0);
        for osd in [2, 3] {
            actions.insert(
                FlushKey { oid: tail_oid, osd },
                FlushAction {
                    stable_to: Some(4),
                    ..Default::default()
                },
            );
        }

        let batch = build_batch(&mut actions).unwrap();
        // The tail object is cut off at its boundary.
        assert_eq!(batch.keys.len(), FLUSH_BATCH);
        assert!(batch.keys.iter().all(|k| k.oid != tail_oid));
        assert!(actions
            .iter()
            .filter(|(k, _)| k.oid == tail_oid)
            .all(|(_, a)| !a.submitted));

        // Second batch picks up the rest.
        let batch2 = build_batch(&mut actions).unwrap();
        assert!(batch2.keys.iter().any(|k| k.oid == tail_oid));
    }

    #[test]
    fn test_batch_splits_kinds_per_peer() {
        let mut actions = BTreeMap::new();
        actions.insert(
            FlushKey {
                oid: Oid::new(1, 0),
                osd: 2,
            },
            FlushAction {
                rollback_to: Some(1),
                ..Default::default()
            },
        );
        actions.insert(
            FlushKey {
                oid: Oid::new(1, 0),
                osd: 3,
            },
            FlushAction {
                stable_to: Some(2),
                ..Default::default()
            },
        );
        let batch = build_batch(&mut actions).unwrap();
        assert_eq!(batch.rollback_lists[&2], vec![ObjVer::new(Oid::new(1, 0), 1)]);
        assert_eq!(batch.stable_lists[&3], vec![ObjVer::new(Oid::new(1, 0), 2)]);
    }

    #[test]
    fn test_empty_actions_no_batch() {
        let mut actions: BTreeMap<FlushKey, FlushAction> = BTreeMap::new();
        assert!(build_batch(&mut actions).is_none());
    }
}
