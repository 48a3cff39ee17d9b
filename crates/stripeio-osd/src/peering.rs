//! PG peering
//!
//! Peering reconciles replica divergence after a membership change or a
//! peer failure: the primary lists objects from every OSD that may hold
//! data, diffs the version sets, and produces flush actions (rollback of
//! uncommitted extra versions, stabilisation of synced-but-unstable
//! ones) plus the degraded and misplaced object sets that drive recovery.
//!
//! A write whose sync was acknowledged by every live target replica is
//! promoted; a write that missed quorum is rolled back — the client never
//! saw its sync complete, so discarding it is safe.

use crate::pg::{FlushAction, FlushKey};
use crate::OsdCore;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use stripeio_blockstore::{BsOp, BsOut, ListFilter};
use stripeio_common::pg_states::*;
use stripeio_common::{Error, ObjVer, Oid, OsdNum, PgNum, Result};
use stripeio_proto::{OsdReply, OsdRequest};
use tracing::{info, warn};

/// One replica's listing of a PG.
#[derive(Clone, Debug, Default)]
pub struct PeerListing {
    pub stable: Vec<ObjVer>,
    pub unstable: Vec<ObjVer>,
}

/// The outcome of diffing the listings.
#[derive(Debug, Default)]
pub struct PeeringResult {
    pub flush_actions: BTreeMap<FlushKey, FlushAction>,
    pub ver_override: HashMap<Oid, u64>,
    pub degraded: BTreeSet<Oid>,
    pub misplaced: BTreeSet<Oid>,
}

impl OsdCore {
    /// Run peering for one PG. On success the PG becomes ACTIVE (with
    /// degraded/misplaced bits as found) and reconciliation is spawned.
    pub async fn peer_pg(self: &std::sync::Arc<Self>, pg_num: PgNum) -> Result<()> {
        let (target_set, target_history, all_peers) = {
            let mut pgs = self.pgs.lock();
            let Some(pg) = pgs.get_mut(&pg_num) else {
                return Ok(());
            };
            pg.state = PG_PEERING;
            (
                pg.target_set.clone(),
                pg.target_history.clone(),
                pg.all_peers.clone(),
            )
        };
        self.report_pg_state(pg_num, PG_PEERING);
        info!(pg_num, "peering started");

        // A historical replica set with no live member means data may be
        // unreachable: refuse to start.
        for set in &target_history {
            if !set.is_empty() && set.iter().all(|&osd| osd != 0 && !self.peer_is_up(osd)) {
                let mut pgs = self.pgs.lock();
                if let Some(pg) = pgs.get_mut(&pg_num) {
                    pg.state = PG_INCOMPLETE;
                }
                self.report_pg_state(pg_num, PG_INCOMPLETE);
                warn!(pg_num, "historical replica set fully down, PG incomplete");
                return Ok(());
            }
        }

        // Collect listings from every live data holder.
        let filter = ListFilter {
            pg_count: self.pg_count(),
            pg_num,
            pg_stripe_size: self.cfg.pg_stripe_size,
        };
        let mut listings: HashMap<OsdNum, PeerListing> = HashMap::new();
        for &osd in &all_peers {
            if osd == 0 || !self.peer_is_up(osd) {
                continue;
            }
            let listing = if osd == self.osd_num {
                match self.exec_local(BsOp::List {
                    filter: Some(filter),
                })? {
                    BsOut::ObjectList { stable, unstable } => PeerListing { stable, unstable },
                    _ => return Err(Error::internal("unexpected list output")),
                }
            } else {
                match self
                    .peers
                    .call(
                        osd,
                        OsdRequest::SecList {
                            pg_count: filter.pg_count,
                            pg_num: filter.pg_num,
                            pg_stripe_size: filter.pg_stripe_size,
                        },
                    )
                    .await
                {
                    Ok(OsdReply::ObjectList { stable, unstable }) => {
                        PeerListing { stable, unstable }
                    }
                    Ok(_) => return Err(Error::internal("unexpected list reply")),
                    Err(e) => {
                        warn!(pg_num, osd, "listing failed during peering: {e}");
                        return Err(e);
                    }
                }
            };
            listings.insert(osd, listing);
        }

        let live_targets: Vec<OsdNum> = target_set
            .iter()
            .copied()
            .filter(|&osd| osd != 0 && self.peer_is_up(osd))
            .collect();
        let result = compute_peering(&target_set, &live_targets, &listings);

        let state = {
            let mut pgs = self.pgs.lock();
            let Some(pg) = pgs.get_mut(&pg_num) else {
                return Ok(());
            };
            pg.flush_actions = result.flush_actions;
            pg.ver_override = result.ver_override;
            pg.degraded = result.degraded;
            pg.misplaced = result.misplaced;
            pg.state = PG_ACTIVE;
            pg.missing_members =
                live_targets.len() < target_set.iter().filter(|&&o| o != 0).count();
            pg.refresh_state_bits();
            pg.state
        };
        self.report_pg_state(pg_num, state);
        info!(pg_num, state, "peering complete");

        // Kick reconciliation and recovery.
        let this = self.clone();
        tokio::spawn(async move { this.flush_pg(pg_num).await });
        self.recovery_kick.notify_one();
        Ok(())
    }

    /// Peering driver: re-peers every PG whose state asks for it.
    pub async fn peering_pass(self: &std::sync::Arc<Self>) {
        let pending: Vec<PgNum> = {
            let pgs = self.pgs.lock();
            pgs.iter()
                .filter(|(_, pg)| pg.state & (PG_PEERING | PG_REPEERING) != 0)
                .map(|(n, _)| *n)
                .collect()
        };
        for pg_num in pending {
            if let Err(e) = self.peer_pg(pg_num).await {
                warn!(pg_num, "peering failed, will retry: {e}");
            }
        }
    }
}

/// Pure reconciliation: diff per-replica listings into flush actions and
/// degraded/misplaced sets.
pub fn compute_peering(
    target_set: &[OsdNum],
    live_targets: &[OsdNum],
    listings: &HashMap<OsdNum, PeerListing>,
) -> PeeringResult {
    // Per object, per osd: (max stable, max any).
    #[derive(Default, Clone, Copy)]
    struct Have {
        stable: u64,
        any: u64,
    }
    let mut objects: BTreeMap<Oid, HashMap<OsdNum, Have>> = BTreeMap::new();
    for (&osd, listing) in listings {
        for ov in &listing.stable {
            let have = objects.entry(ov.oid).or_default().entry(osd).or_default();
            have.stable = have.stable.max(ov.version);
            have.any = have.any.max(ov.version);
        }
        for ov in &listing.unstable {
            let have = objects.entry(ov.oid).or_default().entry(osd).or_default();
            have.any = have.any.max(ov.version);
        }
    }

    let mut result = PeeringResult::default();
    for (oid, have) in &objects {
        let max_stable = have.values().map(|h| h.stable).max().unwrap_or(0);
        let max_any = have.values().map(|h| h.any).max().unwrap_or(0);

        // Quorum rule: the unstable tip survives only if every live
        // target replica has it.
        let target_version = if max_any > max_stable {
            let all_have_tip = live_targets
                .iter()
                .all(|osd| have.get(osd).is_some_and(|h| h.any >= max_any));
            if all_have_tip {
                max_any
            } else {
                max_stable
            }
        } else {
            max_stable
        };

        for &osd in live_targets {
            let h = have.get(&osd).copied().unwrap_or_default();
            let mut action = FlushAction::default();
            if h.any > target_version {
                action.rollback_to = Some(target_version);
            }
            if h.any >= target_version && h.stable < target_version && target_version > 0 {
                action.stable_to = Some(target_version);
            }
            if action.rollback_to.is_some() || action.stable_to.is_some() {
                result
                    .flush_actions
                    .insert(FlushKey { oid: *oid, osd }, action);
                result.ver_override.insert(*oid, target_version);
            }
            if h.any < target_version {
                result.degraded.insert(*oid);
            }
        }

        // Copies outside the target set are misplaced (unless the object
        // is already degraded, which recovery handles first).
        if !result.degraded.contains(oid)
            && have.keys().any(|osd| !target_set.contains(osd))
        {
            result.misplaced.insert(*oid);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ov(inode: u64, version: u64) -> ObjVer {
        ObjVer::new(Oid::new(inode, 0), version)
    }

    #[test]
    fn test_quorum_tip_is_stabilized() {
        // All three live replicas carry unstable v2: promote everywhere.
        let mut listings = HashMap::new();
        for osd in 1..=3 {
            listings.insert(
                osd,
                PeerListing {
                    stable: vec![ov(1, 1)],
                    unstable: vec![ov(1, 2)],
                },
            );
        }
        let r = compute_peering(&[1, 2, 3], &[1, 2, 3], &listings);
        assert_eq!(r.flush_actions.len(), 3);
        for (_, action) in &r.flush_actions {
            assert_eq!(action.stable_to, Some(2));
            assert_eq!(action.rollback_to, None);
        }
        assert!(r.degraded.is_empty());
    }

    #[test]
    fn test_non_quorum_tip_is_rolled_back() {
        // Only one replica took v2 before the failure: roll it back.
        let mut listings = HashMap::new();
        listings.insert(
            1,
            PeerListing {
                stable: vec![ov(1, 1)],
                unstable: vec![ov(1, 2)],
            },
        );
        for osd in 2..=3 {
            listings.insert(
                osd,
                PeerListing {
                    stable: vec![ov(1, 1)],
                    unstable: vec![],
                },
            );
        }
        let r = compute_peering(&[1, 2, 3], &[1, 2, 3], &listings);
        let action = r.flush_actions[&FlushKey {
            oid: Oid::new(1, 0),
            osd: 1,
        }];
        assert_eq!(action.rollback_to, Some(1));
        assert_eq!(action.stable_to, None);
        assert!(!r.flush_actions.contains_key(&FlushKey {
            oid: Oid::new(1, 0),
            osd: 2,
        }));
        assert!(r.degraded.is_empty());
    }

    #[test]
    fn test_missing_replica_is_degraded() {
        let mut listings = HashMap::new();
        listings.insert(
            1,
            PeerListing {
                stable: vec![ov(1, 3)],
                unstable: vec![],
            },
        );
        listings.insert(
            2,
            PeerListing {
                stable: vec![ov(1, 3)],
                unstable: vec![],
            },
        );
        listings.insert(3, PeerListing::default());
        let r = compute_peering(&[1, 2, 3], &[1, 2, 3], &listings);
        assert!(r.degraded.contains(&Oid::new(1, 0)));
    }

    #[test]
    fn test_stray_copy_is_misplaced() {
        let mut listings = HashMap::new();
        for osd in 1..=3 {
            listings.insert(
                osd,
                PeerListing {
                    stable: vec![ov(1, 1)],
                    unstable: vec![],
                },
            );
        }
        // OSD 9 is not in the target set but still holds a copy.
        listings.insert(
            9,
            PeerListing {
                stable: vec![ov(1, 1)],
                unstable: vec![],
            },
        );
        let r = compute_peering(&[1, 2, 3], &[1, 2, 3], &listings);
        assert!(r.misplaced.contains(&Oid::new(1, 0)));
        assert!(r.degraded.is_empty());
    }

    #[test]
    fn test_dead_replica_excluded_from_quorum() {
        // Replica 3 is down; the two live ones both carry the tip, so it
        // is promoted without replica 3's vote.
        let mut listings = HashMap::new();
        for osd in 1..=2 {
            listings.insert(
                osd,
                PeerListing {
                    stable: vec![ov(1, 1)],
                    unstable: vec![ov(1, 2)],
                },
            );
        }
        let r = compute_peering(&[1, 2, 3], &[1, 2], &listings);
        assert_eq!(
            r.flush_actions[&FlushKey {
                oid: Oid::new(1, 0),
                osd: 1,
            }]
            .stable_to,
            Some(2)
        );
    }
}
