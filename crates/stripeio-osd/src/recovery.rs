//! Background recovery
//!
//! Recovers degraded objects first (a target replica is missing data),
//! then misplaced ones (copies living outside the target set), at most
//! `recovery_queue_depth` at a time. A recovery is a zero-length write to
//! the object, which the primary write path turns into a full
//! re-replication to every live target; for a misplaced object the stray
//! holders are then sent a delete so their space is reclaimed. Every
//! `recovery_sync_batch` completions an autosync bounds the volume of
//! unsynced recovery writes and makes the accumulated stray deletes
//! durable.

use crate::OsdCore;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use stripeio_common::pg_states::*;
use stripeio_common::{Error, Oid, OsdNum, PgNum, Result};
use stripeio_proto::{OsdReply, OsdRequest, RwArgs};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

impl OsdCore {
    /// Pick the next object to recover: all degraded objects across PGs
    /// first, then misplaced ones (and only in PGs that are not
    /// themselves degraded, so rebalancing never makes things worse).
    fn pick_next_recovery(&self, busy: &HashSet<Oid>) -> Option<(PgNum, Oid, bool)> {
        let pgs = self.pgs.lock();
        if !self.cfg.no_recovery {
            for (pg_num, pg) in pgs.iter() {
                if pg.state & (PG_ACTIVE | PG_HAS_DEGRADED) == PG_ACTIVE | PG_HAS_DEGRADED {
                    for oid in &pg.degraded {
                        if !busy.contains(oid) {
                            return Some((*pg_num, *oid, true));
                        }
                    }
                }
            }
        }
        if !self.cfg.no_rebalance {
            for (pg_num, pg) in pgs.iter() {
                if pg.state & (PG_ACTIVE | PG_DEGRADED | PG_HAS_MISPLACED)
                    == PG_ACTIVE | PG_HAS_MISPLACED
                {
                    for oid in &pg.misplaced {
                        if !busy.contains(oid) {
                            return Some((*pg_num, *oid, false));
                        }
                    }
                }
            }
        }
        None
    }

    /// Recover one object with a zero-length write through the ordinary
    /// primary path (which expands it into a full re-replication), then
    /// reclaim any stray copies outside the target set. Returns the stray
    /// holders that took a delete and still need a sync.
    async fn recover_object(
        &self,
        pg_num: PgNum,
        oid: Oid,
        degraded: bool,
    ) -> Result<Vec<OsdNum>> {
        let args = RwArgs {
            oid,
            version: 0,
            offset: 0,
            len: 0,
        };
        let version = match self.primary_write(args, Bytes::new()).await {
            OsdReply::Ack { retval } if retval >= 0 => retval as u64,
            OsdReply::Ack { retval } => return Err(Error::from_retval(retval, 0)),
            _ => return Err(Error::internal("unexpected write reply")),
        };
        if degraded {
            return Ok(Vec::new());
        }

        // Misplaced: the target set is whole now, so the copies on the
        // old holders go away. A holder that never had this object
        // answers not-found, which is fine.
        let strays: Vec<OsdNum> = {
            let pgs = self.pgs.lock();
            let Some(pg) = pgs.get(&pg_num) else {
                return Ok(Vec::new());
            };
            pg.all_peers
                .iter()
                .copied()
                .filter(|osd| {
                    *osd != 0
                        && *osd != self.osd_num
                        && !pg.target_set.contains(osd)
                        && self.peer_is_up(*osd)
                })
                .collect()
        };
        let mut deleted = Vec::new();
        for osd in strays {
            match self
                .peers
                .call(osd, OsdRequest::Delete { oid, version })
                .await
            {
                Ok(_) => {
                    debug!(%oid, osd, "deleted stray copy");
                    deleted.push(osd);
                }
                Err(Error::ObjectNotFound(_)) => {}
                Err(e) => warn!(%oid, osd, "failed to delete stray copy: {e}"),
            }
        }
        Ok(deleted)
    }

    /// The background recovery driver.
    pub async fn recovery_loop(self: Arc<Self>) {
        let depth = self.cfg.recovery_queue_depth.max(1);
        let sync_batch = self.cfg.recovery_sync_batch.max(1);
        let mut busy: HashSet<Oid> = HashSet::new();
        let mut in_flight: JoinSet<(PgNum, Oid, bool, Result<Vec<OsdNum>>)> = JoinSet::new();
        let mut done_since_sync = 0usize;
        // Stray holders with unsynced deletes, drained on autosync.
        let mut delete_peers: HashSet<OsdNum> = HashSet::new();

        loop {
            while in_flight.len() < depth {
                let Some((pg_num, oid, degraded)) = self.pick_next_recovery(&busy) else {
                    break;
                };
                busy.insert(oid);
                debug!(%oid, pg_num, degraded, "submitting recovery operation");
                let this = self.clone();
                in_flight.spawn(async move {
                    let result = this.recover_object(pg_num, oid, degraded).await;
                    (pg_num, oid, degraded, result)
                });
            }

            if in_flight.is_empty() {
                if !delete_peers.is_empty() {
                    self.sync_delete_peers(&mut delete_peers).await;
                }
                tokio::select! {
                    _ = self.recovery_kick.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                }
                continue;
            }

            let Some(joined) = in_flight.join_next().await else {
                continue;
            };
            let Ok((pg_num, oid, degraded, result)) = joined else {
                continue;
            };
            busy.remove(&oid);

            match result {
                Ok(strays) => {
                    delete_peers.extend(strays);
                    let mut pgs = self.pgs.lock();
                    if let Some(pg) = pgs.get_mut(&pg_num) {
                        pg.degraded.remove(&oid);
                        pg.misplaced.remove(&oid);
                        pg.refresh_state_bits();
                        if pg.state & (PG_HAS_DEGRADED | PG_HAS_MISPLACED) == 0 {
                            info!(pg_num, "recovery drained");
                        }
                    }
                    done_since_sync += 1;
                }
                Err(Error::PeerUnreachable(_)) => {
                    // PG stopped or a peer went away mid-recovery; peering
                    // rebuilds the work list.
                    debug!(%oid, pg_num, degraded, "recovery interrupted by peer loss");
                }
                Err(Error::ObjectNotFound(_)) => {
                    // Deleted while queued for recovery.
                    let mut pgs = self.pgs.lock();
                    if let Some(pg) = pgs.get_mut(&pg_num) {
                        pg.degraded.remove(&oid);
                        pg.misplaced.remove(&oid);
                        pg.refresh_state_bits();
                    }
                }
                Err(e) => {
                    warn!(%oid, pg_num, "recovery failed: {e}");
                    if e.is_fatal() {
                        self.fatal("recovery", &e);
                    }
                }
            }

            // Throttle: autosync after every batch of completions, so
            // recovery cannot pile up unsynced writes or stray deletes.
            if done_since_sync >= sync_batch {
                done_since_sync = 0;
                let pg_nums: Vec<PgNum> = self.pgs.lock().keys().copied().collect();
                for pg_num in pg_nums {
                    if let Err(e) = self.sync_pg(pg_num).await {
                        warn!(pg_num, "recovery autosync failed: {e}");
                    }
                }
                self.sync_delete_peers(&mut delete_peers).await;
            }
        }
    }

    /// Make the deletes accumulated on stray holders durable; a delete
    /// becomes stable as soon as it is synced, which actually frees the
    /// holder's space.
    async fn sync_delete_peers(&self, delete_peers: &mut HashSet<OsdNum>) {
        for osd in delete_peers.drain() {
            if !self.peer_is_up(osd) {
                continue;
            }
            if let Err(e) = self.peers.call(osd, OsdRequest::SecSync).await {
                debug!(osd, "stray-holder sync failed: {e}");
            }
        }
    }
}
