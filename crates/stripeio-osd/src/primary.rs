//! Primary operation pipelines
//!
//! The primary picks the version, submits secondary writes to every
//! replica in the PG set (itself included), and acknowledges the client
//! once all replicas ack. A zero-length write re-replicates the object:
//! the primary expands it into a full-object write of the content it
//! already holds. A client sync fans secondary syncs out, then
//! broadcasts a stabilize with every (object, version) pair collected
//! since the last one. A peer failing mid-pipeline gets the acked
//! replicas rolled back, the client an EPIPE, and the PG a re-peer.

use crate::OsdCore;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use stripeio_blockstore::{BsOp, BsOut};
use stripeio_common::{Error, ObjVer, Oid, OsdNum, PgNum, Result};
use stripeio_proto::{OsdReply, OsdRequest, RwArgs};
use tracing::{debug, warn};

impl OsdCore {
    pub(crate) async fn primary_read(&self, args: RwArgs) -> OsdReply {
        // The primary of the PG holds a full replica; reads are local.
        match self.exec_local(BsOp::Read {
            oid: args.oid,
            offset: args.offset,
            len: args.len,
        }) {
            Ok(BsOut::Data(data)) => OsdReply::Data {
                retval: data.len() as i64,
                data: Bytes::from(data),
            },
            Ok(_) => OsdReply::Ack { retval: -22 },
            Err(e) => OsdReply::Ack {
                retval: e.to_retval(),
            },
        }
    }

    pub(crate) async fn primary_write(&self, args: RwArgs, data: Bytes) -> OsdReply {
        match self.replicated_update(args.oid, Some((args.offset, args.len, data))).await {
            Ok(version) => OsdReply::Ack {
                retval: version as i64,
            },
            Err(e) => OsdReply::Ack {
                retval: e.to_retval(),
            },
        }
    }

    pub(crate) async fn primary_delete(&self, oid: Oid) -> OsdReply {
        match self.replicated_update(oid, None).await {
            Ok(version) => OsdReply::Ack {
                retval: version as i64,
            },
            Err(e) => OsdReply::Ack {
                retval: e.to_retval(),
            },
        }
    }

    /// Common write/delete pipeline: version assignment, fan-out,
    /// rollback of acked replicas on partial failure.
    async fn replicated_update(
        &self,
        oid: Oid,
        write: Option<(u32, u32, Bytes)>,
    ) -> Result<u64> {
        let pg_num = self.pg_of(oid);

        // Wait until reconciliation of this object (if any) finishes.
        loop {
            let parked = {
                let mut pgs = self.pgs.lock();
                let pg = pgs.get_mut(&pg_num).ok_or(Error::PeerUnreachable(0))?;
                if !pg.is_active() {
                    return Err(Error::PeerUnreachable(pg.target_set.first().copied().unwrap_or(0)));
                }
                if pg.has_pending_flush(oid) {
                    Some(pg.park_write(oid))
                } else {
                    pg.inflight += 1;
                    None
                }
            };
            match parked {
                Some(rx) => {
                    debug!(%oid, pg_num, "write waiting for flush");
                    let _ = rx.await;
                }
                None => break,
            }
        }

        let is_delete = write.is_none();
        let result = self.do_replicated_update(pg_num, oid, write).await;

        let mut pgs = self.pgs.lock();
        if let Some(pg) = pgs.get_mut(&pg_num) {
            pg.inflight -= 1;
            match &result {
                // Deletes stabilise on their own at sync time, so only
                // writes join the stabilize broadcast list.
                Ok(version) if !is_delete => {
                    pg.unstable_writes.push(ObjVer::new(oid, *version));
                }
                Ok(_) => {}
                Err(e) => {
                    if matches!(e, Error::PeerUnreachable(_)) && pg.is_active() {
                        pg.state = stripeio_common::pg_states::PG_PEERING;
                    }
                }
            }
        }
        result
    }

    async fn do_replicated_update(
        &self,
        pg_num: PgNum,
        oid: Oid,
        write: Option<(u32, u32, Bytes)>,
    ) -> Result<u64> {
        // A zero-length write is the natural re-replication operation:
        // the primary resolves it into a full-object write of the content
        // it already holds, which lands on every live replica below.
        let write = match write {
            Some((_, 0, _)) => Some(self.resolve_rereplicate(pg_num, oid).await?),
            other => other,
        };

        let target_set: Vec<OsdNum> = {
            let pgs = self.pgs.lock();
            pgs.get(&pg_num)
                .map(|pg| pg.target_set.clone())
                .unwrap_or_default()
        };
        let version = {
            let bs = self.bs.lock();
            bs.max_version(oid) + 1
        };

        let mut acked: Vec<OsdNum> = Vec::new();
        let mut missing: Vec<OsdNum> = Vec::new();
        let mut failure: Option<Error> = None;

        for &osd in &target_set {
            if osd == 0 {
                continue;
            }
            if !self.peer_is_up(osd) {
                // Degraded write: the replica is recovered later.
                missing.push(osd);
                continue;
            }
            let result = if osd == self.osd_num {
                self.exec_local(match &write {
                    Some((offset, len, data)) => BsOp::Write {
                        oid,
                        version,
                        offset: *offset,
                        len: *len,
                        data: data.to_vec(),
                        instant: false,
                    },
                    None => BsOp::Delete { oid, version },
                })
                .map(|_| ())
            } else {
                let request = match &write {
                    Some((offset, len, data)) => OsdRequest::SecWrite {
                        args: RwArgs {
                            oid,
                            version,
                            offset: *offset,
                            len: *len,
                        },
                        data: data.clone(),
                    },
                    None => OsdRequest::Delete { oid, version },
                };
                self.peers.call(osd, request).await.map(|_| ())
            };
            match result {
                Ok(()) => acked.push(osd),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            // Abort: discard the version on every replica that took it.
            warn!(%oid, version, "write aborted, rolling back acked replicas: {e}");
            let rollback = vec![ObjVer::new(oid, version - 1)];
            for &osd in &acked {
                let result = if osd == self.osd_num {
                    self.exec_local(BsOp::Rollback {
                        versions: rollback.clone(),
                    })
                    .map(|_| ())
                } else {
                    self.peers
                        .call(
                            osd,
                            OsdRequest::SecRollback {
                                versions: rollback.clone(),
                            },
                        )
                        .await
                        .map(|_| ())
                };
                if let Err(e) = result {
                    warn!(osd, "rollback after aborted write failed: {e}");
                }
            }
            return Err(e);
        }

        if !missing.is_empty() {
            let mut pgs = self.pgs.lock();
            if let Some(pg) = pgs.get_mut(&pg_num) {
                pg.degraded.insert(oid);
                pg.refresh_state_bits();
            }
            self.recovery_kick.notify_one();
        }

        Ok(version)
    }

    /// Turn a zero-length write into the full-object content to
    /// replicate: the local replica's current state, or any live
    /// holder's when the primary's own copy is the missing one.
    async fn resolve_rereplicate(&self, pg_num: PgNum, oid: Oid) -> Result<(u32, u32, Bytes)> {
        let block_size = self.bs.lock().block_size();
        let data = match self.exec_local(BsOp::Read {
            oid,
            offset: 0,
            len: block_size,
        }) {
            Ok(BsOut::Data(data)) => Bytes::from(data),
            Ok(_) => return Err(Error::internal("unexpected read output")),
            Err(Error::ObjectNotFound(_)) => {
                self.read_from_any_holder(pg_num, oid, block_size).await?
            }
            Err(e) => return Err(e),
        };
        Ok((0, block_size, data))
    }

    async fn read_from_any_holder(
        &self,
        pg_num: PgNum,
        oid: Oid,
        block_size: u32,
    ) -> Result<Bytes> {
        let holders = {
            let pgs = self.pgs.lock();
            let pg = pgs
                .get(&pg_num)
                .ok_or_else(|| Error::internal("re-replication for unknown PG"))?;
            pg.all_peers.clone()
        };
        for osd in holders {
            if osd == 0 || osd == self.osd_num || !self.peer_is_up(osd) {
                continue;
            }
            let reply = self
                .peers
                .call(
                    osd,
                    OsdRequest::SecRead(RwArgs {
                        oid,
                        version: 0,
                        offset: 0,
                        len: block_size,
                    }),
                )
                .await;
            if let Ok(OsdReply::Data { retval, data }) = reply {
                if retval >= 0 {
                    return Ok(data);
                }
            }
        }
        Err(Error::ObjectNotFound(oid))
    }

    /// Client sync: make every replicated write of every PG durable and
    /// stable across the cluster.
    pub(crate) async fn primary_sync(&self) -> OsdReply {
        let pg_nums: Vec<PgNum> = self.pgs.lock().keys().copied().collect();
        for pg_num in pg_nums {
            if let Err(e) = self.sync_pg(pg_num).await {
                self.repeer_pg(pg_num);
                return OsdReply::Ack {
                    retval: e.to_retval(),
                };
            }
        }
        OsdReply::Ack { retval: 0 }
    }

    /// Sync one PG: secondary-sync every replica, then broadcast a
    /// stabilize for everything collected since the last one.
    pub async fn sync_pg(&self, pg_num: PgNum) -> Result<()> {
        let (target_set, unstable) = {
            let mut pgs = self.pgs.lock();
            let Some(pg) = pgs.get_mut(&pg_num) else {
                return Ok(());
            };
            if !pg.is_active() && pg.state != stripeio_common::pg_states::PG_PEERING {
                return Ok(());
            }
            (pg.target_set.clone(), std::mem::take(&mut pg.unstable_writes))
        };

        let live: Vec<OsdNum> = target_set
            .iter()
            .copied()
            .filter(|&osd| osd != 0 && self.peer_is_up(osd))
            .collect();

        let restore = |this: &Self, unstable: &[ObjVer]| {
            let mut pgs = this.pgs.lock();
            if let Some(pg) = pgs.get_mut(&pg_num) {
                pg.unstable_writes.extend_from_slice(unstable);
            }
        };

        // Step 1: every replica syncs.
        for &osd in &live {
            let result = if osd == self.osd_num {
                self.exec_local(BsOp::Sync).map(|_| ())
            } else {
                self.peers.call(osd, OsdRequest::SecSync).await.map(|_| ())
            };
            if let Err(e) = result {
                restore(self, &unstable);
                return Err(e);
            }
        }

        // Step 2: broadcast the stabilize list.
        if unstable.is_empty() {
            return Ok(());
        }
        for &osd in &live {
            let result = if osd == self.osd_num {
                self.exec_local(BsOp::Stabilize {
                    versions: unstable.clone(),
                })
                .map(|_| ())
            } else {
                self.peers
                    .call(
                        osd,
                        OsdRequest::SecStabilize {
                            versions: unstable.clone(),
                        },
                    )
                    .await
                    .map(|_| ())
            };
            if let Err(e) = result {
                restore(self, &unstable);
                return Err(e);
            }
        }
        debug!(pg_num, count = unstable.len(), "PG synced and stabilized");
        Ok(())
    }

    /// Periodic autosync: bounds the volume of unsynced writes without a
    /// client-issued sync.
    pub async fn autosync_loop(self: Arc<Self>) {
        let interval = self.cfg.autosync_interval_ms;
        if interval == 0 {
            return;
        }
        let mut ticker = tokio::time::interval(Duration::from_millis(interval));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let pg_nums: Vec<PgNum> = self.pgs.lock().keys().copied().collect();
            for pg_num in pg_nums {
                if let Err(e) = self.sync_pg(pg_num).await {
                    warn!(pg_num, "autosync failed: {e}");
                    self.repeer_pg(pg_num);
                }
            }
        }
    }
}
