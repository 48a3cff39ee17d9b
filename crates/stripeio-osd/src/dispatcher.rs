//! Operation dispatcher
//!
//! Every incoming request is framing-validated first (magic and opcode
//! are checked by the codec; alignment and length caps here); a violation
//! is answered with a negative retval and the connection is kept.
//! Secondary operations map one-to-one onto the local blockstore; client
//! operations run the primary pipeline.

use crate::OsdCore;
use bytes::Bytes;
use stripeio_blockstore::{BsOp, BsOut, ListFilter};
use stripeio_common::Result;
use stripeio_proto::{OsdReply, OsdRequest, RwArgs};
use tracing::debug;

impl OsdCore {
    /// Entry point for one decoded request.
    pub async fn handle_request(&self, request: OsdRequest) -> OsdReply {
        if let Err(e) = request.validate() {
            return OsdReply::Ack {
                retval: e.to_retval(),
            };
        }

        match request {
            // Primary (client-facing) operations.
            OsdRequest::Read(args) => self.primary_read(args).await,
            OsdRequest::Write { args, data } => self.primary_write(args, data).await,
            OsdRequest::Sync => self.primary_sync().await,
            OsdRequest::Delete { oid, version } if version == 0 => {
                self.primary_delete(oid).await
            }

            // Secondary operations: single blockstore call each.
            OsdRequest::Delete { oid, version } => {
                ack(self.exec_local(BsOp::Delete { oid, version }))
            }
            OsdRequest::SecRead(args) => reply_read(self.exec_local(BsOp::Read {
                oid: args.oid,
                offset: args.offset,
                len: args.len,
            })),
            OsdRequest::SecWrite { args, data } => ack(self.exec_secondary_write(args, data, false)),
            OsdRequest::SecWriteStable { args, data } => {
                ack(self.exec_secondary_write(args, data, true))
            }
            OsdRequest::SecSync => ack(self.exec_local(BsOp::Sync)),
            OsdRequest::SecStabilize { versions } => {
                ack(self.exec_local(BsOp::Stabilize { versions }))
            }
            OsdRequest::SecRollback { versions } => {
                ack(self.exec_local(BsOp::Rollback { versions }))
            }
            OsdRequest::SecList {
                pg_count,
                pg_num,
                pg_stripe_size,
            } => {
                let filter = (pg_count > 0).then_some(ListFilter {
                    pg_count,
                    pg_num,
                    pg_stripe_size,
                });
                match self.exec_local(BsOp::List { filter }) {
                    Ok(BsOut::ObjectList { stable, unstable }) => {
                        OsdReply::ObjectList { stable, unstable }
                    }
                    Ok(_) => OsdReply::Ack { retval: -22 },
                    Err(e) => OsdReply::Ack {
                        retval: e.to_retval(),
                    },
                }
            }
            OsdRequest::SecReadBmp { oids } => {
                let versions = {
                    let bs = self.bs.lock();
                    oids.iter()
                        .map(|oid| {
                            stripeio_common::ObjVer::new(*oid, bs.dirty_versions(*oid).last().copied().unwrap_or_else(|| {
                                bs.clean_entry(*oid).map(|c| c.version).unwrap_or(0)
                            }))
                        })
                        .collect()
                };
                OsdReply::VersionList { versions }
            }
            OsdRequest::ShowConfig => match serde_json::to_string(&self.cfg) {
                Ok(json) => OsdReply::Config { json },
                Err(_) => OsdReply::Ack { retval: -22 },
            },
        }
    }

    /// Run a blockstore op, escalating fatal device errors.
    pub(crate) fn exec_local(&self, op: BsOp) -> Result<BsOut> {
        debug!(?op, "local blockstore op");
        let result = self.bs_execute(op);
        if let Err(e) = &result {
            if e.is_fatal() {
                self.fatal("local blockstore operation", e);
            }
        }
        result
    }

    fn exec_secondary_write(&self, args: RwArgs, data: Bytes, instant: bool) -> Result<BsOut> {
        self.exec_local(BsOp::Write {
            oid: args.oid,
            version: args.version,
            offset: args.offset,
            len: args.len,
            data: data.to_vec(),
            instant,
        })
    }
}

/// Generic acknowledgement; writes answer with their assigned version.
fn ack(result: Result<BsOut>) -> OsdReply {
    match result {
        Ok(BsOut::Written { version }) => OsdReply::Ack {
            retval: version as i64,
        },
        Ok(_) => OsdReply::Ack { retval: 0 },
        Err(e) => OsdReply::Ack {
            retval: e.to_retval(),
        },
    }
}

fn reply_read(result: Result<BsOut>) -> OsdReply {
    match result {
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
