//! Peer sub-operation plumbing
//!
//! Wraps the messenger with the configured per-call timeout. A timeout or
//! transport failure closes the peer connection and surfaces as
//! `PeerUnreachable`, which the enclosing primary operation treats as a
//! broken pipe.

use std::sync::Arc;
use std::time::Duration;
use stripeio_common::{Error, OsdNum, Result};
use stripeio_proto::{Messenger, OsdReply, OsdRequest};
use tracing::warn;

pub struct PeerPool {
    messenger: Arc<dyn Messenger>,
    op_timeout: Duration,
}

impl PeerPool {
    pub fn new(messenger: Arc<dyn Messenger>, op_timeout: Duration) -> Self {
        Self {
            messenger,
            op_timeout,
        }
    }

    /// Issue one sub-operation to a peer. Peer-reported negative retvals
    /// are mapped back into errors; timeouts drop the connection.
    pub async fn call(&self, peer: OsdNum, request: OsdRequest) -> Result<OsdReply> {
        let fut = self.messenger.call(peer, request);
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(reply)) => {
                let retval = reply.retval();
                if retval < 0 {
                    return Err(Error::from_retval(retval, peer));
                }
                Ok(reply)
            }
            Ok(Err(e)) => {
                warn!(peer, "peer call failed: {e}");
                self.messenger.drop_peer(peer).await;
                Err(Error::PeerUnreachable(peer))
            }
            Err(_) => {
                warn!(peer, "peer call timed out");
                self.messenger.drop_peer(peer).await;
                Err(Error::PeerUnreachable(peer))
            }
        }
    }

    pub async fn drop_peer(&self, peer: OsdNum) {
        self.messenger.drop_peer(peer).await;
    }
}
