//! Messenger contract
//!
//! Framed request/reply delivery between OSDs. The transport behind it
//! (TCP, loopback for tests) is interchangeable; the OSD core only relies
//! on this interface. Delivery failures and timeouts surface as
//! `PeerUnreachable`, which the primary treats like a broken pipe: the
//! enclosing operation fails and the PG re-peers.

use crate::{OsdReply, OsdRequest};
use async_trait::async_trait;
use stripeio_common::{OsdNum, Result};

#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send a request to a peer OSD and await its reply. Implementations
    /// apply the configured per-call timeout; expiry closes the peer
    /// connection and returns `PeerUnreachable`.
    async fn call(&self, peer: OsdNum, request: OsdRequest) -> Result<OsdReply>;

    /// Drop the connection to a peer (failure handling: outstanding calls
    /// fail, the next call reconnects).
    async fn drop_peer(&self, peer: OsdNum);
}
