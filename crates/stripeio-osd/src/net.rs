//! TCP messenger
//!
//! A deliberately thin transport behind the [`Messenger`] contract: one
//! connection per peer, requests framed as header + payload, replies
//! correlated by id. The server side decodes one request at a time per
//! connection and keeps the connection open across client errors
//! (invalid requests answer with a negative retval).

use crate::OsdCore;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use stripeio_common::{Error, OsdNum, Result};
use stripeio_proto::{
    Messenger, OsdReply, OsdRequest, REPLY_HEADER_SIZE, REQUEST_HEADER_SIZE,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct PeerConn {
    stream: TcpStream,
    next_id: u64,
}

/// Client half: outgoing connections to peer OSDs.
pub struct TcpMessenger {
    addresses: parking_lot::RwLock<HashMap<OsdNum, String>>,
    conns: Mutex<HashMap<OsdNum, Arc<Mutex<PeerConn>>>>,
}

impl TcpMessenger {
    pub fn new() -> Self {
        Self {
            addresses: parking_lot::RwLock::new(HashMap::new()),
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Learn (or update) a peer's address from the cluster store.
    pub fn set_peer_address(&self, osd: OsdNum, address: String) {
        self.addresses.write().insert(osd, address);
    }

    pub fn forget_peer_address(&self, osd: OsdNum) {
        self.addresses.write().remove(&osd);
    }

    async fn connection(&self, peer: OsdNum) -> Result<Arc<Mutex<PeerConn>>> {
        {
            let conns = self.conns.lock().await;
            if let Some(conn) = conns.get(&peer) {
                return Ok(conn.clone());
            }
        }
        let address = self
            .addresses
            .read()
            .get(&peer)
            .cloned()
            .ok_or(Error::PeerUnreachable(peer))?;

        let stream = TcpStream::connect(&address)
            .await
            .map_err(|_| Error::PeerUnreachable(peer))?;
        stream.set_nodelay(true).ok();
        info!(peer, address, "connected to peer OSD");

        let conn = Arc::new(Mutex::new(PeerConn { stream, next_id: 1 }));
        self.conns.lock().await.insert(peer, conn.clone());
        Ok(conn)
    }
}

impl Default for TcpMessenger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Messenger for TcpMessenger {
    async fn call(&self, peer: OsdNum, request: OsdRequest) -> Result<OsdReply> {
        let conn = self.connection(peer).await?;
        let mut conn = conn.lock().await;

        let id = conn.next_id;
        conn.next_id += 1;
        let (header, payload) = request.encode(id);

        let io = async {
            conn.stream.write_all(&header).await?;
            if !payload.is_empty() {
                conn.stream.write_all(&payload).await?;
            }

            let mut reply_header = [0u8; REPLY_HEADER_SIZE];
            conn.stream.read_exact(&mut reply_header).await?;
            let (_, _, _, payload_len, _) = OsdReply::decode_header(&reply_header)
                .map_err(|_| std::io::Error::other("bad reply header"))?;
            let mut reply_payload = vec![0u8; payload_len];
            if payload_len > 0 {
                conn.stream.read_exact(&mut reply_payload).await?;
            }
            Ok::<_, std::io::Error>((reply_header, reply_payload))
        };

        let (reply_header, reply_payload) = match io.await {
            Ok(v) => v,
            Err(e) => {
                warn!(peer, "peer I/O failed: {e}");
                drop(conn);
                self.drop_peer(peer).await;
                return Err(Error::PeerUnreachable(peer));
            }
        };

        let (reply_id, reply) = OsdReply::decode(&reply_header, Bytes::from(reply_payload))?;
        if reply_id != id {
            // The connection is out of step; drop it.
            drop(conn);
            self.drop_peer(peer).await;
            return Err(Error::PeerUnreachable(peer));
        }
        Ok(reply)
    }

    async fn drop_peer(&self, peer: OsdNum) {
        if self.conns.lock().await.remove(&peer).is_some() {
            info!(peer, "dropped peer connection");
        }
    }
}

/// Server half: accept loop feeding the dispatcher.
pub async fn serve(core: Arc<OsdCore>, listener: TcpListener) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        stream.set_nodelay(true).ok();
        debug!(%addr, "client connected");
        let core = core.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(core, stream).await {
                debug!(%addr, "client disconnected: {e}");
            }
        });
    }
}

async fn serve_connection(core: Arc<OsdCore>, mut stream: TcpStream) -> std::io::Result<()> {
    loop {
        let mut header = [0u8; REQUEST_HEADER_SIZE];
        stream.read_exact(&mut header).await?;

        let (id, opcode, request) = match OsdRequest::decode_header(&header) {
            Ok((id, opcode, payload_len)) => {
                let mut payload = vec![0u8; payload_len];
                if payload_len > 0 {
                    stream.read_exact(&mut payload).await?;
                }
                match OsdRequest::decode(&header, Bytes::from(payload)) {
                    Ok((id, req)) => (id, opcode, Ok(req)),
                    Err(e) => (id, opcode, Err(e)),
                }
            }
            Err(_) => {
                // Without a parseable header the payload length is
                // unknown; the stream cannot be resynchronised.
                return Err(std::io::Error::other("unparseable request header"));
            }
        };

        let reply = match request {
            Ok(req) => core.handle_request(req).await,
            Err(e) => OsdReply::Ack {
                retval: e.to_retval(),
            },
        };

        let (reply_header, reply_payload) = reply.encode(id, opcode);
        stream.write_all(&reply_header).await?;
        if !reply_payload.is_empty() {
            stream.write_all(&reply_payload).await?;
        }
    }
}
