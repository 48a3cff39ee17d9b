//! Cluster store client
//!
//! Startup sequence: load `/config/global` (the OSD is not ready until
//! this succeeds; failures retry on a slow timer), then one transactional
//! range-read of the PG configuration, history, state and peer-state
//! prefixes together with caller-supplied compare predicates. If the
//! transaction fails its compares (a concurrent change happened), the
//! caller is notified and retries.
//!
//! Live updates arrive through long-lived watches on the four prefixes.
//! Events are coalesced into a key→value map per batch (last write per
//! key wins) before being fed to the parser. A watch that never
//! established reconnects on the slow timer; a live watch that drops
//! reconnects immediately.

use crate::state::ClusterState;
use etcd_client::{
    Client, Compare, GetOptions, PutOptions, Txn, TxnOp, TxnOpResponse, WatchOptions,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stripeio_common::pg_states::state_names;
use stripeio_common::{Error, OsdNum, PgNum, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Retry/reconnect delay when the store is unreachable.
pub const SLOW_TIMEOUT: Duration = Duration::from_secs(5);

/// Lease TTL for this OSD's `/osd/state/<n>` record.
const STATE_LEASE_TTL: i64 = 10;

const WATCH_PREFIXES: [&str; 4] = ["/config/", "/osd/state/", "/pg/state/", "/pg/history/"];

/// Notifications to the OSD core.
#[derive(Debug)]
pub enum ClusterEvent {
    /// `/config/global` loaded (or reloaded through a watch).
    ConfigLoaded,
    /// The transactional PG load finished. `false` means a compare
    /// predicate failed and the caller should re-issue the load.
    PgsLoaded { success: bool },
    /// A watch batch changed these keys (prefix already stripped).
    KeysChanged(Vec<String>),
}

pub struct EtcdStateClient {
    client: Client,
    prefix: String,
    pub state: Arc<Mutex<ClusterState>>,
    events: mpsc::Sender<ClusterEvent>,
    watch_revision: Arc<AtomicI64>,
}

impl EtcdStateClient {
    pub async fn connect(
        endpoints: &[String],
        prefix: String,
    ) -> Result<(Self, mpsc::Receiver<ClusterEvent>)> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| Error::ClusterStore(format!("connect: {e}")))?;
        let (tx, rx) = mpsc::channel(256);
        Ok((
            Self {
                client,
                prefix,
                state: Arc::new(Mutex::new(ClusterState::default())),
                events: tx,
                watch_revision: Arc::new(AtomicI64::new(0)),
            },
            rx,
        ))
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Load `/config/global`, blocking readiness. Retries internally on
    /// store errors with the slow timeout.
    pub async fn load_global_config(&self) -> Result<()> {
        loop {
            let mut client = self.client.clone();
            match client.get(self.full_key("/config/global"), None).await {
                Ok(resp) => {
                    if let Some(h) = resp.header() {
                        self.watch_revision.store(h.revision(), Ordering::SeqCst);
                    }
                    let value = resp
                        .kvs()
                        .first()
                        .and_then(|kv| serde_json::from_slice::<Value>(kv.value()).ok());
                    self.state
                        .lock()
                        .unwrap()
                        .parse_kv("/config/global", value.as_ref());
                    let _ = self.events.send(ClusterEvent::ConfigLoaded).await;
                    return Ok(());
                }
                Err(e) => {
                    warn!("error reading OSD configuration from the cluster store: {e}");
                    tokio::time::sleep(SLOW_TIMEOUT).await;
                }
            }
        }
    }

    /// One transactional range-read of `/config/pgs` plus the history,
    /// state and peer prefixes, guarded by the caller's compare
    /// predicates. Returns whether the compares held; on `false` nothing
    /// is parsed and the caller retries.
    pub async fn load_pgs(&self, checks: Vec<Compare>) -> Result<bool> {
        let reads = [
            TxnOp::get(self.full_key("/config/pgs"), None),
            TxnOp::get(
                self.full_key("/pg/history/"),
                Some(GetOptions::new().with_prefix()),
            ),
            TxnOp::get(
                self.full_key("/pg/state/"),
                Some(GetOptions::new().with_prefix()),
            ),
            TxnOp::get(
                self.full_key("/osd/state/"),
                Some(GetOptions::new().with_prefix()),
            ),
        ];
        let txn = Txn::new().when(checks).and_then(reads);

        let mut client = self.client.clone();
        let resp = client
            .txn(txn)
            .await
            .map_err(|e| Error::ClusterStore(format!("loading PGs: {e}")))?;
        if !resp.succeeded() {
            let _ = self
                .events
                .send(ClusterEvent::PgsLoaded { success: false })
                .await;
            return Ok(false);
        }

        {
            let mut state = self.state.lock().unwrap();
            for op in resp.op_responses() {
                let TxnOpResponse::Get(get) = op else { continue };
                for kv in get.kvs() {
                    let Ok(key) = kv.key_str() else { continue };
                    let Some(key) = key.strip_prefix(&self.prefix) else {
                        continue;
                    };
                    let value = serde_json::from_slice::<Value>(kv.value()).ok();
                    state.parse_kv(key, value.as_ref());
                }
            }
        }
        let _ = self
            .events
            .send(ClusterEvent::PgsLoaded { success: true })
            .await;
        Ok(true)
    }

    /// Start the four prefix watches from the loaded revision. Runs until
    /// the process exits.
    pub fn start_watchers(&self) {
        for watch_prefix in WATCH_PREFIXES {
            let client = self.client.clone();
            let prefix = self.prefix.clone();
            let state = self.state.clone();
            let events = self.events.clone();
            let revision = self.watch_revision.clone();
            tokio::spawn(async move {
                watch_loop(client, prefix, watch_prefix, state, events, revision).await;
            });
        }
    }

    /// Publish this OSD as up, backed by a kept-alive lease so the record
    /// disappears when the process dies.
    pub async fn publish_osd_state(
        &self,
        osd_num: OsdNum,
        addresses: Vec<String>,
        port: u16,
    ) -> Result<()> {
        let mut client = self.client.clone();
        let lease = client
            .lease_grant(STATE_LEASE_TTL, None)
            .await
            .map_err(|e| Error::ClusterStore(format!("lease grant: {e}")))?;
        let lease_id = lease.id();

        let value = serde_json::json!({
            "state": "up",
            "addresses": addresses,
            "port": port,
        });
        client
            .put(
                self.full_key(&format!("/osd/state/{osd_num}")),
                value.to_string(),
                Some(PutOptions::new().with_lease(lease_id)),
            )
            .await
            .map_err(|e| Error::ClusterStore(format!("publishing OSD state: {e}")))?;

        let (mut keeper, _responses) = client
            .lease_keep_alive(lease_id)
            .await
            .map_err(|e| Error::ClusterStore(format!("lease keepalive: {e}")))?;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(STATE_LEASE_TTL as u64 / 3));
            loop {
                tick.tick().await;
                if let Err(e) = keeper.keep_alive().await {
                    warn!("lease keepalive failed: {e}");
                    tokio::time::sleep(SLOW_TIMEOUT).await;
                }
            }
        });
        info!(osd_num, "published OSD state");
        Ok(())
    }

    /// Report a PG's state under `/pg/state/<n>`.
    pub async fn report_pg_state(
        &self,
        pg_num: PgNum,
        primary: OsdNum,
        state_bits: u32,
    ) -> Result<()> {
        let value = serde_json::json!({
            "primary": primary,
            "state": state_names(state_bits),
        });
        let mut client = self.client.clone();
        client
            .put(
                self.full_key(&format!("/pg/state/{pg_num}")),
                value.to_string(),
                None,
            )
            .await
            .map_err(|e| Error::ClusterStore(format!("reporting PG state: {e}")))?;
        Ok(())
    }
}

async fn watch_loop(
    mut client: Client,
    prefix: String,
    watch_prefix: &'static str,
    state: Arc<Mutex<ClusterState>>,
    events: mpsc::Sender<ClusterEvent>,
    revision: Arc<AtomicI64>,
) {
    loop {
        let start_revision = revision.load(Ordering::SeqCst) + 1;
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(start_revision);
        let full = format!("{prefix}{watch_prefix}");

        let (_watcher, mut stream) = match client.watch(full.clone(), Some(options)).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(watch_prefix, "failed to establish watch: {e}");
                tokio::time::sleep(SLOW_TIMEOUT).await;
                continue;
            }
        };

        let mut established = false;
        loop {
            match stream.message().await {
                Ok(Some(resp)) => {
                    if resp.canceled() {
                        break;
                    }
                    established = true;
                    if let Some(h) = resp.header() {
                        revision.store(h.revision(), Ordering::SeqCst);
                    }

                    // Coalesce the batch: last write per key wins.
                    let mut changes: BTreeMap<String, Option<Value>> = BTreeMap::new();
                    for event in resp.events() {
                        let Some(kv) = event.kv() else { continue };
                        let Ok(key) = kv.key_str() else { continue };
                        let Some(key) = key.strip_prefix(&prefix) else {
                            continue;
                        };
                        let value = match event.event_type() {
                            etcd_client::EventType::Put => {
                                match serde_json::from_slice::<Value>(kv.value()) {
                                    Ok(v) => Some(v),
                                    Err(e) => {
                                        warn!(key, "bad JSON in cluster store event: {e}");
                                        continue;
                                    }
                                }
                            }
                            etcd_client::EventType::Delete => None,
                        };
                        changes.insert(key.to_string(), value);
                    }
                    if changes.is_empty() {
                        continue;
                    }

                    let keys: Vec<String> = changes.keys().cloned().collect();
                    {
                        let mut st = state.lock().unwrap();
                        for (key, value) in &changes {
                            st.parse_kv(key, value.as_ref());
                        }
                    }
                    if events.send(ClusterEvent::KeysChanged(keys)).await.is_err() {
                        return; // receiver gone, OSD is shutting down
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(watch_prefix, "watch stream error: {e}");
                    break;
                }
            }
        }

        if established {
            // A live watch dropped: reconnect immediately.
            info!(watch_prefix, "watch lost, reconnecting");
        } else {
            // Never established: slow retry.
            tokio::time::sleep(SLOW_TIMEOUT).await;
        }
    }
}
