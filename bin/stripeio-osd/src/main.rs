//! stripeio OSD - Object Storage Daemon
//!
//! One process, one blockstore: opens the configured devices, joins the
//! cluster through the configuration store, serves the wire protocol and
//! runs the background peering/flush/recovery machinery.

use anyhow::Result;
use axum::{
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use clap::Parser;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use stripeio_blockstore::Blockstore;
use stripeio_cluster::{ClusterEvent, ClusterState, EtcdStateClient};
use stripeio_common::pg_states::state_names;
use stripeio_common::OsdConfig;
use stripeio_osd::net::TcpMessenger;
use stripeio_osd::OsdCore;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "stripeio-osd")]
#[command(about = "stripeio Object Storage Daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/stripeio/osd.toml")]
    config: String,

    /// OSD number (overrides the config file)
    #[arg(long)]
    osd_num: Option<u64>,

    /// Listen address
    #[arg(short, long)]
    bind: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Cluster store endpoints
    #[arg(long)]
    etcd: Vec<String>,

    /// Initialise the blockstore devices and exit
    #[arg(long)]
    init_devices: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Metrics server port (Prometheus)
    #[arg(long, default_value = "9301")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut cfg: OsdConfig = if std::path::Path::new(&args.config).exists() {
        let text = std::fs::read_to_string(&args.config)?;
        toml::from_str(&text).map_err(|e| anyhow::anyhow!("bad config file: {e}"))?
    } else {
        OsdConfig::default()
    };

    // CLI overrides.
    if let Some(n) = args.osd_num {
        cfg.osd_num = n;
    }
    if let Some(bind) = args.bind {
        cfg.bind_address = bind;
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if !args.etcd.is_empty() {
        cfg.etcd_endpoints = args.etcd;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.init_devices {
        info!("initialising blockstore devices");
        Blockstore::format(&cfg.blockstore)?;
        info!("devices initialised");
        return Ok(());
    }

    if cfg.osd_num == 0 {
        error!("osd_num is not set (config file or --osd-num)");
        std::process::exit(1);
    }

    info!("starting stripeio OSD {}", cfg.osd_num);
    let bs = Blockstore::open(&cfg.blockstore)?;

    let messenger = Arc::new(TcpMessenger::new());
    let (core, mut state_reports) = OsdCore::new(cfg.clone(), bs, messenger.clone());

    // Cluster store: global config first (the OSD is not ready without
    // it), then the transactional PG load, then live watches.
    let (client, mut events) =
        EtcdStateClient::connect(&cfg.etcd_endpoints, cfg.etcd_prefix.clone()).await?;
    let client = Arc::new(client);
    client.load_global_config().await?;
    while !client.load_pgs(Vec::new()).await? {
        warn!("PG load raced with a concurrent change, retrying");
    }
    client.start_watchers();
    apply_cluster_state(&core, &messenger, &client.state.lock().unwrap());
    core.peering_pass().await;

    client
        .publish_osd_state(
            cfg.osd_num,
            vec![cfg.bind_address.clone()],
            cfg.port,
        )
        .await?;

    // PG state reports flow back into the store.
    {
        let client = client.clone();
        tokio::spawn(async move {
            while let Some((pg_num, primary, state)) = state_reports.recv().await {
                if let Err(e) = client.report_pg_state(pg_num, primary, state).await {
                    warn!(pg_num, "failed to report PG state: {e}");
                }
            }
        });
    }

    // Cluster events drive reconfiguration and peering.
    {
        let core = core.clone();
        let client = client.clone();
        let messenger = messenger.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ClusterEvent::ConfigLoaded | ClusterEvent::PgsLoaded { success: true } => {}
                    ClusterEvent::PgsLoaded { success: false } => {
                        while !client.load_pgs(Vec::new()).await.unwrap_or(false) {
                            tokio::time::sleep(stripeio_cluster::SLOW_TIMEOUT).await;
                        }
                    }
                    ClusterEvent::KeysChanged(keys) => {
                        tracing::debug!(?keys, "cluster state changed");
                    }
                }
                apply_cluster_state(&core, &messenger, &client.state.lock().unwrap());
                core.peering_pass().await;
            }
        });
    }

    tokio::spawn(core.clone().autosync_loop());
    tokio::spawn(core.clone().recovery_loop());

    // Metrics endpoint.
    {
        let core = core.clone();
        let port = args.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(core, port).await {
                error!("metrics server error: {e}");
            }
        });
    }

    let listen = format!("{}:{}", cfg.bind_address, cfg.port);
    let listener = TcpListener::bind(&listen).await?;
    info!("listening on {listen}");

    tokio::select! {
        _ = stripeio_osd::net::serve(core, listener) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
    Ok(())
}

/// Push the parsed cluster state into the core: peer addresses and
/// liveness, PG count and per-PG configuration. Idempotent; called on
/// startup and after every watch batch.
fn apply_cluster_state(core: &Arc<OsdCore>, messenger: &Arc<TcpMessenger>, state: &ClusterState) {
    for osd in core.up_peer_list() {
        if !state.peer_states.contains_key(&osd) {
            messenger.forget_peer_address(osd);
            core.apply_peer_state(osd, false);
        }
    }
    for (&osd, peer) in &state.peer_states {
        if let Some(addr) = peer.addresses.first() {
            messenger.set_peer_address(osd, format!("{addr}:{}", peer.port));
        }
        core.apply_peer_state(osd, true);
    }
    let pg_count = state.pg_config.values().filter(|pg| pg.exists).count() as u32;
    if pg_count > 0 {
        core.set_pg_count(pg_count);
    }
    for (&pg_num, pg) in &state.pg_config {
        if !pg.exists {
            continue;
        }
        core.apply_pg_config(
            pg_num,
            pg.primary,
            pg.target_set.clone(),
            pg.target_history.clone(),
            pg.all_peers.clone(),
            pg.pause,
        );
    }
}

async fn serve_metrics(core: Arc<OsdCore>, port: u16) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(core);

    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    info!("metrics available at http://{addr}/metrics");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn metrics_handler(
    axum::extract::State(core): axum::extract::State<Arc<OsdCore>>,
) -> impl IntoResponse {
    let status = core.status();
    let osd = status.osd_num;
    let mut out = String::with_capacity(4 * 1024);

    writeln!(out, "# HELP stripeio_osd_up OSD liveness").unwrap();
    writeln!(out, "# TYPE stripeio_osd_up gauge").unwrap();
    writeln!(out, "stripeio_osd_up{{osd=\"{osd}\"}} 1").unwrap();

    writeln!(out, "# HELP stripeio_blockstore_free_blocks Free data blocks").unwrap();
    writeln!(out, "# TYPE stripeio_blockstore_free_blocks gauge").unwrap();
    writeln!(
        out,
        "stripeio_blockstore_free_blocks{{osd=\"{osd}\"}} {}",
        status.free_blocks
    )
    .unwrap();

    writeln!(out, "# HELP stripeio_journal_free_bytes Free journal space").unwrap();
    writeln!(out, "# TYPE stripeio_journal_free_bytes gauge").unwrap();
    writeln!(
        out,
        "stripeio_journal_free_bytes{{osd=\"{osd}\"}} {}",
        status.journal_free_bytes
    )
    .unwrap();

    writeln!(out, "# HELP stripeio_dirty_entries Unstabilised object versions").unwrap();
    writeln!(out, "# TYPE stripeio_dirty_entries gauge").unwrap();
    writeln!(
        out,
        "stripeio_dirty_entries{{osd=\"{osd}\"}} {}",
        status.dirty_entries
    )
    .unwrap();

    writeln!(out, "# HELP stripeio_device_syncs_total Device fsync count").unwrap();
    writeln!(out, "# TYPE stripeio_device_syncs_total counter").unwrap();
    writeln!(
        out,
        "stripeio_device_syncs_total{{osd=\"{osd}\",device=\"data\"}} {}",
        status.data_syncs
    )
    .unwrap();
    writeln!(
        out,
        "stripeio_device_syncs_total{{osd=\"{osd}\",device=\"journal\"}} {}",
        status.journal_syncs
    )
    .unwrap();

    writeln!(out, "# HELP stripeio_pg_info Placement group state").unwrap();
    writeln!(out, "# TYPE stripeio_pg_info gauge").unwrap();
    for pg in &status.pgs {
        writeln!(
            out,
            "stripeio_pg_info{{osd=\"{osd}\",pg=\"{}\",state=\"{}\"}} 1",
            pg.pg_num,
            state_names(pg.state).join("+"),
        )
        .unwrap();
        writeln!(
            out,
            "stripeio_pg_degraded_objects{{osd=\"{osd}\",pg=\"{}\"}} {}",
            pg.pg_num, pg.degraded
        )
        .unwrap();
        writeln!(
            out,
            "stripeio_pg_misplaced_objects{{osd=\"{osd}\",pg=\"{}\"}} {}",
            pg.pg_num, pg.misplaced
        )
        .unwrap();
    }

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        out,
    )
}

async fn health_handler(
    axum::extract::State(core): axum::extract::State<Arc<OsdCore>>,
) -> impl IntoResponse {
    // Healthy when every PG this OSD leads is active.
    let status = core.status();
    let healthy = status
        .pgs
        .iter()
        .all(|pg| pg.state & stripeio_common::pg_states::PG_ACTIVE != 0);
    if healthy {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "DEGRADED")
    }
}
