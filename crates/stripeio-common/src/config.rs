//! Configuration types for stripeio
//!
//! Blockstore geometry is fixed at initialisation time: changing the block
//! size, journal size or metadata area size requires re-initialising the
//! devices.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Durability class of the underlying devices.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImmediateCommit {
    /// Devices need explicit fsync; syncs do real work.
    #[default]
    None,
    /// All devices guarantee synchronous durability; sync is a no-op.
    All,
}

/// Blockstore device and geometry configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockstoreConfig {
    /// Data device path.
    pub data_device: PathBuf,
    /// Journal device path. May equal the data device with a disjoint
    /// offset range.
    pub journal_device: PathBuf,
    /// Metadata device path. May equal either of the above.
    pub meta_device: PathBuf,

    /// Byte offset of the data area on its device.
    #[serde(default)]
    pub data_offset: u64,
    /// Byte offset of the journal on its device.
    #[serde(default)]
    pub journal_offset: u64,
    /// Byte offset of the metadata area on its device.
    #[serde(default)]
    pub meta_offset: u64,

    /// Object block size in bytes. Writes of exactly one aligned block take
    /// the big-write path.
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    /// Journal size in bytes, including the START sector.
    #[serde(default = "default_journal_size")]
    pub journal_size: u64,
    /// Number of data blocks. 0 means "derive from the device size".
    #[serde(default)]
    pub block_count: u64,

    #[serde(default)]
    pub immediate_commit: ImmediateCommit,
    /// Skip journal fsync (journal device has a capacitor / is a raw NVMe
    /// namespace with volatile cache disabled).
    #[serde(default)]
    pub disable_journal_fsync: bool,
    /// Skip data fsync, same rationale.
    #[serde(default)]
    pub disable_data_fsync: bool,
}

fn default_block_size() -> u32 {
    128 * 1024
}

fn default_journal_size() -> u64 {
    16 * 1024 * 1024
}

impl Default for BlockstoreConfig {
    fn default() -> Self {
        Self {
            data_device: PathBuf::from("/var/lib/stripeio/data"),
            journal_device: PathBuf::from("/var/lib/stripeio/journal"),
            meta_device: PathBuf::from("/var/lib/stripeio/meta"),
            data_offset: 0,
            journal_offset: 0,
            meta_offset: 0,
            block_size: default_block_size(),
            journal_size: default_journal_size(),
            block_count: 0,
            immediate_commit: ImmediateCommit::None,
            disable_journal_fsync: false,
            disable_data_fsync: false,
        }
    }
}

/// OSD daemon configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OsdConfig {
    /// This OSD's number in the cluster (1-based, assigned by the admin).
    pub osd_num: u64,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,

    /// Cluster store endpoints.
    #[serde(default = "default_etcd_endpoints")]
    pub etcd_endpoints: Vec<String>,
    /// Key prefix in the cluster store.
    #[serde(default = "default_etcd_prefix")]
    pub etcd_prefix: String,

    /// Timeout for sub-operations sent to peer OSDs, in milliseconds.
    #[serde(default = "default_peer_op_timeout_ms")]
    pub peer_op_timeout_ms: u64,
    /// Interval between automatic syncs of accumulated unstable writes,
    /// in milliseconds. 0 disables autosync.
    #[serde(default = "default_autosync_interval_ms")]
    pub autosync_interval_ms: u64,

    /// Maximum concurrent background recovery operations.
    #[serde(default = "default_recovery_queue_depth")]
    pub recovery_queue_depth: usize,
    /// Force an autosync after this many recovery completions.
    #[serde(default = "default_recovery_sync_batch")]
    pub recovery_sync_batch: usize,
    /// Pause all recovery.
    #[serde(default)]
    pub no_recovery: bool,
    /// Pause rebalancing of misplaced objects.
    #[serde(default)]
    pub no_rebalance: bool,

    /// Stripe size used to map (inode, offset) to PGs.
    #[serde(default = "default_pg_stripe_size")]
    pub pg_stripe_size: u64,

    #[serde(default)]
    pub blockstore: BlockstoreConfig,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5701
}

fn default_etcd_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}

fn default_etcd_prefix() -> String {
    "/stripeio".to_string()
}

fn default_peer_op_timeout_ms() -> u64 {
    5000
}

fn default_autosync_interval_ms() -> u64 {
    5000
}

fn default_recovery_queue_depth() -> usize {
    4
}

fn default_recovery_sync_batch() -> usize {
    16
}

fn default_pg_stripe_size() -> u64 {
    128 * 1024
}

impl Default for OsdConfig {
    fn default() -> Self {
        Self {
            osd_num: 0,
            bind_address: default_bind_address(),
            port: default_port(),
            etcd_endpoints: default_etcd_endpoints(),
            etcd_prefix: default_etcd_prefix(),
            peer_op_timeout_ms: default_peer_op_timeout_ms(),
            autosync_interval_ms: default_autosync_interval_ms(),
            recovery_queue_depth: default_recovery_queue_depth(),
            recovery_sync_batch: default_recovery_sync_batch(),
            no_recovery: false,
            no_rebalance: false,
            pg_stripe_size: default_pg_stripe_size(),
            blockstore: BlockstoreConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blockstore_defaults() {
        let cfg = BlockstoreConfig::default();
        assert_eq!(cfg.block_size, 128 * 1024);
        assert_eq!(cfg.journal_size, 16 * 1024 * 1024);
        assert_eq!(cfg.immediate_commit, ImmediateCommit::None);
    }

    #[test]
    fn test_osd_config_from_json() {
        let cfg: OsdConfig = serde_json::from_str(
            r#"{"osd_num": 3, "port": 5799, "blockstore": {
                "data_device": "/dev/sdb", "journal_device": "/dev/sdb",
                "meta_device": "/dev/sdb", "journal_offset": 4096,
                "meta_offset": 16781312 }}"#,
        )
        .unwrap();
        assert_eq!(cfg.osd_num, 3);
        assert_eq!(cfg.port, 5799);
        assert_eq!(cfg.blockstore.journal_offset, 4096);
        assert_eq!(cfg.etcd_prefix, "/stripeio");
    }
}
