//! Parsed cluster state
//!
//! The cluster store holds four kinds of keys under the configured prefix:
//!
//! - `/config/pgs` — the desired PG layout: `{items: {"<pg_num>":
//!   {pause, primary, osd_set: [osd, osd, osd]}}}`
//! - `/pg/history/<n>` — historical replica sets for peering plus the
//!   union of OSDs that may hold data
//! - `/pg/state/<n>` — the active primary and the PG's state-name list
//! - `/osd/state/<n>` — peer liveness and addresses
//!
//! Parsing is pure (key + JSON value in, state mutation out) so the rules
//! are testable without a store. Malformed values are logged and skipped;
//! an osd_set whose length is not [`REPLICA_COUNT`] forces the PG paused.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use stripeio_common::pg_states::{self, PG_INCOMPLETE, PG_OFFLINE, PG_PEERING};
use stripeio_common::{OsdNum, PgNum};
use tracing::warn;

/// N-way replication factor of every PG.
pub const REPLICA_COUNT: usize = 3;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PgConfig {
    /// Present in the current `/config/pgs` document.
    pub exists: bool,
    pub pause: bool,
    /// Desired primary from configuration.
    pub primary: OsdNum,
    /// Desired replica set (always [`REPLICA_COUNT`] long).
    pub target_set: Vec<OsdNum>,
    /// Historical replica sets, newest last.
    pub target_history: Vec<Vec<OsdNum>>,
    /// Union of OSDs that may hold this PG's data.
    pub all_peers: Vec<OsdNum>,
    /// Primary currently reported in `/pg/state/<n>`.
    pub cur_primary: OsdNum,
    /// Reported state bits (see [`stripeio_common::pg_states`]).
    pub cur_state: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerState {
    pub addresses: Vec<String>,
    pub port: u16,
}

#[derive(Debug, Default)]
pub struct ClusterState {
    pub global: serde_json::Map<String, Value>,
    pub pg_config: BTreeMap<PgNum, PgConfig>,
    /// Peers currently reported up.
    pub peer_states: HashMap<OsdNum, PeerState>,
}

impl ClusterState {
    /// Apply one key/value from the store. `value` is `None` for deleted
    /// keys. `key` must already be stripped of the cluster prefix.
    pub fn parse_kv(&mut self, key: &str, value: Option<&Value>) {
        if key == "/config/global" {
            self.global = value
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
        } else if key == "/config/pgs" {
            self.parse_pg_config(value);
        } else if let Some(rest) = key.strip_prefix("/pg/history/") {
            match rest.parse::<PgNum>() {
                Ok(pg_num) if pg_num > 0 => self.parse_pg_history(pg_num, value),
                _ => warn!(key, "bad PG number in history key, ignoring"),
            }
        } else if let Some(rest) = key.strip_prefix("/pg/state/") {
            match rest.parse::<PgNum>() {
                Ok(pg_num) if pg_num > 0 => self.parse_pg_state(pg_num, value),
                _ => warn!(key, "bad PG number in state key, ignoring"),
            }
        } else if let Some(rest) = key.strip_prefix("/osd/state/") {
            match rest.parse::<OsdNum>() {
                Ok(osd_num) if osd_num > 0 => self.parse_osd_state(osd_num, value),
                _ => warn!(key, "bad OSD number in state key, ignoring"),
            }
        }
    }

    fn parse_pg_config(&mut self, value: Option<&Value>) {
        for pg in self.pg_config.values_mut() {
            pg.exists = false;
        }
        let Some(items) = value.and_then(|v| v.get("items")).and_then(Value::as_object) else {
            return;
        };
        for (pg_key, item) in items {
            let pg_num: PgNum = match pg_key.parse() {
                Ok(n) if n > 0 => n,
                _ => {
                    warn!(pg_key, "bad key in PG configuration (must be a number), skipped");
                    continue;
                }
            };
            let pg = self.pg_config.entry(pg_num).or_default();
            pg.exists = true;
            pg.pause = item.get("pause").and_then(Value::as_bool).unwrap_or(false);
            pg.primary = item.get("primary").and_then(Value::as_u64).unwrap_or(0);
            pg.target_set = item
                .get("osd_set")
                .and_then(Value::as_array)
                .map(|a| a.iter().map(|v| v.as_u64().unwrap_or(0)).collect())
                .unwrap_or_default();
            if pg.target_set.len() != REPLICA_COUNT {
                warn!(pg_num, "bad PG config format: incorrect osd_set, pausing");
                pg.target_set.resize(REPLICA_COUNT, 0);
                pg.pause = true;
            }
        }
    }

    fn parse_pg_history(&mut self, pg_num: PgNum, value: Option<&Value>) {
        let pg = self.pg_config.entry(pg_num).or_default();
        pg.target_history.clear();
        pg.all_peers.clear();
        let Some(value) = value else { return };
        if let Some(sets) = value.get("osd_sets").and_then(Value::as_array) {
            for set in sets {
                if let Some(set) = set.as_array() {
                    pg.target_history
                        .push(set.iter().map(|v| v.as_u64().unwrap_or(0)).collect());
                }
            }
        }
        if let Some(peers) = value.get("all_peers").and_then(Value::as_array) {
            pg.all_peers = peers.iter().filter_map(Value::as_u64).collect();
        }
    }

    fn parse_pg_state(&mut self, pg_num: PgNum, value: Option<&Value>) {
        let pg = self.pg_config.entry(pg_num).or_default();
        let Some(value) = value.filter(|v| !v.is_null()) else {
            pg.cur_primary = 0;
            pg.cur_state = 0;
            return;
        };

        let cur_primary = value.get("primary").and_then(Value::as_u64).unwrap_or(0);
        let Some(names) = value.get("state").and_then(Value::as_array) else {
            warn!(pg_num, "unexpected PG state in cluster store (no state array)");
            return;
        };
        let mut state = 0u32;
        for name in names {
            match name.as_str().and_then(pg_states::bit_by_name) {
                Some(bit) => state |= bit,
                None => {
                    warn!(pg_num, ?name, "unexpected PG state keyword in cluster store");
                    return;
                }
            }
        }
        // OFFLINE / PEERING / INCOMPLETE must be singletons.
        let exclusive_ok = [PG_OFFLINE, PG_PEERING, PG_INCOMPLETE]
            .iter()
            .all(|bit| state & bit == 0 || state == *bit);
        if cur_primary == 0 || state == 0 || !exclusive_ok {
            warn!(pg_num, cur_primary, state, "unexpected PG state in cluster store");
            return;
        }
        pg.cur_primary = cur_primary;
        pg.cur_state = state;
    }

    fn parse_osd_state(&mut self, osd_num: OsdNum, value: Option<&Value>) {
        let up = value.and_then(|v| {
            let obj = v.as_object()?;
            if obj.get("state")?.as_str()? != "up" {
                return None;
            }
            let addresses: Vec<String> = obj
                .get("addresses")?
                .as_array()?
                .iter()
                .filter_map(|a| a.as_str().map(str::to_string))
                .collect();
            let port = obj.get("port")?.as_i64()?;
            if !(1..65536).contains(&port) {
                return None;
            }
            Some(PeerState {
                addresses,
                port: port as u16,
            })
        });
        match up {
            Some(peer) => {
                self.peer_states.insert(osd_num, peer);
            }
            None => {
                self.peer_states.remove(&osd_num);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pg_config_parsing() {
        let mut st = ClusterState::default();
        st.parse_kv(
            "/config/pgs",
            Some(&json!({"items": {
                "1": {"pause": false, "primary": 1, "osd_set": [1, 2, 3]},
                "2": {"primary": 2, "osd_set": [2, 3]},
                "x": {"primary": 3, "osd_set": [1, 2, 3]}
            }})),
        );
        let pg1 = &st.pg_config[&1];
        assert!(pg1.exists && !pg1.pause);
        assert_eq!(pg1.target_set, vec![1, 2, 3]);

        // Wrong osd_set length forces pause.
        let pg2 = &st.pg_config[&2];
        assert!(pg2.pause);
        assert_eq!(pg2.target_set.len(), REPLICA_COUNT);

        // Non-numeric key skipped.
        assert_eq!(st.pg_config.len(), 2);
    }

    #[test]
    fn test_pg_config_reload_clears_exists() {
        let mut st = ClusterState::default();
        st.parse_kv(
            "/config/pgs",
            Some(&json!({"items": {"1": {"primary": 1, "osd_set": [1,2,3]}}})),
        );
        st.parse_kv(
            "/config/pgs",
            Some(&json!({"items": {"2": {"primary": 1, "osd_set": [1,2,3]}}})),
        );
        assert!(!st.pg_config[&1].exists);
        assert!(st.pg_config[&2].exists);
    }

    #[test]
    fn test_pg_history_parsing() {
        let mut st = ClusterState::default();
        st.parse_kv(
            "/pg/history/3",
            Some(&json!({"osd_sets": [[1,2,3],[4,5,6]], "all_peers": [1,2,3,4,5,6]})),
        );
        let pg = &st.pg_config[&3];
        assert_eq!(pg.target_history, vec![vec![1, 2, 3], vec![4, 5, 6]]);
        assert_eq!(pg.all_peers, vec![1, 2, 3, 4, 5, 6]);

        // Deletion clears.
        st.parse_kv("/pg/history/3", None);
        assert!(st.pg_config[&3].target_history.is_empty());
    }

    #[test]
    fn test_pg_state_exclusivity() {
        let mut st = ClusterState::default();

        st.parse_kv(
            "/pg/state/1",
            Some(&json!({"primary": 2, "state": ["active", "has_degraded"]})),
        );
        assert_eq!(st.pg_config[&1].cur_primary, 2);
        assert_ne!(st.pg_config[&1].cur_state, 0);

        // peering combined with anything else is invalid and ignored.
        st.parse_kv(
            "/pg/state/1",
            Some(&json!({"primary": 2, "state": ["peering", "active"]})),
        );
        assert_eq!(
            st.pg_config[&1].cur_state,
            pg_states::PG_ACTIVE | pg_states::PG_HAS_DEGRADED
        );

        // singleton peering is fine.
        st.parse_kv(
            "/pg/state/1",
            Some(&json!({"primary": 2, "state": ["peering"]})),
        );
        assert_eq!(st.pg_config[&1].cur_state, PG_PEERING);

        // null resets.
        st.parse_kv("/pg/state/1", Some(&Value::Null));
        assert_eq!(st.pg_config[&1].cur_state, 0);
        assert_eq!(st.pg_config[&1].cur_primary, 0);
    }

    #[test]
    fn test_pg_state_unknown_keyword_ignored() {
        let mut st = ClusterState::default();
        st.parse_kv(
            "/pg/state/1",
            Some(&json!({"primary": 2, "state": ["active", "wat"]})),
        );
        assert_eq!(st.pg_config[&1].cur_state, 0);
    }

    #[test]
    fn test_osd_state_parsing() {
        let mut st = ClusterState::default();
        st.parse_kv(
            "/osd/state/5",
            Some(&json!({"state": "up", "addresses": ["10.0.0.5"], "port": 5701})),
        );
        assert_eq!(
            st.peer_states[&5],
            PeerState {
                addresses: vec!["10.0.0.5".to_string()],
                port: 5701
            }
        );

        // Bad port -> down.
        st.parse_kv(
            "/osd/state/5",
            Some(&json!({"state": "up", "addresses": ["10.0.0.5"], "port": 0})),
        );
        assert!(!st.peer_states.contains_key(&5));

        // Not "up" -> down.
        st.parse_kv(
            "/osd/state/5",
            Some(&json!({"state": "down", "addresses": ["10.0.0.5"], "port": 5701})),
        );
        assert!(!st.peer_states.contains_key(&5));

        // Deleted key -> down.
        st.parse_kv(
            "/osd/state/5",
            Some(&json!({"state": "up", "addresses": ["10.0.0.5"], "port": 5701})),
        );
        st.parse_kv("/osd/state/5", None);
        assert!(!st.peer_states.contains_key(&5));
    }

    #[test]
    fn test_global_config() {
        let mut st = ClusterState::default();
        st.parse_kv(
            "/config/global",
            Some(&json!({"immediate_commit": "all", "recovery_queue_depth": 8})),
        );
        assert_eq!(
            st.global.get("recovery_queue_depth").and_then(Value::as_u64),
            Some(8)
        );
    }
}
