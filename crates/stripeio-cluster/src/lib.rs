//! stripeio Cluster - the cluster configuration store client
//!
//! Watches PG assignment, PG history/state and peer liveness under a
//! configurable key prefix, and publishes this OSD's own state. The OSD
//! core reacts to [`client::ClusterEvent`] notifications.

pub mod client;
pub mod state;

pub use client::{ClusterEvent, EtcdStateClient, SLOW_TIMEOUT};
pub use state::{ClusterState, PeerState, PgConfig, REPLICA_COUNT};
