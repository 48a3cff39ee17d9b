//! stripeio Common - Shared types and utilities
//!
//! This crate provides the identifiers, state words, error definitions and
//! configuration types used across all stripeio components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod pg_states;
pub mod types;

pub use config::{BlockstoreConfig, ImmediateCommit, OsdConfig};
pub use error::{Error, Result};
pub use types::*;
