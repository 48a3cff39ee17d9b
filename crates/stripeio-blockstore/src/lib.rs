//! stripeio Blockstore - the single-node persistence engine
//!
//! One blockstore backs one OSD. It mediates between a data device, a
//! journal device and a metadata device (possibly one file with disjoint
//! offset ranges) and gives writes a three-state lifecycle: in-flight
//! writes become *synced* once a sync batch makes them durable, and
//! *stable* once the cluster stabilises them into the clean index.
//! Atomic crash recovery replays the journal up to the first break in its
//! CRC chain.

pub mod allocator;
pub mod engine;
pub mod journal;
pub mod layout;
pub mod meta;
pub mod op;
pub mod raw_io;

mod init;
mod read;
mod stable;
mod sync;

pub use engine::{Blockstore, CleanEntry, DirtyEntry};
pub use layout::{JOURNAL_SECTOR_SIZE, JOURNAL_STABILIZE_RESERVATION};
pub use op::{BsCompletion, BsOp, BsOut, ListFilter, OpId};
