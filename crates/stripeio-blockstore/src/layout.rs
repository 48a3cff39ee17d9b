//! On-disk layout definitions
//!
//! Journal layout:
//! ```text
//! +------------------+  sector 0
//! |   START entry    |  identifies the journal, stores the replay start
//! +------------------+  sector 1 .. n (ring)
//! | entry sectors    |  packed CRC-chained entries, 512B sectors
//! | payload spans    |  small-write payloads, 512B-aligned
//! +------------------+
//! ```
//!
//! Entries never span sectors; when the next entry would not fit, the
//! sector is padded with zeroes (a zero kind acts as the terminator) and a
//! new sector begins. Every entry carries a rolling CRC chained from the
//! previous entry's CRC.
//!
//! Metadata area layout: one header sector followed by packed 32-byte
//! clean-entry records indexed by data block number.

use bytes::{Buf, BufMut};
use stripeio_common::checksum::crc32c_chained;
use stripeio_common::{Error, Oid, Result};

/// Journal sector size. Entries are packed into sectors of this size and a
/// sector is the unit of journal write-out.
pub const JOURNAL_SECTOR_SIZE: u64 = 512;

/// Journal entry magic ("SJRL").
pub const JOURNAL_MAGIC: u32 = 0x534a_524c;

/// Metadata area magic ("SMET").
pub const META_MAGIC: u32 = 0x534d_4554;

/// On-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Metadata area sector size: records are read-modify-written in units of
/// this size.
pub const META_SECTOR_SIZE: u64 = 4096;

/// Size of one packed clean-entry record.
pub const META_RECORD_SIZE: u64 = 32;

/// Bytes always kept free in the journal so stabilize entries can be
/// written even when the journal is otherwise full. Stabilize reclaims
/// more space than it consumes, so this guarantees forward progress.
pub const JOURNAL_STABILIZE_RESERVATION: u64 = 4 * JOURNAL_SECTOR_SIZE;

/// Common entry header: magic, kind, total entry size, rolling CRC pair.
pub const ENTRY_HEADER_SIZE: usize = 16;

/// Kind values. The INSTANT bit is orthogonal: an instant entry becomes
/// stable as soon as it is synced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum EntryKind {
    Start = 1,
    SmallWrite = 2,
    BigWrite = 3,
    Stable = 4,
    Rollback = 5,
    Delete = 6,
}

pub const ENTRY_INSTANT_BIT: u16 = 0x100;

impl EntryKind {
    fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::Start),
            2 => Some(Self::SmallWrite),
            3 => Some(Self::BigWrite),
            4 => Some(Self::Stable),
            5 => Some(Self::Rollback),
            6 => Some(Self::Delete),
            _ => None,
        }
    }
}

/// A decoded journal entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JournalEntry {
    /// Identifies the journal and stores the position of the first valid
    /// entry after crash recovery, plus the CRC the first entry's chain
    /// must continue from (stale entries from earlier ring laps cannot
    /// chain from it, so replay can never resurrect reclaimed state).
    Start {
        journal_start: u64,
        version: u32,
        crc_begin: u32,
    },
    /// Sub-block write; payload lives in the ring at `data_offset`.
    SmallWrite {
        oid: Oid,
        version: u64,
        offset: u32,
        len: u32,
        data_offset: u64,
        instant: bool,
    },
    /// Metadata reference for an aligned full-block write whose payload
    /// went straight to the data device.
    BigWrite {
        oid: Oid,
        version: u64,
        location: u64,
        instant: bool,
    },
    Stable { oid: Oid, version: u64 },
    Rollback { oid: Oid, version: u64 },
    Delete { oid: Oid, version: u64, instant: bool },
}

impl JournalEntry {
    /// Total encoded size including the header.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        ENTRY_HEADER_SIZE
            + match self {
                Self::Start { .. } => 16,
                Self::SmallWrite { .. } => 40,
                Self::BigWrite { .. } => 40,
                Self::Stable { .. } | Self::Rollback { .. } | Self::Delete { .. } => 24,
            }
    }

    fn kind_bits(&self) -> u16 {
        let (kind, instant) = match self {
            Self::Start { .. } => (EntryKind::Start, false),
            Self::SmallWrite { instant, .. } => (EntryKind::SmallWrite, *instant),
            Self::BigWrite { instant, .. } => (EntryKind::BigWrite, *instant),
            Self::Stable { .. } => (EntryKind::Stable, false),
            Self::Rollback { .. } => (EntryKind::Rollback, false),
            Self::Delete { instant, .. } => (EntryKind::Delete, *instant),
        };
        kind as u16 | if instant { ENTRY_INSTANT_BIT } else { 0 }
    }

    /// Encode into `out`, chaining the CRC from `crc_prev`. Returns the
    /// entry's own CRC (the next entry chains from it).
    pub fn encode(&self, out: &mut [u8], crc_prev: u32) -> u32 {
        let size = self.encoded_size();
        debug_assert!(out.len() >= size);
        let buf = &mut out[..size];
        buf.fill(0);

        {
            let mut w = &mut buf[..];
            w.put_u32_le(JOURNAL_MAGIC);
            w.put_u16_le(self.kind_bits());
            w.put_u16_le(size as u16);
            w.put_u32_le(0); // crc32, patched below
            w.put_u32_le(crc_prev);
            match self {
                Self::Start {
                    journal_start,
                    version,
                    crc_begin,
                } => {
                    w.put_u64_le(*journal_start);
                    w.put_u32_le(*version);
                    w.put_u32_le(*crc_begin);
                }
                Self::SmallWrite {
                    oid,
                    version,
                    offset,
                    len,
                    data_offset,
                    ..
                } => {
                    w.put_u64_le(oid.inode);
                    w.put_u64_le(oid.stripe);
                    w.put_u64_le(*version);
                    w.put_u32_le(*offset);
                    w.put_u32_le(*len);
                    w.put_u64_le(*data_offset);
                }
                Self::BigWrite {
                    oid,
                    version,
                    location,
                    ..
                } => {
                    w.put_u64_le(oid.inode);
                    w.put_u64_le(oid.stripe);
                    w.put_u64_le(*version);
                    w.put_u64_le(*location);
                    w.put_u64_le(0);
                }
                Self::Stable { oid, version }
                | Self::Rollback { oid, version }
                | Self::Delete { oid, version, .. } => {
                    w.put_u64_le(oid.inode);
                    w.put_u64_le(oid.stripe);
                    w.put_u64_le(*version);
                }
            }
        }

        let crc = crc32c_chained(crc_prev, buf);
        buf[8..12].copy_from_slice(&crc.to_le_bytes());
        crc
    }

    /// Decode one entry from the start of `data`.
    ///
    /// Returns `Ok(None)` for a terminator (zero kind / zero magic), an
    /// error for anything that does not validate, and the entry with its
    /// CRC pair otherwise. The caller is responsible for checking that
    /// `crc_prev` chains.
    pub fn decode(data: &[u8]) -> Result<Option<DecodedEntry>> {
        if data.len() < ENTRY_HEADER_SIZE {
            return Ok(None);
        }
        let mut r = data;
        let magic = r.get_u32_le();
        if magic == 0 {
            return Ok(None); // terminator / unwritten space
        }
        if magic != JOURNAL_MAGIC {
            return Err(Error::corruption("bad journal entry magic"));
        }
        let kind_bits = r.get_u16_le();
        let size = r.get_u16_le() as usize;
        let crc32 = r.get_u32_le();
        let crc32_prev = r.get_u32_le();

        let instant = kind_bits & ENTRY_INSTANT_BIT != 0;
        let kind = EntryKind::from_u16(kind_bits & !ENTRY_INSTANT_BIT)
            .ok_or_else(|| Error::corruption(format!("unknown journal entry kind {kind_bits}")))?;

        if size < ENTRY_HEADER_SIZE || size > data.len() {
            return Err(Error::corruption("journal entry size out of range"));
        }

        // The CRC is computed with its own field zeroed.
        let mut bytes = data[..size].to_vec();
        bytes[8..12].fill(0);
        if crc32c_chained(crc32_prev, &bytes) != crc32 {
            return Err(Error::corruption("journal entry CRC mismatch"));
        }

        let entry = match kind {
            EntryKind::Start => JournalEntry::Start {
                journal_start: r.get_u64_le(),
                version: r.get_u32_le(),
                crc_begin: r.get_u32_le(),
            },
            EntryKind::SmallWrite => {
                let oid = Oid::new(r.get_u64_le(), r.get_u64_le());
                JournalEntry::SmallWrite {
                    oid,
                    version: r.get_u64_le(),
                    offset: r.get_u32_le(),
                    len: r.get_u32_le(),
                    data_offset: r.get_u64_le(),
                    instant,
                }
            }
            EntryKind::BigWrite => {
                let oid = Oid::new(r.get_u64_le(), r.get_u64_le());
                JournalEntry::BigWrite {
                    oid,
                    version: r.get_u64_le(),
                    location: r.get_u64_le(),
                    instant,
                }
            }
            EntryKind::Stable => {
                let oid = Oid::new(r.get_u64_le(), r.get_u64_le());
                JournalEntry::Stable {
                    oid,
                    version: r.get_u64_le(),
                }
            }
            EntryKind::Rollback => {
                let oid = Oid::new(r.get_u64_le(), r.get_u64_le());
                JournalEntry::Rollback {
                    oid,
                    version: r.get_u64_le(),
                }
            }
            EntryKind::Delete => {
                let oid = Oid::new(r.get_u64_le(), r.get_u64_le());
                JournalEntry::Delete {
                    oid,
                    version: r.get_u64_le(),
                    instant,
                }
            }
        };

        Ok(Some(DecodedEntry {
            entry,
            size,
            crc32,
            crc32_prev,
        }))
    }
}

/// A decoded entry plus its framing, as needed by replay.
#[derive(Clone, Debug)]
pub struct DecodedEntry {
    pub entry: JournalEntry,
    pub size: usize,
    pub crc32: u32,
    pub crc32_prev: u32,
}

/// Metadata area header, stored in the first metadata sector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaHeader {
    pub magic: u32,
    pub version: u32,
    pub block_size: u32,
    pub block_count: u64,
}

impl MetaHeader {
    pub const ENCODED_SIZE: usize = 24;

    #[must_use]
    pub fn new(block_size: u32, block_count: u64) -> Self {
        Self {
            magic: META_MAGIC,
            version: FORMAT_VERSION,
            block_size,
            block_count,
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        let mut w = &mut out[..Self::ENCODED_SIZE];
        w.put_u32_le(self.magic);
        w.put_u32_le(self.version);
        w.put_u32_le(self.block_size);
        w.put_u32_le(0);
        w.put_u64_le(self.block_count);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::ENCODED_SIZE {
            return Err(Error::corruption("metadata header too small"));
        }
        let mut r = data;
        let magic = r.get_u32_le();
        if magic != META_MAGIC {
            return Err(Error::corruption("bad metadata area magic"));
        }
        let version = r.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(Error::corruption(format!(
                "unsupported metadata format version {version}"
            )));
        }
        let block_size = r.get_u32_le();
        let _pad = r.get_u32_le();
        let block_count = r.get_u64_le();
        Ok(Self {
            magic,
            version,
            block_size,
            block_count,
        })
    }
}

/// One packed clean-entry record, indexed by the data block number it
/// occupies. `version == 0` means the slot is free.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaRecord {
    pub oid: Oid,
    pub version: u64,
}

impl MetaRecord {
    pub fn encode(rec: Option<&MetaRecord>, out: &mut [u8]) {
        let buf = &mut out[..META_RECORD_SIZE as usize];
        buf.fill(0);
        if let Some(rec) = rec {
            let mut w = &mut buf[..];
            w.put_u64_le(rec.oid.inode);
            w.put_u64_le(rec.oid.stripe);
            w.put_u64_le(rec.version);
        }
    }

    /// Decode a record slot; `None` if the slot is free.
    #[must_use]
    pub fn decode(data: &[u8]) -> Option<MetaRecord> {
        let mut r = data;
        let inode = r.get_u64_le();
        let stripe = r.get_u64_le();
        let version = r.get_u64_le();
        if version == 0 {
            return None;
        }
        Some(MetaRecord {
            oid: Oid::new(inode, stripe),
            version,
        })
    }
}

/// Round up to the journal sector size.
#[must_use]
pub const fn sector_align_up(v: u64) -> u64 {
    (v + JOURNAL_SECTOR_SIZE - 1) / JOURNAL_SECTOR_SIZE * JOURNAL_SECTOR_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_roundtrip() {
        let entry = JournalEntry::SmallWrite {
            oid: Oid::new(0x10, 0x20000),
            version: 7,
            offset: 512,
            len: 1024,
            data_offset: 4096,
            instant: true,
        };
        let mut buf = [0u8; 64];
        let crc = entry.encode(&mut buf, 0x1234);
        let dec = JournalEntry::decode(&buf).unwrap().unwrap();
        assert_eq!(dec.entry, entry);
        assert_eq!(dec.crc32, crc);
        assert_eq!(dec.crc32_prev, 0x1234);
    }

    #[test]
    fn test_entry_crc_chain_detects_tamper() {
        let entry = JournalEntry::Stable {
            oid: Oid::new(1, 0),
            version: 3,
        };
        let mut buf = [0u8; 64];
        entry.encode(&mut buf, 0);
        buf[20] ^= 0xff; // flip a body bit
        assert!(JournalEntry::decode(&buf).is_err());
    }

    #[test]
    fn test_terminator_is_none() {
        let buf = [0u8; 64];
        assert!(JournalEntry::decode(&buf).unwrap().is_none());
    }

    #[test]
    fn test_instant_bit() {
        let entry = JournalEntry::Delete {
            oid: Oid::new(2, 0),
            version: 9,
            instant: true,
        };
        let mut buf = [0u8; 64];
        entry.encode(&mut buf, 0);
        let dec = JournalEntry::decode(&buf).unwrap().unwrap();
        assert!(matches!(
            dec.entry,
            JournalEntry::Delete { instant: true, .. }
        ));
    }

    #[test]
    fn test_meta_header_roundtrip() {
        let hdr = MetaHeader::new(128 * 1024, 4096);
        let mut buf = [0u8; 64];
        hdr.encode(&mut buf);
        let dec = MetaHeader::decode(&buf).unwrap();
        assert_eq!(dec, hdr);
    }

    #[test]
    fn test_meta_record_free_slot() {
        let mut buf = [0u8; 32];
        MetaRecord::encode(None, &mut buf);
        assert_eq!(MetaRecord::decode(&buf), None);

        let rec = MetaRecord {
            oid: Oid::new(5, 0),
            version: 2,
        };
        MetaRecord::encode(Some(&rec), &mut buf);
        assert_eq!(MetaRecord::decode(&buf), Some(rec));
    }
}
