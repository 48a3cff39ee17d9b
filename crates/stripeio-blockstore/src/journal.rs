//! Ring journal
//!
//! The journal is a logically circular sequence of 512-byte sectors on a
//! fast device. Entries are packed into the current in-memory sector,
//! which stays dirty until it fills up, a sync flushes it, or an operation
//! needs a fresh sector; small-write payloads are placed into the ring as
//! aligned spans recorded in their entry's `data_offset`.
//!
//! Space accounting is a pair of ring positions: `used_start` (oldest live
//! byte, persisted in the START sector together with the CRC chain seed)
//! and `next_free`. A sector is never reused while its usage count is
//! non-zero; usage counts are held by live dirty entries, one per entry,
//! on the sector that carries their newest journal entry. `reserve`
//! refuses appends that would leave less than the stabilize reservation
//! free, which keeps stabilize (the operation that reclaims space) always
//! able to run.

use crate::layout::{
    sector_align_up, JournalEntry, ENTRY_HEADER_SIZE, FORMAT_VERSION, JOURNAL_SECTOR_SIZE,
};
use crate::raw_io::{AlignedBuffer, Device};
use std::collections::BTreeMap;
use stripeio_common::{Error, Oid, Result};
use tracing::debug;

const SECTOR: u64 = JOURNAL_SECTOR_SIZE;

/// Position of an entry inside the journal: its sector offset and the byte
/// offset within that sector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JePos {
    pub sector: u64,
    pub offset: usize,
}

struct CurSector {
    pos: u64,
    buf: AlignedBuffer,
    filled: usize,
    dirty: bool,
}

pub struct Journal {
    dev: Device,
    size: u64,
    /// Ring position of the oldest live byte (replay start).
    used_start: u64,
    /// Ring position of the next free byte. Always sector-aligned.
    next_free: u64,
    crc32_last: u32,
    cur: Option<CurSector>,
    /// sector offset -> number of live dirty entries referencing it.
    used_sectors: BTreeMap<u64, u64>,
    /// sector offset -> CRC chain value preceding the sector's first
    /// entry. Bounded by the ring sector count; overwritten per lap.
    sector_seeds: BTreeMap<u64, u32>,
    /// (start, seed) recorded in the on-disk START sector.
    start_on_disk: (u64, u32),
    /// Chain seed at `used_start`, from the START sector.
    crc_begin: u32,
}

impl Journal {
    /// Initialise a fresh journal: zero the ring and write the START
    /// sector. Destroys any previous content.
    pub fn format(dev: Device) -> Result<Self> {
        let size = dev.len();
        if size < 16 * SECTOR {
            return Err(Error::Configuration(format!(
                "journal of {size} bytes is too small"
            )));
        }

        let chunk = AlignedBuffer::new(64 * 1024, dev.alignment());
        let mut pos = 0u64;
        while pos < size {
            let n = (size - pos).min(chunk.len() as u64) as usize;
            dev.write_at(pos, &chunk.as_slice()[..n])?;
            pos += n as u64;
        }

        let mut journal = Self {
            dev,
            size,
            used_start: SECTOR,
            next_free: SECTOR,
            crc32_last: 0,
            cur: None,
            used_sectors: BTreeMap::new(),
            sector_seeds: BTreeMap::new(),
            start_on_disk: (0, 0),
            crc_begin: 0,
        };
        journal.write_start_sector(SECTOR, 0)?;
        journal.dev.sync()?;
        Ok(journal)
    }

    /// Open an existing journal. The caller must run [`Journal::replay`]
    /// before appending.
    pub fn open(dev: Device) -> Result<Self> {
        let size = dev.len();
        let mut buf = AlignedBuffer::new(SECTOR as usize, dev.alignment());
        dev.read_at(0, buf.as_mut_slice())?;
        let dec = JournalEntry::decode(buf.as_slice())?
            .ok_or_else(|| Error::corruption("journal START sector is empty"))?;
        let JournalEntry::Start {
            journal_start,
            version,
            crc_begin,
        } = dec.entry
        else {
            return Err(Error::corruption("journal sector 0 is not a START entry"));
        };
        if version != FORMAT_VERSION {
            return Err(Error::corruption(format!(
                "unsupported journal format version {version}"
            )));
        }
        if journal_start < SECTOR || journal_start >= size || journal_start % SECTOR != 0 {
            return Err(Error::corruption(format!(
                "journal start position {journal_start} out of range"
            )));
        }

        Ok(Self {
            dev,
            size,
            used_start: journal_start,
            next_free: journal_start,
            crc32_last: crc_begin,
            cur: None,
            used_sectors: BTreeMap::new(),
            sector_seeds: BTreeMap::new(),
            start_on_disk: (journal_start, crc_begin),
            crc_begin,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn used_start(&self) -> u64 {
        self.used_start
    }

    /// Whether the current sector holds entries not yet written out.
    pub fn cur_sector_dirty(&self) -> bool {
        self.cur.as_ref().is_some_and(|c| c.dirty)
    }

    /// Free bytes in the ring, as seen with a hypothetical `next_free`.
    fn free_bytes_at(&self, next_free: u64) -> u64 {
        if next_free >= self.used_start {
            (self.size - next_free) + (self.used_start - SECTOR)
        } else {
            self.used_start - next_free
        }
    }

    pub fn free_bytes(&self) -> u64 {
        self.free_bytes_at(self.next_free)
    }

    /// Where an allocation of `bytes` would land given `next_free`, or
    /// `None` if it cannot fit while leaving `reserve` bytes plus one
    /// spare sector free. Allocation wraps to the first ring sector when
    /// the tail cannot hold it contiguously.
    fn alloc_pos(&self, next_free: u64, bytes: u64, reserve: u64) -> Option<u64> {
        let pos = if next_free + bytes <= self.size {
            if self.used_start > next_free && next_free + bytes > self.used_start {
                return None;
            }
            next_free
        } else {
            if self.used_start > next_free {
                return None; // already in the low segment, cannot wrap twice
            }
            if SECTOR + bytes > self.used_start {
                return None;
            }
            SECTOR
        };
        if self.free_bytes_at(pos + bytes) < reserve + SECTOR {
            return None;
        }
        Some(pos)
    }

    /// Check that `entry_count` entries of `entry_size` bytes each, with
    /// `payload_size` bytes of payload per entry, can be appended while
    /// leaving `reserved_tail` bytes of journal free.
    ///
    /// This mirrors the append paths exactly, so a successful reserve
    /// guarantees the appends cannot fail for lack of space.
    pub fn reserve(
        &self,
        entry_count: usize,
        entry_size: usize,
        payload_size: u64,
        reserved_tail: u64,
    ) -> bool {
        let mut next_free = self.next_free;
        let mut room = self
            .cur
            .as_ref()
            .map(|c| SECTOR as usize - c.filled)
            .unwrap_or(0);

        for _ in 0..entry_count {
            let ppad = sector_align_up(payload_size);
            if payload_size > 0 {
                // Entry sector and payload stay contiguous in ring order.
                if room >= entry_size {
                    if let Some(pos) = self.alloc_pos(next_free, ppad, reserved_tail) {
                        if pos == next_free {
                            next_free += ppad;
                            room -= entry_size;
                            continue;
                        }
                    }
                }
                match self.alloc_pos(next_free, SECTOR + ppad, reserved_tail) {
                    Some(pos) => {
                        next_free = pos + SECTOR + ppad;
                        room = SECTOR as usize - entry_size;
                    }
                    None => return false,
                }
            } else if room >= entry_size {
                room -= entry_size;
            } else {
                match self.alloc_pos(next_free, SECTOR, reserved_tail) {
                    Some(pos) => {
                        next_free = pos + SECTOR;
                        room = SECTOR as usize - entry_size;
                    }
                    None => return false,
                }
            }
        }
        true
    }

    /// Open a fresh current sector at the given ring position.
    fn open_sector(&mut self, pos: u64) {
        self.cur = Some(CurSector {
            pos,
            buf: AlignedBuffer::new(SECTOR as usize, self.dev.alignment()),
            filled: 0,
            dirty: false,
        });
    }

    /// Make sure the current sector can hold `size` more bytes, closing it
    /// (the zero tail acts as the terminator) and allocating a new one if
    /// not.
    fn ensure_entry_space(&mut self, size: usize) -> Result<()> {
        let fits = self
            .cur
            .as_ref()
            .is_some_and(|c| c.filled + size <= SECTOR as usize);
        if fits {
            return Ok(());
        }
        self.flush_cur_sector()?;
        let pos = self
            .alloc_pos(self.next_free, SECTOR, 0)
            .ok_or(Error::JournalFull)?;
        self.next_free = pos + SECTOR;
        self.open_sector(pos);
        Ok(())
    }

    fn put_entry(&mut self, entry: &JournalEntry) -> JePos {
        let seed = self.crc32_last;
        let cur = self.cur.as_mut().expect("no current journal sector");
        let size = entry.encoded_size();
        debug_assert!(cur.filled + size <= SECTOR as usize);
        if cur.filled == 0 {
            self.sector_seeds.insert(cur.pos, seed);
        }
        let crc = entry.encode(&mut cur.buf.as_mut_slice()[cur.filled..], seed);
        let pos = JePos {
            sector: cur.pos,
            offset: cur.filled,
        };
        cur.filled += size;
        cur.dirty = true;
        self.crc32_last = crc;
        pos
    }

    /// Append an entry without payload. The caller must have reserved
    /// space; `Err(JournalFull)` here means the reservation was skipped.
    pub fn append(&mut self, entry: &JournalEntry) -> Result<JePos> {
        self.ensure_entry_space(entry.encoded_size())?;
        Ok(self.put_entry(entry))
    }

    /// Append a small-write entry together with its payload span. The
    /// payload is written to the device immediately; it becomes durable
    /// with the next journal fsync.
    pub fn append_small_write(
        &mut self,
        oid: Oid,
        version: u64,
        offset: u32,
        len: u32,
        instant: bool,
        payload: &[u8],
    ) -> Result<(JePos, u64)> {
        debug_assert_eq!(payload.len() as u32, len);
        let entry_size = ENTRY_HEADER_SIZE + 40;
        let ppad = sector_align_up(u64::from(len));

        let fits = self
            .cur
            .as_ref()
            .is_some_and(|c| c.filled + entry_size <= SECTOR as usize);
        let data_offset = if fits && self.alloc_pos(self.next_free, ppad, 0) == Some(self.next_free)
        {
            let pos = self.next_free;
            self.next_free += ppad;
            pos
        } else {
            // Move to a fresh sector so the payload stays behind its entry
            // in ring order (replay walks the ring forward).
            self.flush_cur_sector()?;
            let pos = self
                .alloc_pos(self.next_free, SECTOR + ppad, 0)
                .ok_or(Error::JournalFull)?;
            self.next_free = pos + SECTOR + ppad;
            self.open_sector(pos);
            pos + SECTOR
        };

        if ppad > 0 {
            let mut buf = AlignedBuffer::new(ppad as usize, self.dev.alignment());
            buf.copy_from(payload);
            self.dev.write_at(data_offset, buf.as_slice())?;
        }

        let entry = JournalEntry::SmallWrite {
            oid,
            version,
            offset,
            len,
            data_offset,
            instant,
        };
        let pos = self.put_entry(&entry);
        Ok((pos, data_offset))
    }

    /// Write out the current sector if it holds unflushed entries.
    pub fn flush_cur_sector(&mut self) -> Result<bool> {
        if let Some(cur) = &mut self.cur {
            if cur.dirty {
                self.dev.write_at(cur.pos, cur.buf.as_slice())?;
                cur.dirty = false;
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn fsync(&self) -> Result<()> {
        self.dev.sync()
    }

    pub fn device_stats(&self) -> &crate::raw_io::IoStats {
        self.dev.stats()
    }

    /// Read a payload span previously placed by a small write.
    pub fn read_payload(&self, data_offset: u64, len: u32) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let span = sector_align_up(u64::from(len)) as usize;
        let mut buf = AlignedBuffer::new(span, self.dev.alignment());
        self.dev.read_at(data_offset, buf.as_mut_slice())?;
        Ok(buf.as_slice()[..len as usize].to_vec())
    }

    /// Take a usage reference on the sector carrying an entry.
    pub fn ref_sector(&mut self, pos: u64) {
        *self.used_sectors.entry(pos).or_insert(0) += 1;
    }

    /// Drop a usage reference.
    pub fn unref_sector(&mut self, pos: u64) {
        match self.used_sectors.get_mut(&pos) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.used_sectors.remove(&pos);
            }
            None => debug_assert!(false, "unref of unreferenced journal sector {pos}"),
        }
    }

    /// Usage count of a sector (for consistency checks).
    #[must_use]
    pub fn sector_usage(&self, pos: u64) -> u64 {
        self.used_sectors.get(&pos).copied().unwrap_or(0)
    }

    /// All sectors with a non-zero usage count.
    pub fn used_sectors(&self) -> &BTreeMap<u64, u64> {
        &self.used_sectors
    }

    /// Advance `used_start` past fully released sectors and persist the
    /// new position (with its chain seed) in the START sector. The caller
    /// must fsync before relying on the reclaimed space.
    pub fn advance_start(&mut self) -> Result<bool> {
        // Ring-order oldest: first referenced sector at or after
        // used_start, else the first one in the wrapped low segment, else
        // the open sector, else the write position itself.
        let new_start = self
            .used_sectors
            .range(self.used_start..)
            .next()
            .map(|(k, _)| *k)
            .or_else(|| self.used_sectors.keys().next().copied())
            .or_else(|| self.cur.as_ref().map(|c| c.pos))
            .unwrap_or(self.next_free);
        if new_start == self.used_start {
            return Ok(false);
        }
        let seed = self
            .sector_seeds
            .get(&new_start)
            .copied()
            .unwrap_or(self.crc32_last);
        debug!(
            old = self.used_start,
            new = new_start,
            "advancing journal start"
        );
        self.used_start = new_start;
        self.crc_begin = seed;
        if self.start_on_disk != (new_start, seed) {
            self.write_start_sector(new_start, seed)?;
        }
        Ok(true)
    }

    fn write_start_sector(&mut self, journal_start: u64, crc_begin: u32) -> Result<()> {
        let entry = JournalEntry::Start {
            journal_start,
            version: FORMAT_VERSION,
            crc_begin,
        };
        let mut buf = AlignedBuffer::new(SECTOR as usize, self.dev.alignment());
        entry.encode(buf.as_mut_slice(), 0);
        self.dev.write_at(0, buf.as_slice())?;
        self.start_on_disk = (journal_start, crc_begin);
        Ok(())
    }

    /// Walk the journal from the recorded start position, yielding every
    /// entry whose CRC chains (the first entry must chain from the seed in
    /// the START sector). The first entry that fails to chain is the
    /// journal tail: nothing past it is visible, and the write position is
    /// re-established there.
    pub fn replay(&mut self) -> Result<Vec<(JournalEntry, JePos)>> {
        let mut entries = Vec::new();
        let mut pos = self.used_start;
        let mut expected_prev = self.crc_begin;
        let mut wrapped = false;
        let mut sectors_left = self.size / SECTOR + 2;
        let mut buf = AlignedBuffer::new(SECTOR as usize, self.dev.alignment());

        // Write frontier reached so far: (open sector continuation, write
        // position). Starts at the very beginning: an empty journal leaves
        // it untouched.
        let mut frontier_cur: Option<(u64, Vec<u8>, usize, bool)> = None;
        let mut frontier_next: u64 = self.used_start;

        while sectors_left > 0 {
            sectors_left -= 1;
            if pos >= self.size {
                if wrapped {
                    break;
                }
                wrapped = true;
                pos = SECTOR;
            }
            if wrapped && pos >= self.used_start {
                break; // full circle
            }
            self.dev.read_at(pos, buf.as_mut_slice())?;

            let mut off = 0usize;
            let mut next_pos = pos + SECTOR;
            let mut sector_broke = false;
            let mut terminated = false;
            while off + ENTRY_HEADER_SIZE <= SECTOR as usize {
                let dec = match JournalEntry::decode(&buf.as_slice()[off..]) {
                    Ok(Some(dec)) => dec,
                    Ok(None) => {
                        terminated = true;
                        break;
                    }
                    Err(_) => {
                        sector_broke = true;
                        break;
                    }
                };
                if dec.crc32_prev != expected_prev {
                    sector_broke = true;
                    break;
                }
                if off == 0 {
                    self.sector_seeds.insert(pos, expected_prev);
                }
                expected_prev = dec.crc32;
                self.crc32_last = dec.crc32;
                if let JournalEntry::SmallWrite {
                    data_offset, len, ..
                } = dec.entry
                {
                    next_pos = next_pos.max(sector_align_up(data_offset + u64::from(len)));
                }
                entries.push((
                    dec.entry.clone(),
                    JePos {
                        sector: pos,
                        offset: off,
                    },
                ));
                off += dec.size;
            }

            if off == 0 {
                // Nothing chained in this sector. If the writer wrapped
                // here the chain continues at the ring start (the seed
                // check keeps stale data out); otherwise the frontier
                // found so far stands.
                if !wrapped {
                    wrapped = true;
                    pos = SECTOR;
                    continue;
                }
                break;
            }

            if sector_broke {
                // Valid prefix then garbage: crash tail inside this
                // sector. Re-open it for appends, rewriting clears the
                // trailing garbage.
                frontier_cur = Some((pos, buf.as_slice()[..off].to_vec(), off, true));
                frontier_next = next_pos;
                break;
            }

            frontier_next = next_pos;
            if terminated {
                // Entries then free space: candidate write frontier. The
                // chain may still continue in a later sector (the writer
                // closed this one early for a payload span), so keep
                // scanning; the candidate stands only if nothing follows.
                frontier_cur = Some((pos, buf.as_slice()[..off].to_vec(), off, false));
            } else {
                frontier_cur = None;
            }
            pos = next_pos;
        }

        match frontier_cur {
            Some((sector_pos, content, filled, dirty)) => {
                let mut cur_buf = AlignedBuffer::new(SECTOR as usize, self.dev.alignment());
                cur_buf.copy_from(&content);
                self.cur = Some(CurSector {
                    pos: sector_pos,
                    buf: cur_buf,
                    filled,
                    dirty,
                });
                self.next_free = frontier_next;
            }
            None => {
                self.cur = None;
                self.next_free = frontier_next;
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::JOURNAL_STABILIZE_RESERVATION;
    use crate::raw_io::RawFile;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn test_journal(size: u64) -> (NamedTempFile, Journal) {
        let tmp = NamedTempFile::new().unwrap();
        let file = Arc::new(RawFile::create(tmp.path(), size).unwrap());
        let dev = Device::new(file, 0, size, 512).unwrap();
        let journal = Journal::format(dev).unwrap();
        (tmp, journal)
    }

    fn reopen(tmp: &NamedTempFile, size: u64) -> Journal {
        let file = Arc::new(RawFile::open(tmp.path()).unwrap());
        let dev = Device::new(file, 0, size, 512).unwrap();
        Journal::open(dev).unwrap()
    }

    #[test]
    fn test_append_flush_replay() {
        let size = 64 * 1024;
        let (tmp, mut journal) = test_journal(size);

        let e1 = JournalEntry::Stable {
            oid: Oid::new(1, 0),
            version: 1,
        };
        let e2 = JournalEntry::Delete {
            oid: Oid::new(2, 0),
            version: 4,
            instant: false,
        };
        journal.append(&e1).unwrap();
        journal.append(&e2).unwrap();
        assert!(journal.cur_sector_dirty());
        journal.flush_cur_sector().unwrap();
        journal.fsync().unwrap();

        let mut reopened = reopen(&tmp, size);
        let entries = reopened.replay().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, e1);
        assert_eq!(entries[1].0, e2);
    }

    #[test]
    fn test_empty_journal_replays_empty() {
        let size = 64 * 1024;
        let (tmp, _journal) = test_journal(size);
        let mut reopened = reopen(&tmp, size);
        assert!(reopened.replay().unwrap().is_empty());
    }

    #[test]
    fn test_small_write_payload_roundtrip() {
        let size = 64 * 1024;
        let (tmp, mut journal) = test_journal(size);

        let payload = vec![0xabu8; 700];
        let (_pos, data_offset) = journal
            .append_small_write(Oid::new(1, 0), 2, 512, 700, false, &payload)
            .unwrap();
        journal.flush_cur_sector().unwrap();
        journal.fsync().unwrap();

        assert_eq!(journal.read_payload(data_offset, 700).unwrap(), payload);

        let mut reopened = reopen(&tmp, size);
        let entries = reopened.replay().unwrap();
        assert_eq!(entries.len(), 1);
        match &entries[0].0 {
            JournalEntry::SmallWrite {
                oid,
                version,
                offset,
                len,
                data_offset: replayed_offset,
                ..
            } => {
                assert_eq!(*oid, Oid::new(1, 0));
                assert_eq!(*version, 2);
                assert_eq!(*offset, 512);
                assert_eq!(*len, 700);
                assert_eq!(*replayed_offset, data_offset);
                assert_eq!(reopened.read_payload(data_offset, 700).unwrap(), payload);
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn test_replay_stops_at_broken_chain() {
        let size = 64 * 1024;
        let (tmp, mut journal) = test_journal(size);

        for v in 1..=5u64 {
            journal
                .append(&JournalEntry::Stable {
                    oid: Oid::new(1, 0),
                    version: v,
                })
                .unwrap();
        }
        journal.flush_cur_sector().unwrap();
        journal.fsync().unwrap();

        // Corrupt the third entry on disk: everything from it on is
        // invisible after replay.
        let entry_size = (ENTRY_HEADER_SIZE + 24) as u64;
        let file = RawFile::open(tmp.path()).unwrap();
        let mut sector = AlignedBuffer::new(512, 512);
        file.read_at(512, sector.as_mut_slice()).unwrap();
        let corrupt_at = (2 * entry_size) as usize + 20;
        sector.as_mut_slice()[corrupt_at] ^= 0xff;
        file.write_at(512, sector.as_slice()).unwrap();
        file.sync().unwrap();

        let mut reopened = reopen(&tmp, size);
        let entries = reopened.replay().unwrap();
        assert_eq!(entries.len(), 2);

        // The journal stays usable: appends land after the valid prefix
        // and survive another replay.
        reopened
            .append(&JournalEntry::Stable {
                oid: Oid::new(9, 0),
                version: 1,
            })
            .unwrap();
        reopened.flush_cur_sector().unwrap();
        reopened.fsync().unwrap();

        let mut third = reopen(&tmp, size);
        let entries = third.replay().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[2].0,
            JournalEntry::Stable {
                oid: Oid::new(9, 0),
                version: 1
            }
        );
    }

    #[test]
    fn test_sector_terminator_padding() {
        let size = 64 * 1024;
        let (tmp, mut journal) = test_journal(size);

        // A 512-byte sector fits 12 40-byte stable entries; the 13th must
        // open a new sector.
        for v in 1..=13u64 {
            journal
                .append(&JournalEntry::Stable {
                    oid: Oid::new(1, 0),
                    version: v,
                })
                .unwrap();
        }
        journal.flush_cur_sector().unwrap();
        journal.fsync().unwrap();

        let mut reopened = reopen(&tmp, size);
        let entries = reopened.replay().unwrap();
        assert_eq!(entries.len(), 13);
        assert_eq!(entries[11].1.sector, entries[0].1.sector);
        assert_ne!(entries[12].1.sector, entries[0].1.sector);
        assert_eq!(entries[12].1.offset, 0);
    }

    #[test]
    fn test_reserve_refuses_overflow() {
        let size = 16 * 512;
        let tmp = NamedTempFile::new().unwrap();
        let file = Arc::new(RawFile::create(tmp.path(), size).unwrap());
        let dev = Device::new(file, 0, size, 512).unwrap();
        let journal = Journal::format(dev).unwrap();

        // 15 ring sectors; reserving far more than fits must fail, a small
        // reservation must pass.
        assert!(journal.reserve(2, 40, 0, JOURNAL_STABILIZE_RESERVATION));
        assert!(!journal.reserve(200, 40, 0, JOURNAL_STABILIZE_RESERVATION));
        assert!(!journal.reserve(1, 56, 10 * 512, JOURNAL_STABILIZE_RESERVATION));
    }

    #[test]
    fn test_refcounts_and_start_advance() {
        let size = 64 * 1024;
        let (_tmp, mut journal) = test_journal(size);

        let pos = journal
            .append(&JournalEntry::Stable {
                oid: Oid::new(1, 0),
                version: 1,
            })
            .unwrap();
        journal.ref_sector(pos.sector);
        assert_eq!(journal.sector_usage(pos.sector), 1);

        // Still referenced: start cannot pass the sector.
        journal.flush_cur_sector().unwrap();
        journal.advance_start().unwrap();
        assert!(journal.used_start() <= pos.sector);

        journal.unref_sector(pos.sector);
        assert_eq!(journal.sector_usage(pos.sector), 0);
        journal.advance_start().unwrap();
        assert!(journal.used_start() >= pos.sector);
    }

    #[test]
    fn test_replay_continues_partial_sector() {
        let size = 64 * 1024;
        let (tmp, mut journal) = test_journal(size);

        journal
            .append(&JournalEntry::Stable {
                oid: Oid::new(1, 0),
                version: 1,
            })
            .unwrap();
        journal.flush_cur_sector().unwrap();
        journal.fsync().unwrap();

        // Reopen, replay, append more: the partial sector keeps filling
        // and the chain stays intact.
        let mut reopened = reopen(&tmp, size);
        assert_eq!(reopened.replay().unwrap().len(), 1);
        reopened
            .append(&JournalEntry::Stable {
                oid: Oid::new(1, 0),
                version: 2,
            })
            .unwrap();
        reopened.flush_cur_sector().unwrap();
        reopened.fsync().unwrap();

        let mut third = reopen(&tmp, size);
        let entries = third.replay().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1.sector, entries[1].1.sector);
    }

    #[test]
    fn test_advanced_start_survives_reopen() {
        let size = 64 * 1024;
        let (tmp, mut journal) = test_journal(size);

        // First batch gets reclaimed, second stays live.
        let pos1 = journal
            .append(&JournalEntry::Delete {
                oid: Oid::new(1, 0),
                version: 1,
                instant: false,
            })
            .unwrap();
        journal.ref_sector(pos1.sector);
        // Force the next entry into a new sector by filling this one.
        for v in 2..=12u64 {
            journal
                .append(&JournalEntry::Stable {
                    oid: Oid::new(1, 0),
                    version: v,
                })
                .unwrap();
        }
        let pos2 = journal
            .append(&JournalEntry::Delete {
                oid: Oid::new(2, 0),
                version: 1,
                instant: false,
            })
            .unwrap();
        assert_ne!(pos1.sector, pos2.sector);
        journal.ref_sector(pos2.sector);
        journal.flush_cur_sector().unwrap();
        journal.fsync().unwrap();

        journal.unref_sector(pos1.sector);
        journal.advance_start().unwrap();
        journal.fsync().unwrap();
        assert_eq!(journal.used_start(), pos2.sector);

        // After reopen, replay starts at the advanced position and only
        // sees the second sector's entries.
        let mut reopened = reopen(&tmp, size);
        let entries = reopened.replay().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].0,
            JournalEntry::Delete {
                oid: Oid::new(2, 0),
                version: 1,
                instant: false,
            }
        );
    }

    #[test]
    fn test_ring_wrap() {
        // Small journal: 1 START + 31 ring sectors. Fill, release, and
        // keep appending so the ring wraps several times.
        let size = 32 * 512;
        let tmp = NamedTempFile::new().unwrap();
        let file = Arc::new(RawFile::create(tmp.path(), size).unwrap());
        let dev = Device::new(file, 0, size, 512).unwrap();
        let mut journal = Journal::format(dev).unwrap();

        let mut held: Vec<u64> = Vec::new();
        let mut last_offset = 0;
        for round in 0..50u64 {
            if !journal.reserve(1, 56, 512, 0) {
                for s in held.drain(..) {
                    journal.unref_sector(s);
                }
                journal.flush_cur_sector().unwrap();
                journal.fsync().unwrap();
                journal.advance_start().unwrap();
                journal.fsync().unwrap();
                assert!(journal.reserve(1, 56, 512, 0), "round {round}");
            }
            let payload = vec![round as u8; 512];
            let (pos, data_offset) = journal
                .append_small_write(Oid::new(1, round * 512), round + 1, 0, 512, false, &payload)
                .unwrap();
            journal.ref_sector(pos.sector);
            held.push(pos.sector);
            last_offset = data_offset;
        }
        journal.flush_cur_sector().unwrap();
        journal.fsync().unwrap();

        // Replay after wrapping sees exactly the live tail, ending with
        // the last payload written.
        let mut reopened = reopen(&tmp, size);
        let entries = reopened.replay().unwrap();
        assert!(!entries.is_empty());
        let JournalEntry::SmallWrite {
            data_offset, len, ..
        } = entries.last().unwrap().0
        else {
            panic!("expected a small write");
        };
        assert_eq!(data_offset, last_offset);
        assert_eq!(
            reopened.read_payload(data_offset, len).unwrap(),
            vec![49u8; 512]
        );
    }
}
