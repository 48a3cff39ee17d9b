//! Metadata area
//!
//! A packed array of clean-entry records indexed by the data block number
//! they occupy, behind one header sector. Records are read-modify-written
//! one sector at a time when versions are stabilised; the full area is
//! scanned once at startup to rebuild the clean index.

use crate::layout::{MetaHeader, MetaRecord, META_RECORD_SIZE, META_SECTOR_SIZE};
use crate::raw_io::{AlignedBuffer, Device};
use stripeio_common::{Error, Result};

pub struct MetaArea {
    dev: Device,
    block_count: u64,
}

impl MetaArea {
    /// Bytes the metadata area needs for `block_count` blocks.
    #[must_use]
    pub fn required_size(block_count: u64) -> u64 {
        META_SECTOR_SIZE + (block_count * META_RECORD_SIZE).div_ceil(META_SECTOR_SIZE) * META_SECTOR_SIZE
    }

    /// Initialise a fresh metadata area: zero the records and write the
    /// header sector.
    pub fn format(dev: Device, block_size: u32, block_count: u64) -> Result<Self> {
        let needed = Self::required_size(block_count);
        if dev.len() < needed {
            return Err(Error::Configuration(format!(
                "metadata area of {} bytes cannot hold {} blocks ({} needed)",
                dev.len(),
                block_count,
                needed
            )));
        }

        let chunk = AlignedBuffer::new(64 * 1024, dev.alignment());
        let mut pos = META_SECTOR_SIZE;
        while pos < needed {
            let n = (needed - pos).min(chunk.len() as u64) as usize;
            dev.write_at(pos, &chunk.as_slice()[..n])?;
            pos += n as u64;
        }

        let mut header_buf = AlignedBuffer::new(META_SECTOR_SIZE as usize, dev.alignment());
        MetaHeader::new(block_size, block_count).encode(header_buf.as_mut_slice());
        dev.write_at(0, header_buf.as_slice())?;
        dev.sync()?;

        Ok(Self { dev, block_count })
    }

    /// Open an existing metadata area and validate its geometry.
    pub fn open(dev: Device, block_size: u32, block_count: u64) -> Result<Self> {
        let mut header_buf = AlignedBuffer::new(META_SECTOR_SIZE as usize, dev.alignment());
        dev.read_at(0, header_buf.as_mut_slice())?;
        let header = MetaHeader::decode(header_buf.as_slice())?;
        if header.block_size != block_size || header.block_count != block_count {
            return Err(Error::corruption(format!(
                "metadata geometry mismatch: on disk {}x{} blocks, configured {}x{}",
                header.block_count, header.block_size, block_count, block_size
            )));
        }
        Ok(Self { dev, block_count })
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Scan every record slot, invoking `f` for each occupied one.
    pub fn load(&self, mut f: impl FnMut(u64, MetaRecord)) -> Result<()> {
        let total = self.block_count * META_RECORD_SIZE;
        let mut buf = AlignedBuffer::new(64 * 1024, self.dev.alignment());
        let mut read = 0u64;
        while read < total {
            let n = (total - read).min(buf.len() as u64) as usize;
            let n_aligned = n.div_ceil(META_SECTOR_SIZE as usize) * META_SECTOR_SIZE as usize;
            self.dev
                .read_at(META_SECTOR_SIZE + read, &mut buf.as_mut_slice()[..n_aligned])?;
            let records = n as u64 / META_RECORD_SIZE;
            for i in 0..records {
                let block = read / META_RECORD_SIZE + i;
                let off = (i * META_RECORD_SIZE) as usize;
                if let Some(rec) =
                    MetaRecord::decode(&buf.as_slice()[off..off + META_RECORD_SIZE as usize])
                {
                    f(block, rec);
                }
            }
            read += n as u64;
        }
        Ok(())
    }

    /// Update one record slot, rewriting its whole sector. Durability is
    /// the caller's business (stabilize batches several updates under one
    /// fsync).
    pub fn write_record(&self, block: u64, rec: Option<&MetaRecord>) -> Result<()> {
        if block >= self.block_count {
            return Err(Error::internal(format!(
                "meta record {block} out of range ({} blocks)",
                self.block_count
            )));
        }
        let byte = block * META_RECORD_SIZE;
        let sector = byte / META_SECTOR_SIZE * META_SECTOR_SIZE;
        let in_sector = (byte - sector) as usize;

        let mut buf = AlignedBuffer::new(META_SECTOR_SIZE as usize, self.dev.alignment());
        self.dev.read_at(META_SECTOR_SIZE + sector, buf.as_mut_slice())?;
        MetaRecord::encode(rec, &mut buf.as_mut_slice()[in_sector..]);
        self.dev.write_at(META_SECTOR_SIZE + sector, buf.as_slice())
    }

    pub fn sync(&self) -> Result<()> {
        self.dev.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw_io::RawFile;
    use std::sync::Arc;
    use stripeio_common::Oid;
    use tempfile::NamedTempFile;

    fn area(block_count: u64) -> (NamedTempFile, MetaArea) {
        let size = MetaArea::required_size(block_count);
        let tmp = NamedTempFile::new().unwrap();
        let file = Arc::new(RawFile::create(tmp.path(), size).unwrap());
        let dev = Device::new(file, 0, size, 4096).unwrap();
        let meta = MetaArea::format(dev, 4096, block_count).unwrap();
        (tmp, meta)
    }

    #[test]
    fn test_write_and_scan() {
        let (tmp, meta) = area(1000);

        meta.write_record(
            5,
            Some(&MetaRecord {
                oid: Oid::new(1, 0),
                version: 3,
            }),
        )
        .unwrap();
        meta.write_record(
            900,
            Some(&MetaRecord {
                oid: Oid::new(2, 4096),
                version: 1,
            }),
        )
        .unwrap();
        meta.sync().unwrap();

        let size = MetaArea::required_size(1000);
        let file = Arc::new(RawFile::open(tmp.path()).unwrap());
        let dev = Device::new(file, 0, size, 4096).unwrap();
        let meta = MetaArea::open(dev, 4096, 1000).unwrap();

        let mut found = Vec::new();
        meta.load(|block, rec| found.push((block, rec))).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, 5);
        assert_eq!(found[0].1.oid, Oid::new(1, 0));
        assert_eq!(found[0].1.version, 3);
        assert_eq!(found[1].0, 900);
    }

    #[test]
    fn test_clear_record() {
        let (_tmp, meta) = area(100);
        meta.write_record(
            7,
            Some(&MetaRecord {
                oid: Oid::new(9, 0),
                version: 2,
            }),
        )
        .unwrap();
        meta.write_record(7, None).unwrap();

        let mut count = 0;
        meta.load(|_, _| count += 1).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_geometry_mismatch_rejected() {
        let (tmp, _meta) = area(100);
        let size = MetaArea::required_size(100);
        let file = Arc::new(RawFile::open(tmp.path()).unwrap());
        let dev = Device::new(file, 0, size, 4096).unwrap();
        assert!(MetaArea::open(dev, 8192, 100).is_err());
    }
}
