//! Read and list
//!
//! Reads compose the newest visible state of an object: the latest big
//! write (or the clean block) as the base, overlaid with every newer
//! small-write payload in version order. Holes read as zeros. List
//! enumerates stable and unstable versions for peering.

use crate::engine::{Blockstore, Step};
use crate::op::{BsOp, BsOut};
use crate::raw_io::AlignedBuffer;
use stripeio_common::{Error, ObjVer, Oid, Result, Workflow, WriteKind};

impl Blockstore {
    pub(crate) fn progress_read(&mut self, op: &BsOp) -> Step {
        let BsOp::Read { oid, offset, len } = op else {
            unreachable!()
        };
        Step::Done(self.read_object(*oid, *offset, *len).map(BsOut::Data))
    }

    fn read_object(&self, oid: Oid, offset: u32, len: u32) -> Result<Vec<u8>> {
        if u64::from(offset) + u64::from(len) > u64::from(self.block_size) {
            return Err(Error::invalid_input(format!(
                "read beyond block end: offset {offset} len {len}"
            )));
        }

        // Visible dirty versions: device work complete, not discarded.
        let visible: Vec<(ObjVer, &crate::engine::DirtyEntry)> = self
            .dirty
            .range(ObjVer::new(oid, 0)..=ObjVer::new(oid, u64::MAX))
            .filter(|(_, e)| e.state.workflow() >= Workflow::Written)
            .map(|(ov, e)| (*ov, e))
            .collect();
        let clean = self.clean.get(&oid).copied();

        if let Some((_, last)) = visible.last() {
            if last.state.kind() == WriteKind::Delete {
                return Err(Error::ObjectNotFound(oid));
            }
        } else if clean.is_none() {
            return Err(Error::ObjectNotFound(oid));
        }

        // Base: newest big write, else the clean block, else zeros.
        let mut base_version = 0u64;
        let mut base_location = None;
        for (ov, e) in visible.iter().rev() {
            match e.state.kind() {
                WriteKind::Big => {
                    base_version = ov.version;
                    base_location = e.location;
                    break;
                }
                WriteKind::Delete => {
                    // Everything below the delete is invisible.
                    base_version = ov.version;
                    base_location = None;
                    break;
                }
                WriteKind::Small => {}
            }
        }
        if base_location.is_none() && base_version == 0 {
            if let Some(c) = clean {
                base_version = c.version;
                base_location = Some(c.location);
            }
        }

        let mut buf = vec![0u8; len as usize];
        if let Some(location) = base_location {
            self.read_block_range(location, offset, &mut buf)?;
        }

        // Overlay newer small writes, oldest first.
        for (ov, e) in &visible {
            if ov.version <= base_version || e.state.kind() != WriteKind::Small {
                continue;
            }
            let payload = e
                .payload
                .as_deref()
                .ok_or_else(|| Error::internal(format!("small write {ov} lost payload")))?;
            overlay(&mut buf, offset, e.offset, payload);
        }
        Ok(buf)
    }

    /// Read an arbitrary byte range of a data block through aligned I/O.
    pub(crate) fn read_block_range(&self, location: u64, offset: u32, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        let align = self.data.alignment() as u64;
        let block_base = location * u64::from(self.block_size);
        let start = u64::from(offset) / align * align;
        let end = (u64::from(offset) + out.len() as u64).div_ceil(align) * align;

        let mut buf = AlignedBuffer::new((end - start) as usize, self.data.alignment());
        self.data.read_at(block_base + start, buf.as_mut_slice())?;
        let from = (u64::from(offset) - start) as usize;
        out.copy_from_slice(&buf.as_slice()[from..from + out.len()]);
        Ok(())
    }

    pub(crate) fn progress_list(&mut self, op: &BsOp) -> Step {
        let BsOp::List { filter } = op else {
            unreachable!()
        };

        let matches = |oid: &Oid| match filter {
            Some(f) => oid.to_pg(f.pg_count, f.pg_stripe_size) == f.pg_num,
            None => true,
        };

        let mut stable: Vec<ObjVer> = self
            .clean
            .iter()
            .filter(|(oid, _)| matches(oid))
            .map(|(oid, c)| ObjVer::new(*oid, c.version))
            .collect();
        stable.sort();

        let unstable: Vec<ObjVer> = self
            .dirty
            .iter()
            .filter(|(ov, e)| {
                matches(&ov.oid) && e.state.workflow() == Workflow::Synced
            })
            .map(|(ov, _)| *ov)
            .collect();

        Step::Done(Ok(BsOut::ObjectList { stable, unstable }))
    }
}

/// Copy the intersection of a small-write payload into a read window.
fn overlay(buf: &mut [u8], read_offset: u32, write_offset: u32, payload: &[u8]) {
    let read_start = u64::from(read_offset);
    let read_end = read_start + buf.len() as u64;
    let write_start = u64::from(write_offset);
    let write_end = write_start + payload.len() as u64;

    let start = read_start.max(write_start);
    let end = read_end.min(write_end);
    if start >= end {
        return;
    }
    let dst = (start - read_start) as usize;
    let src = (start - write_start) as usize;
    let n = (end - start) as usize;
    buf[dst..dst + n].copy_from_slice(&payload[src..src + n]);
}

#[cfg(test)]
mod tests {
    use super::overlay;

    #[test]
    fn test_overlay_intersections() {
        let mut buf = vec![0u8; 8];
        // Fully inside.
        overlay(&mut buf, 0, 2, &[1, 1]);
        assert_eq!(buf, vec![0, 0, 1, 1, 0, 0, 0, 0]);
        // Clipped at the front.
        overlay(&mut buf, 4, 2, &[2, 2, 2, 2]);
        assert_eq!(buf, vec![0, 0, 1, 1, 2, 2, 0, 0]);
        // Disjoint.
        overlay(&mut buf, 0, 100, &[9]);
        assert_eq!(buf, vec![0, 0, 1, 1, 2, 2, 0, 0]);
    }
}
