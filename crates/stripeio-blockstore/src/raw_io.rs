//! Platform-specific raw device I/O
//!
//! All three blockstore areas (data, journal, metadata) are accessed
//! through direct I/O, bypassing the OS page cache:
//! - Linux: O_DIRECT flag
//! - macOS: F_NOCACHE fcntl
//!
//! Offsets and buffer sizes must be aligned to the device's sector size.
//! The data, journal and metadata areas may live on the same file with
//! disjoint offset ranges; [`Device`] carries the base offset so callers
//! work in area-relative positions.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use stripeio_common::{Error, Result};

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Default alignment for direct I/O.
pub const ALIGNMENT: usize = 4096;

/// Raw file handle with direct I/O support.
pub struct RawFile {
    file: File,
    path: String,
    size: u64,
    stats: IoStats,
}

/// Per-file I/O counters.
#[derive(Debug, Default)]
pub struct IoStats {
    pub reads: std::sync::atomic::AtomicU64,
    pub writes: std::sync::atomic::AtomicU64,
    pub syncs: std::sync::atomic::AtomicU64,
}

impl RawFile {
    /// Open an existing file or block device for raw I/O.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true).write(true);

        let file = Self::open_direct(options, &path, &path_str)?;

        #[cfg(target_os = "macos")]
        Self::set_nocache(&file, &path_str)?;

        let size = Self::query_size(&file, &path_str)?;

        Ok(Self {
            file,
            path: path_str,
            size,
            stats: IoStats::default(),
        })
    }

    /// Create (or truncate) a regular file of the given size for raw I/O.
    /// For block devices the size parameter is ignored.
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let is_blkdev = Self::is_block_device(&path);

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if !is_blkdev {
            options.create(true).truncate(true);
        }

        let file = Self::open_direct(options, &path, &path_str)?;

        #[cfg(target_os = "macos")]
        Self::set_nocache(&file, &path_str)?;

        let actual_size = if is_blkdev {
            Self::query_size(&file, &path_str)?
        } else {
            file.set_len(size)
                .map_err(|e| Error::device_io(&path_str, e))?;
            size
        };

        Ok(Self {
            file,
            path: path_str,
            size: actual_size,
            stats: IoStats::default(),
        })
    }

    /// Open with O_DIRECT, falling back to buffered I/O on filesystems
    /// that refuse it (tmpfs and some network filesystems return EINVAL).
    #[cfg(target_os = "linux")]
    fn open_direct(options: OpenOptions, path: impl AsRef<Path>, path_str: &str) -> Result<File> {
        let mut direct = options.clone();
        direct.custom_flags(libc::O_DIRECT);
        match direct.open(&path) {
            Ok(f) => Ok(f),
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                tracing::warn!("O_DIRECT not supported on {path_str}, using buffered I/O");
                options.open(&path).map_err(|e| Error::device_io(path_str, e))
            }
            Err(e) => Err(Error::device_io(path_str, e)),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn open_direct(options: OpenOptions, path: impl AsRef<Path>, path_str: &str) -> Result<File> {
        options.open(&path).map_err(|e| Error::device_io(path_str, e))
    }

    fn is_block_device(path: impl AsRef<Path>) -> bool {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(&path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }

    #[cfg(target_os = "macos")]
    fn set_nocache(file: &File, path: &str) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
        if rc == -1 {
            return Err(Error::device_io(path, std::io::Error::last_os_error()));
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn query_size(file: &File, path: &str) -> Result<u64> {
        use std::os::unix::io::AsRawFd;

        if Self::is_block_device(path) {
            // BLKGETSIZE64
            const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;
            let mut size: u64 = 0;
            let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
            if rc == -1 {
                return Err(Error::device_io(path, std::io::Error::last_os_error()));
            }
            Ok(size)
        } else {
            Ok(file
                .metadata()
                .map_err(|e| Error::device_io(path, e))?
                .len())
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn query_size(file: &File, path: &str) -> Result<u64> {
        let mut f = file;
        let size = f
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::device_io(path, e))?;
        f.seek(SeekFrom::Start(0))
            .map_err(|e| Error::device_io(path, e))?;
        Ok(size)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn stats(&self) -> &IoStats {
        &self.stats
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::sync::atomic::Ordering;
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::device_io(&self.path, e))?;
        file.read_exact(buf)
            .map_err(|e| Error::device_io(&self.path, e))?;
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Write all of `buf` at `offset`.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        use std::sync::atomic::Ordering;
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::device_io(&self.path, e))?;
        file.write_all(buf)
            .map_err(|e| Error::device_io(&self.path, e))?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Flush device write caches.
    pub fn sync(&self) -> Result<()> {
        use std::sync::atomic::Ordering;
        self.file
            .sync_data()
            .map_err(|e| Error::device_io(&self.path, e))?;
        self.stats.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// One blockstore area: a window into a raw file at a base offset, with
/// its own alignment requirement.
#[derive(Clone)]
pub struct Device {
    file: Arc<RawFile>,
    base: u64,
    len: u64,
    alignment: usize,
}

impl Device {
    pub fn new(file: Arc<RawFile>, base: u64, len: u64, alignment: usize) -> Result<Self> {
        if base % alignment as u64 != 0 {
            return Err(Error::Configuration(format!(
                "area offset {base} is not aligned to {alignment}"
            )));
        }
        if base + len > file.size() {
            return Err(Error::Configuration(format!(
                "area [{}..{}) exceeds device size {} of {}",
                base,
                base + len,
                file.size(),
                file.path()
            )));
        }
        Ok(Self {
            file,
            base,
            len,
            alignment,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &str {
        self.file.path()
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn stats(&self) -> &IoStats {
        self.file.stats()
    }

    fn check(&self, offset: u64, size: usize) -> Result<()> {
        if offset % self.alignment as u64 != 0 || size % self.alignment != 0 {
            return Err(Error::internal(format!(
                "unaligned I/O at {offset}+{size} (alignment {})",
                self.alignment
            )));
        }
        if offset + size as u64 > self.len {
            return Err(Error::internal(format!(
                "I/O at {offset}+{size} beyond area end {}",
                self.len
            )));
        }
        Ok(())
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        self.file.read_at(self.base + offset, buf)
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        self.file.write_at(self.base + offset, buf)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }
}

/// Aligned buffer for direct I/O operations.
///
/// With O_DIRECT the buffer itself must be aligned to the device sector
/// size; this type guarantees it via manual aligned allocation.
pub struct AlignedBuffer {
    ptr: *mut u8,
    len: usize,
    alignment: usize,
}

// The buffer is a plain owned allocation.
unsafe impl Send for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate a zeroed buffer of `size` bytes rounded up to `alignment`
    /// (at least one alignment unit).
    pub fn new(size: usize, alignment: usize) -> Self {
        use std::alloc::{alloc_zeroed, Layout};

        let len = size.max(1).div_ceil(alignment) * alignment;
        let layout = Layout::from_size_align(len, alignment).expect("invalid buffer layout");
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            std::alloc::handle_alloc_error(layout);
        }
        Self {
            ptr,
            len,
            alignment,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Copy `src` into the buffer, zero-padding the remainder.
    pub fn copy_from(&mut self, src: &[u8]) {
        let n = src.len().min(self.len);
        let slice = self.as_mut_slice();
        slice[..n].copy_from_slice(&src[..n]);
        slice[n..].fill(0);
    }

    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        use std::alloc::{dealloc, Layout};
        let layout =
            Layout::from_size_align(self.len, self.alignment).expect("invalid buffer layout");
        unsafe { dealloc(self.ptr, layout) };
    }
}

impl AsRef<[u8]> for AlignedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for AlignedBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_aligned_buffer_rounds_up() {
        let mut buf = AlignedBuffer::new(100, 512);
        assert_eq!(buf.len(), 512);
        buf.copy_from(b"hello");
        assert_eq!(&buf.as_slice()[..5], b"hello");
        assert!(buf.as_slice()[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_device_region_roundtrip() {
        let tmp = NamedTempFile::new().unwrap();
        let file = Arc::new(RawFile::create(tmp.path(), 64 * 1024).unwrap());
        let dev = Device::new(file.clone(), 8192, 16 * 1024, 512).unwrap();

        let mut buf = AlignedBuffer::new(512, 512);
        buf.copy_from(b"region data");
        dev.write_at(1024, buf.as_slice()).unwrap();
        dev.sync().unwrap();

        let mut out = AlignedBuffer::new(512, 512);
        dev.read_at(1024, out.as_mut_slice()).unwrap();
        assert!(out.as_slice().starts_with(b"region data"));

        // The write landed at base + offset on the raw file.
        let mut raw = AlignedBuffer::new(512, 512);
        file.read_at(8192 + 1024, raw.as_mut_slice()).unwrap();
        assert!(raw.as_slice().starts_with(b"region data"));
    }

    #[test]
    fn test_device_rejects_unaligned() {
        let tmp = NamedTempFile::new().unwrap();
        let file = Arc::new(RawFile::create(tmp.path(), 64 * 1024).unwrap());
        let dev = Device::new(file, 0, 64 * 1024, 512).unwrap();
        let mut buf = AlignedBuffer::new(512, 512);
        assert!(dev.read_at(100, buf.as_mut_slice()).is_err());
        assert!(dev.write_at(512, &buf.as_slice()[..100]).is_err());
    }
}
