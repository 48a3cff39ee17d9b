//! Checksum helpers
//!
//! Journal entries are chained: each entry's CRC is seeded with the CRC of
//! the entry before it, so replay can find the exact tail of the log.

/// CRC32C of a byte slice.
#[must_use]
pub fn crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Rolling CRC over (previous entry's CRC, entry bytes). The first entry
/// after the journal START chains from the CRC recorded in START.
#[must_use]
pub fn crc32c_chained(prev: u32, data: &[u8]) -> u32 {
    let seed = crc32c::crc32c(&prev.to_le_bytes());
    crc32c::crc32c_append(seed, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_depends_on_prev() {
        let a = crc32c_chained(0, b"entry");
        let b = crc32c_chained(1, b"entry");
        assert_ne!(a, b);
    }

    #[test]
    fn test_chain_is_deterministic() {
        let first = crc32c_chained(0, b"one");
        let second = crc32c_chained(first, b"two");
        assert_eq!(second, crc32c_chained(first, b"two"));
        assert_ne!(second, crc32c_chained(first, b"tw0"));
    }
}
