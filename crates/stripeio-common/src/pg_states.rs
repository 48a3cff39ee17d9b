//! Placement group state bits
//!
//! A PG's state is a combination of these bits. OFFLINE, PEERING and
//! INCOMPLETE are exclusive: a state word containing one of them must be
//! exactly that single bit.

pub const PG_OFFLINE: u32 = 1 << 0;
pub const PG_PEERING: u32 = 1 << 1;
pub const PG_INCOMPLETE: u32 = 1 << 2;
pub const PG_ACTIVE: u32 = 1 << 3;
pub const PG_REPEERING: u32 = 1 << 4;
pub const PG_STOPPING: u32 = 1 << 5;
pub const PG_DEGRADED: u32 = 1 << 6;
pub const PG_HAS_DEGRADED: u32 = 1 << 7;
pub const PG_HAS_MISPLACED: u32 = 1 << 8;
pub const PG_HAS_UNCLEAN: u32 = 1 << 9;

/// Name table, index-aligned with the bit positions above. These names are
/// what appears in the cluster store under `/pg/state/<n>`.
pub const PG_STATE_NAMES: &[(&str, u32)] = &[
    ("offline", PG_OFFLINE),
    ("peering", PG_PEERING),
    ("incomplete", PG_INCOMPLETE),
    ("active", PG_ACTIVE),
    ("repeering", PG_REPEERING),
    ("stopping", PG_STOPPING),
    ("degraded", PG_DEGRADED),
    ("has_degraded", PG_HAS_DEGRADED),
    ("has_misplaced", PG_HAS_MISPLACED),
    ("has_unclean", PG_HAS_UNCLEAN),
];

/// Look up a state bit by its cluster-store name.
#[must_use]
pub fn bit_by_name(name: &str) -> Option<u32> {
    PG_STATE_NAMES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, b)| *b)
}

/// Render a combined state word as its list of names.
#[must_use]
pub fn state_names(state: u32) -> Vec<&'static str> {
    PG_STATE_NAMES
        .iter()
        .filter(|(_, b)| state & b != 0)
        .map(|(n, _)| *n)
        .collect()
}

/// Validate the exclusivity rule: OFFLINE / PEERING / INCOMPLETE may only
/// appear alone.
#[must_use]
pub fn is_valid_state(state: u32) -> bool {
    if state == 0 {
        return false;
    }
    for bit in [PG_OFFLINE, PG_PEERING, PG_INCOMPLETE] {
        if state & bit != 0 && state != bit {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_by_name() {
        assert_eq!(bit_by_name("active"), Some(PG_ACTIVE));
        assert_eq!(bit_by_name("bogus"), None);
    }

    #[test]
    fn test_exclusive_states() {
        assert!(is_valid_state(PG_OFFLINE));
        assert!(is_valid_state(PG_ACTIVE | PG_HAS_DEGRADED | PG_DEGRADED));
        assert!(!is_valid_state(PG_PEERING | PG_ACTIVE));
        assert!(!is_valid_state(PG_INCOMPLETE | PG_HAS_UNCLEAN));
        assert!(!is_valid_state(0));
    }

    #[test]
    fn test_names_roundtrip() {
        let state = PG_ACTIVE | PG_HAS_MISPLACED;
        let names = state_names(state);
        let mut rebuilt = 0;
        for n in names {
            rebuilt |= bit_by_name(n).unwrap();
        }
        assert_eq!(rebuilt, state);
    }
}
