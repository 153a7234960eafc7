//! Round-scoped short ids

use crate::{FederationKey, ShortId};
use bitcoin::hashes::siphash24;
use std::collections::HashSet;

/// SipHash-2-4 of the serialized key, keyed with `(nonce, 0)`.
///
/// The same member maps to unrelated ids in different rounds, so ids seen on
/// the wire cannot be linked across rounds.
pub fn compute_short_id(nonce: u64, key: &[u8]) -> ShortId {
    siphash24::Hash::hash_to_u64_with_keys(nonce, 0, key)
}

/// Every short id valid for round `nonce`
pub fn federation_short_ids(nonce: u64, keys: &[FederationKey]) -> HashSet<ShortId> {
    keys.iter().map(|key| compute_short_id(nonce, key)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keys(n: u8) -> Vec<FederationKey> {
        (0..n)
            .map(|i| {
                let mut key = vec![0x02; 33];
                key[32] = i;
                key
            })
            .collect()
    }

    #[test]
    fn test_short_id_deterministic() {
        let key = test_keys(1).remove(0);
        assert_eq!(compute_short_id(7, &key), compute_short_id(7, &key));
    }

    #[test]
    fn test_short_id_depends_on_nonce() {
        for key in test_keys(100) {
            assert_ne!(compute_short_id(1, &key), compute_short_id(2, &key));
            assert_ne!(compute_short_id(0, &key), compute_short_id(u64::MAX, &key));
        }
    }

    #[test]
    fn test_short_ids_distinct_within_round() {
        let keys = test_keys(100);
        assert_eq!(federation_short_ids(42, &keys).len(), 100);
    }

    #[test]
    fn test_siphash_reference_vector() {
        // SipHash-2-4 reference: key 00..0f, empty message
        let k0 = u64::from_le_bytes([0, 1, 2, 3, 4, 5, 6, 7]);
        let k1 = u64::from_le_bytes([8, 9, 10, 11, 12, 13, 14, 15]);
        assert_eq!(
            siphash24::Hash::hash_to_u64_with_keys(k0, k1, &[]),
            0x726fdb47dd0e0e31
        );
    }
}
