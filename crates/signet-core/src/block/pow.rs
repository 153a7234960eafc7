//! Proof-of-work search over the header nonce

use bitcoin::block::Header;
use bitcoin::Target;

/// Sweep the nonce from zero until the header hash meets `target`.
///
/// Returns `false` once the 32-bit space is exhausted; the header nonce is
/// then left at `u32::MAX` and the header must not be submitted.
pub fn grind(header: &mut Header, target: Target) -> bool {
    header.nonce = 0;
    loop {
        if target.is_met_by(header.block_hash()) {
            return true;
        }
        if header.nonce == u32::MAX {
            return false;
        }
        header.nonce += 1;
    }
}

/// Parallel sweep returning the lowest satisfying nonce.
///
/// Yields exactly the header [`grind`] would, so every federation member that
/// finishes the same round produces the same block.
#[cfg(feature = "multi-thread")]
pub fn grind_parallel(header: &mut Header, target: Target) -> bool {
    use rayon::prelude::*;

    let base = *header;
    let found = (0..=u32::MAX).into_par_iter().find_first(|nonce| {
        let mut candidate = base;
        candidate.nonce = *nonce;
        target.is_met_by(candidate.block_hash())
    });

    match found {
        Some(nonce) => {
            header.nonce = nonce;
            true
        }
        None => {
            header.nonce = u32::MAX;
            false
        }
    }
}

/// Header target is within `pow_limit` and its hash meets it
pub fn check_proof_of_work(header: &Header, pow_limit: Target) -> bool {
    let target = header.target();
    if target == Target::ZERO || target > pow_limit {
        return false;
    }
    target.is_met_by(header.block_hash())
}
