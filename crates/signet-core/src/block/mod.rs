//! Finishing a signet block once its challenge spend is final
//!
//! The finalized PSBT yields a solution, the solution is spliced into the
//! coinbase witness commitment, and the header is ground until it meets its
//! own difficulty target.

mod pow;
mod solution;

#[cfg(feature = "multi-thread")]
pub use pow::grind_parallel;
pub use pow::{check_proof_of_work, grind};
pub use solution::{
    decode_solution, embed_solution, extract_solution, witness_commitment_index, EmbedError,
    SignetSolution, SIGNET_HEADER, WITNESS_COMMITMENT_HEADER,
};

use crate::{Error, Result};
use bitcoin::Block;
use tracing::debug;

/// Embed `solution` into `block` and grind its header.
///
/// Blocking and CPU bound; run it off the async executor.
pub fn finish_block(mut block: Block, solution: &[u8]) -> Result<Block> {
    embed_solution(&mut block, solution)?;

    let target = block.header.target();
    debug!(
        merkle_root = %block.header.merkle_root,
        bits = block.header.bits.to_consensus(),
        "Grinding block header"
    );

    #[cfg(feature = "multi-thread")]
    let solved = grind_parallel(&mut block.header, target);
    #[cfg(not(feature = "multi-thread"))]
    let solved = grind(&mut block.header, target);

    if !solved {
        return Err(Error::ProofOfWorkExhausted(block.header.merkle_root.to_string()));
    }
    Ok(block)
}
