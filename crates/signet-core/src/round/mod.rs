//! Round processing and its collaborators
//!
//! The processor owns validation, session bookkeeping and block finishing.
//! Signing, transport and chain acceptance live behind the traits below.

use crate::{Error, PeerId, Result, RoundMessage};
use bitcoin::psbt::Psbt;
use bitcoin::{Block, BlockHash};

pub use ::async_trait::async_trait;

/// Signs the round PSBT with the local federation key
#[async_trait]
pub trait ContributionBuilder: Send + Sync {
    /// Return the PSBT with this node's signature added.
    ///
    /// A signer that completes the spend may finalize the input as well.
    async fn contribute(&self, nonce: u64, psbt: &[u8]) -> Result<Vec<u8>>;
}

/// Flood-fill transport for round messages
#[async_trait]
pub trait Relay: Send + Sync {
    /// Forward `message` to every peer except `from`; `None` means all peers
    async fn relay(&self, from: Option<PeerId>, message: &RoundMessage) -> Result<()>;

    /// Report misbehaviour of `peer`
    async fn penalize(&self, peer: PeerId, reason: &str);
}

/// Accepts finished blocks into the chain
#[async_trait]
pub trait ChainAcceptor: Send + Sync {
    /// Submit `block`; `Ok(true)` if it became the new best tip
    async fn submit_block(&self, block: &Block) -> Result<bool>;
}

/// Decodes a PSBT and finalizes its challenge input
pub trait PsbtFinalizer: Send + Sync {
    /// Finalized PSBT, or `PsbtDecodeFailure` / `PsbtNotFinalizable`
    fn finalize(&self, psbt: &[u8]) -> Result<Psbt>;
}

/// Finalizer for PSBTs whose last signer already finalized the input.
///
/// Wallet signing finalizes as soon as the spend is complete, so the PSBT
/// that carries the threshold-th signature arrives with final fields set.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreFinalized;

impl PsbtFinalizer for PreFinalized {
    fn finalize(&self, psbt: &[u8]) -> Result<Psbt> {
        let psbt = Psbt::deserialize(psbt).map_err(|e| Error::PsbtDecodeFailure(e.to_string()))?;
        let input = psbt
            .inputs
            .first()
            .ok_or_else(|| Error::PsbtNotFinalizable("PSBT has no inputs".into()))?;

        if input.final_script_sig.is_none() && input.final_script_witness.is_none() {
            return Err(Error::PsbtNotFinalizable(
                "input 0 has no final script".into(),
            ));
        }
        Ok(psbt)
    }
}

/// What happened to one inbound round message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// No federation configured; forwarded without judgement
    RelayedUnvalidated,
    /// Our id was already listed; dropped
    AlreadyComplete,
    /// Forwarded, after adding our signature if `signed`
    Relayed { signed: bool },
    /// Round finished and the block went to the chain
    BlockSubmitted { hash: BlockHash, new_tip: bool },
}

mod processor;

/// In-memory collaborators for tests and simulations
pub mod memory;

pub use memory::{MemoryChain, MemoryRelay, MemorySigner};
pub use processor::RoundProcessor;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::testing::spending_psbt;
    use bitcoin::Witness;

    #[test]
    fn test_pre_finalized_accepts_final_input() {
        let mut psbt = spending_psbt();
        psbt.inputs[0].final_script_witness = Some(Witness::from_slice(&[vec![1u8; 64]]));
        assert!(PreFinalized.finalize(&psbt.serialize()).is_ok());
    }

    #[test]
    fn test_pre_finalized_rejects_partial_input() {
        let psbt = spending_psbt();
        assert!(matches!(
            PreFinalized.finalize(&psbt.serialize()),
            Err(Error::PsbtNotFinalizable(_))
        ));
    }

    #[test]
    fn test_pre_finalized_rejects_garbage() {
        assert!(matches!(
            PreFinalized.finalize(b"test_psbt_data"),
            Err(Error::PsbtDecodeFailure(_))
        ));
    }
}
