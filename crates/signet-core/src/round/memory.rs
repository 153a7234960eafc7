//! In-memory collaborators for local testing

use super::{async_trait, ChainAcceptor, ContributionBuilder, Relay};
use crate::block::check_proof_of_work;
use crate::{Error, FederationKey, PeerId, Result, RoundMessage};
use bitcoin::psbt::{raw::ProprietaryKey, Psbt};
use bitcoin::{Block, BlockHash, Target, Witness};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const SIGNATURE_PREFIX: &[u8] = b"signet";

/// Relay that records forwarded messages and penalties instead of sending them
#[derive(Clone, Default)]
pub struct MemoryRelay {
    /// nonce -> (excluded peer, message) in relay order
    relayed: Arc<DashMap<u64, Vec<(Option<PeerId>, RoundMessage)>>>,
    /// peer -> penalty reasons
    penalties: Arc<DashMap<PeerId, Vec<String>>>,
}

impl MemoryRelay {
    /// Create an empty relay
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages relayed for round `nonce`
    pub fn relayed(&self, nonce: u64) -> Vec<(Option<PeerId>, RoundMessage)> {
        self.relayed
            .get(&nonce)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Total number of relayed messages
    pub fn relayed_count(&self) -> usize {
        self.relayed.iter().map(|entry| entry.value().len()).sum()
    }

    /// Penalty reasons recorded against `peer`
    pub fn penalties(&self, peer: PeerId) -> Vec<String> {
        self.penalties
            .get(&peer)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn relay(&self, from: Option<PeerId>, message: &RoundMessage) -> Result<()> {
        self.relayed
            .entry(message.nonce)
            .or_default()
            .push((from, message.clone()));
        Ok(())
    }

    async fn penalize(&self, peer: PeerId, reason: &str) {
        self.penalties
            .entry(peer)
            .or_default()
            .push(reason.to_string());
    }
}

/// Chain that accepts any well-formed block meeting the regtest limit
#[derive(Clone)]
pub struct MemoryChain {
    blocks: Arc<DashMap<BlockHash, Block>>,
    accepting: Arc<AtomicBool>,
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self {
            blocks: Arc::new(DashMap::new()),
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl MemoryChain {
    /// Create an empty, accepting chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every further submission fail
    pub fn reject_all(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Accepted blocks
    pub fn blocks(&self) -> Vec<Block> {
        self.blocks.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[async_trait]
impl ChainAcceptor for MemoryChain {
    async fn submit_block(&self, block: &Block) -> Result<bool> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::BlockSubmissionFailure("chain rejects all blocks".into()));
        }
        if !block.check_merkle_root() {
            return Err(Error::BlockSubmissionFailure("bad-txnmrklroot".into()));
        }
        if !check_proof_of_work(&block.header, Target::MAX_ATTAINABLE_REGTEST) {
            return Err(Error::BlockSubmissionFailure("high-hash".into()));
        }

        let new_tip = self.blocks.insert(block.block_hash(), block.clone()).is_none();
        Ok(new_tip)
    }
}

/// Signer that stands in for a wallet holding one federation key.
///
/// Signatures are recorded as proprietary fields of input 0; once
/// `threshold` of them are present the input is finalized with all of them
/// as the witness stack, like a wallet completing the spend.
#[derive(Clone)]
pub struct MemorySigner {
    key: FederationKey,
    threshold: usize,
    failing: bool,
}

impl MemorySigner {
    /// Signer for `key` that finalizes at `threshold` signatures
    pub fn new(key: FederationKey, threshold: usize) -> Self {
        Self {
            key,
            threshold,
            failing: false,
        }
    }

    /// Signer whose every contribution fails
    pub fn failing(key: FederationKey) -> Self {
        Self {
            key,
            threshold: usize::MAX,
            failing: true,
        }
    }

    /// Record a signature for `key` the way [`MemorySigner::contribute`] would
    pub fn sign_with(psbt: &mut Psbt, key: &FederationKey, threshold: usize) -> Result<()> {
        let input = psbt
            .inputs
            .first_mut()
            .ok_or_else(|| Error::Contribution("PSBT has no inputs".into()))?;

        // A finalized input is complete; wallets leave it alone
        if input.final_script_sig.is_some() || input.final_script_witness.is_some() {
            return Ok(());
        }

        let signature = key.iter().rev().copied().cycle().take(64).collect::<Vec<u8>>();
        input.proprietary.insert(
            ProprietaryKey {
                prefix: SIGNATURE_PREFIX.to_vec(),
                subtype: 0,
                key: key.clone(),
            },
            signature,
        );

        if input.proprietary.len() >= threshold {
            let stack: Vec<&Vec<u8>> = input.proprietary.values().collect();
            input.final_script_witness = Some(Witness::from_slice(&stack));
        }
        Ok(())
    }
}

#[async_trait]
impl ContributionBuilder for MemorySigner {
    async fn contribute(&self, _nonce: u64, psbt: &[u8]) -> Result<Vec<u8>> {
        if self.failing {
            return Err(Error::Contribution("signing device unavailable".into()));
        }

        let mut psbt =
            Psbt::deserialize(psbt).map_err(|e| Error::PsbtDecodeFailure(e.to_string()))?;
        Self::sign_with(&mut psbt, &self.key, self.threshold)?;
        Ok(psbt.serialize())
    }
}
