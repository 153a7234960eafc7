//! Per-message round state machine

use super::{ChainAcceptor, ContributionBuilder, PreFinalized, PsbtFinalizer, Relay, RoundOutcome};
use crate::block::{extract_solution, finish_block};
use crate::federation::{
    distinct_signers, Decision, FederationSnapshot, RejectReason, RoundValidator,
    SignerSetResolver,
};
use crate::session::SessionRegistry;
use crate::{Error, PeerId, Result, RoundMessage, DEFAULT_THRESHOLD};
use bitcoin::consensus::encode;
use bitcoin::psbt::Psbt;
use bitcoin::Block;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Drives inbound round messages through validation, signing, relay and
/// block publication.
///
/// # Arguments
/// * `resolver` - Source of the federation key set
/// * `signer` - Local signing step, only used when this node is a member
/// * `relay` - Gossip transport
pub struct RoundProcessor<S, R> {
    validator: RoundValidator,
    sessions: SessionRegistry,
    signer: S,
    relay: R,
    finalizer: Box<dyn PsbtFinalizer>,
    threshold: usize,
}

impl<S: ContributionBuilder, R: Relay> RoundProcessor<S, R> {
    /// Create a processor with the default threshold and finalizer
    pub fn new(resolver: Arc<dyn SignerSetResolver>, signer: S, relay: R) -> Self {
        Self {
            validator: RoundValidator::new(resolver),
            sessions: SessionRegistry::new(),
            signer,
            relay,
            finalizer: Box::new(PreFinalized),
            threshold: DEFAULT_THRESHOLD,
        }
    }

    /// Set the number of distinct contributors that triggers finalization
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Replace the PSBT finalizer
    pub fn with_finalizer(mut self, finalizer: impl PsbtFinalizer + 'static) -> Self {
        self.finalizer = Box::new(finalizer);
        self
    }

    /// Share an existing session registry
    pub fn with_sessions(mut self, sessions: SessionRegistry) -> Self {
        self.sessions = sessions;
        self
    }

    /// Active signing sessions
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Gossip transport
    pub fn relay(&self) -> &R {
        &self.relay
    }

    /// Process one inbound message; outcomes are only observable through
    /// logs, the relay and the chain.
    pub async fn process<C: ChainAcceptor>(&self, peer: PeerId, bytes: &[u8], chain: &C) {
        match self.handle(peer, bytes, chain).await {
            Ok(outcome) => debug!(peer, ?outcome, "Round message processed"),
            Err(e) => log_failure(peer, &e),
        }
    }

    /// Process one inbound message and report what happened
    #[instrument(skip(self, bytes, chain), fields(size = bytes.len()))]
    pub async fn handle<C: ChainAcceptor>(
        &self,
        peer: PeerId,
        bytes: &[u8],
        chain: &C,
    ) -> Result<RoundOutcome> {
        let msg = RoundMessage::decode(bytes)?;

        debug!(
            nonce = msg.nonce,
            psbt_size = msg.psbt.len(),
            block_template_size = msg.block_template.len(),
            signers = msg.signers_short_ids.len(),
            "Received round message"
        );

        let federation = self.validator.snapshot();
        match RoundValidator::validate(&msg, federation.as_ref()) {
            Decision::Reject(RejectReason::NoFederation) => {
                warn!(nonce = msg.nonce, "No federation configured, relaying unvalidated");
                self.relay.relay(Some(peer), &msg).await?;
                return Ok(RoundOutcome::RelayedUnvalidated);
            }
            Decision::Reject(RejectReason::UnknownSigner(id)) => {
                self.relay.penalize(peer, "unknown signer short id").await;
                return Err(Error::UnknownSigner(id));
            }
            Decision::AlreadyComplete => {
                debug!(nonce = msg.nonce, "Already signed, dropping");
                return Ok(RoundOutcome::AlreadyComplete);
            }
            Decision::Eligible => {}
        }

        self.sessions.start(msg.nonce);

        // A complete round is published as is; signing it would change the solution
        if let Some(psbt) = self.finalized(&msg) {
            return self.publish(msg.nonce, &psbt, &msg.block_template, chain).await;
        }

        let (msg, signed) = self.contribute(msg, federation.as_ref()).await;
        self.advance(Some(peer), msg, signed, chain).await
    }

    /// Start a new round for `psbt` and `block_template`, signing it first if
    /// this node is a member
    #[instrument(skip_all)]
    pub async fn initiate<C: ChainAcceptor>(
        &self,
        psbt: Vec<u8>,
        block_template: Vec<u8>,
        chain: &C,
    ) -> Result<(RoundMessage, RoundOutcome)> {
        let federation = self
            .validator
            .snapshot()
            .ok_or(Error::NoFederationConfigured)?;

        let msg = RoundMessage::initiate(psbt, block_template);
        info!(nonce = msg.nonce, "Initiating signing round");

        self.sessions.start(msg.nonce);
        let (msg, signed) = self.contribute(msg, Some(&federation)).await;
        let outcome = self.advance(None, msg.clone(), signed, chain).await?;
        Ok((msg, outcome))
    }

    /// Add our signature if we are a member and have not signed this round yet
    async fn contribute(
        &self,
        msg: RoundMessage,
        federation: Option<&FederationSnapshot>,
    ) -> (RoundMessage, bool) {
        let Some(our_id) = RoundValidator::our_short_id(msg.nonce, federation) else {
            return (msg, false);
        };

        if !self.sessions.try_claim_contribution(msg.nonce) {
            debug!(nonce = msg.nonce, "Already contributed to this round");
            return (msg, false);
        }

        match self.signer.contribute(msg.nonce, &msg.psbt).await {
            Ok(psbt) => {
                info!(
                    nonce = msg.nonce,
                    short_id = %format!("{:#018x}", our_id),
                    "Contributed signature"
                );
                (msg.with_contribution(psbt, our_id), true)
            }
            Err(e) => {
                self.sessions.release_contribution(msg.nonce);
                warn!(nonce = msg.nonce, error = %e, "Local signing failed, relaying unsigned");
                (msg, false)
            }
        }
    }

    /// Publish a block if the round is complete, otherwise keep gossiping it
    async fn advance<C: ChainAcceptor>(
        &self,
        from: Option<PeerId>,
        msg: RoundMessage,
        signed: bool,
        chain: &C,
    ) -> Result<RoundOutcome> {
        if let Some(psbt) = self.finalized(&msg) {
            return self.publish(msg.nonce, &psbt, &msg.block_template, chain).await;
        }

        // A message we changed goes back to the sender too
        let exclude = if signed { None } else { from };
        self.relay.relay(exclude, &msg).await?;
        Ok(RoundOutcome::Relayed { signed })
    }

    /// Finalized PSBT once enough distinct members are listed and the spend is complete
    fn finalized(&self, msg: &RoundMessage) -> Option<Psbt> {
        let signers = distinct_signers(msg);
        if signers < self.threshold {
            return None;
        }

        match self.finalizer.finalize(&msg.psbt) {
            Ok(psbt) => {
                info!(nonce = msg.nonce, signers, threshold = self.threshold, "Threshold reached");
                Some(psbt)
            }
            Err(e) => {
                debug!(nonce = msg.nonce, signers, error = %e, "PSBT not final yet");
                None
            }
        }
    }

    /// Embed, grind and submit; every other round is stale afterwards
    async fn publish<C: ChainAcceptor>(
        &self,
        nonce: u64,
        psbt: &Psbt,
        block_template: &[u8],
        chain: &C,
    ) -> Result<RoundOutcome> {
        let finished = match self.finish(psbt, block_template).await {
            Ok(block) => block,
            Err(e) => {
                self.sessions.end(nonce);
                return Err(e);
            }
        };

        let hash = finished.block_hash();
        let new_tip = chain.submit_block(&finished).await?;
        let dropped = self.sessions.surrender_all();

        info!(nonce, %hash, new_tip, dropped, "Block submitted");
        Ok(RoundOutcome::BlockSubmitted { hash, new_tip })
    }

    async fn finish(&self, psbt: &Psbt, block_template: &[u8]) -> Result<Block> {
        let block: Block = encode::deserialize(block_template)
            .map_err(|e| Error::MalformedTemplate(e.to_string()))?;
        let solution = extract_solution(psbt)?;

        // Grinding never runs on the executor or under a registry guard
        tokio::task::spawn_blocking(move || finish_block(block, &solution))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
    }
}

fn log_failure(peer: PeerId, e: &Error) {
    match e {
        Error::PsbtDecodeFailure(_) | Error::PsbtNotFinalizable(_) => {
            debug!(peer, error = %e, "Round not final")
        }
        Error::MalformedMessage(_) | Error::UnknownSigner(_) | Error::Relay(_) => {
            warn!(peer, error = %e, "Round message dropped")
        }
        _ => error!(peer, error = %e, "Round abandoned"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::testing::{spending_psbt, template};
    use crate::block::{check_proof_of_work, decode_solution, SIGNET_HEADER};
    use crate::federation::{compute_short_id, StaticFederation};
    use crate::round::{MemoryChain, MemoryRelay, MemorySigner};
    use crate::{FederationKey, DEFAULT_FEDERATION_SIZE};
    use bitcoin::Target;

    const PEER: PeerId = 7;

    fn keys(n: usize) -> Vec<FederationKey> {
        (0..n)
            .map(|i| {
                let mut key = vec![0x02; 33];
                key[32] = i as u8;
                key
            })
            .collect()
    }

    fn member(index: usize, threshold: usize) -> RoundProcessor<MemorySigner, MemoryRelay> {
        let keys = keys(DEFAULT_FEDERATION_SIZE);
        let local = keys[index].clone();
        let resolver = StaticFederation::new(FederationSnapshot::member(keys, local.clone()));
        RoundProcessor::new(Arc::new(resolver), MemorySigner::new(local, threshold), MemoryRelay::new())
            .with_threshold(threshold)
    }

    fn observer() -> RoundProcessor<MemorySigner, MemoryRelay> {
        let resolver = StaticFederation::new(FederationSnapshot::observer(keys(DEFAULT_FEDERATION_SIZE)));
        RoundProcessor::new(Arc::new(resolver), MemorySigner::failing(vec![]), MemoryRelay::new())
    }

    /// Round message already signed by members `signers`
    fn round(nonce: u64, signers: &[usize], threshold: usize) -> RoundMessage {
        let keys = keys(DEFAULT_FEDERATION_SIZE);
        let mut psbt = spending_psbt();
        let mut msg = RoundMessage::new(nonce, vec![], encode::serialize(&template()));
        for &i in signers {
            MemorySigner::sign_with(&mut psbt, &keys[i], threshold).unwrap();
            msg.signers_short_ids.push(compute_short_id(nonce, &keys[i]));
        }
        msg.psbt = psbt.serialize();
        msg
    }

    #[tokio::test]
    async fn test_malformed_message_dropped() {
        let node = member(0, 10);
        let chain = MemoryChain::new();

        let result = node.handle(PEER, &[0x01, 0x02], &chain).await;
        assert!(matches!(result, Err(Error::MalformedMessage(_))));
        assert!(node.sessions().is_empty());
        assert_eq!(node.relay().relayed_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_signer_penalized() {
        let node = member(0, 10);
        let chain = MemoryChain::new();
        let mut msg = round(5, &[1, 2], 10);
        msg.signers_short_ids.push(0xbad);

        let result = node.handle(PEER, &msg.encode(), &chain).await;
        assert!(matches!(result, Err(Error::UnknownSigner(0xbad))));
        assert_eq!(node.relay().penalties(PEER).len(), 1);
        assert_eq!(node.relay().relayed_count(), 0);
        assert!(!node.sessions().has(5));
    }

    #[tokio::test]
    async fn test_member_signs_and_relays() {
        let node = member(3, 10);
        let chain = MemoryChain::new();
        let msg = round(11, &[1, 2], 10);

        let outcome = node.handle(PEER, &msg.encode(), &chain).await.unwrap();
        assert_eq!(outcome, RoundOutcome::Relayed { signed: true });
        assert!(node.sessions().has(11));

        let relayed = node.relay().relayed(11);
        assert_eq!(relayed.len(), 1);
        let (exclude, sent) = &relayed[0];
        assert_eq!(*exclude, None);
        assert_eq!(sent.signers_short_ids.len(), 3);
        assert_eq!(sent.signers_short_ids[2], compute_short_id(11, &keys(DEFAULT_FEDERATION_SIZE)[3]));
        assert_ne!(sent.psbt, msg.psbt);
        assert_eq!(sent.block_template, msg.block_template);
    }

    #[tokio::test]
    async fn test_already_signed_dropped() {
        let node = member(3, 10);
        let chain = MemoryChain::new();
        let msg = round(11, &[1, 3], 10);

        let outcome = node.handle(PEER, &msg.encode(), &chain).await.unwrap();
        assert_eq!(outcome, RoundOutcome::AlreadyComplete);
        assert_eq!(node.relay().relayed_count(), 0);
    }

    #[tokio::test]
    async fn test_no_double_contribution_across_branches() {
        let node = member(3, 10);
        let chain = MemoryChain::new();

        // Two gossip branches of the same round, neither listing us
        let first = round(12, &[1], 10);
        let second = round(12, &[2], 10);

        let a = node.handle(PEER, &first.encode(), &chain).await.unwrap();
        let b = node.handle(PEER + 1, &second.encode(), &chain).await.unwrap();

        assert_eq!(a, RoundOutcome::Relayed { signed: true });
        assert_eq!(b, RoundOutcome::Relayed { signed: false });

        let relayed = node.relay().relayed(12);
        assert_eq!(relayed[1].0, Some(PEER + 1));
        assert_eq!(relayed[1].1, second);
    }

    #[tokio::test]
    async fn test_failed_signing_relays_unsigned() {
        let keys = keys(DEFAULT_FEDERATION_SIZE);
        let resolver = StaticFederation::new(FederationSnapshot::member(keys.clone(), keys[4].clone()));
        let node = RoundProcessor::new(
            Arc::new(resolver),
            MemorySigner::failing(keys[4].clone()),
            MemoryRelay::new(),
        );
        let chain = MemoryChain::new();
        let msg = round(13, &[1], 10);

        let outcome = node.handle(PEER, &msg.encode(), &chain).await.unwrap();
        assert_eq!(outcome, RoundOutcome::Relayed { signed: false });
        assert!(!node.sessions().get(13).unwrap().contributed);
        assert_eq!(node.relay().relayed(13)[0], (Some(PEER), msg));
    }

    #[tokio::test]
    async fn test_observer_relays_without_signing() {
        let node = observer();
        let chain = MemoryChain::new();
        let msg = round(14, &[1, 2, 3], 10);

        let outcome = node.handle(PEER, &msg.encode(), &chain).await.unwrap();
        assert_eq!(outcome, RoundOutcome::Relayed { signed: false });
        assert_eq!(node.relay().relayed(14), vec![(Some(PEER), msg)]);
    }

    #[tokio::test]
    async fn test_unconfigured_node_relays_best_effort() {
        let node = RoundProcessor::new(
            Arc::new(StaticFederation::unconfigured()),
            MemorySigner::failing(vec![]),
            MemoryRelay::new(),
        );
        let chain = MemoryChain::new();
        let mut msg = RoundMessage::new(15, b"test_psbt_data".to_vec(), b"test_block_template".to_vec());
        msg.signers_short_ids = vec![1, 2, 3];

        let outcome = node.handle(PEER, &msg.encode(), &chain).await.unwrap();
        assert_eq!(outcome, RoundOutcome::RelayedUnvalidated);
        assert!(node.sessions().is_empty());
        assert_eq!(node.relay().relayed(15), vec![(Some(PEER), msg)]);
    }

    #[tokio::test]
    async fn test_threshold_without_final_psbt_keeps_relaying() {
        let node = observer();
        let chain = MemoryChain::new();
        // Ten ids advertised but signatures never finalized the input
        let msg = round(16, &(0..10).collect::<Vec<_>>(), usize::MAX);

        let outcome = node.handle(PEER, &msg.encode(), &chain).await.unwrap();
        assert_eq!(outcome, RoundOutcome::Relayed { signed: false });
        assert!(chain.blocks().is_empty());
        assert!(node.sessions().has(16));
    }

    #[tokio::test]
    async fn test_last_signer_publishes_block() {
        let node = member(9, 10);
        let chain = MemoryChain::new();

        // Unrelated in-flight rounds that become stale
        node.sessions().start(1000);
        node.sessions().start(1001);

        let msg = round(17, &(0..9).collect::<Vec<_>>(), 10);
        let outcome = node.handle(PEER, &msg.encode(), &chain).await.unwrap();

        let RoundOutcome::BlockSubmitted { hash, new_tip } = outcome else {
            panic!("expected block submission, got {:?}", outcome);
        };
        assert!(new_tip);
        assert!(node.sessions().is_empty());
        assert_eq!(node.relay().relayed_count(), 0);

        let blocks = chain.blocks();
        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(block.block_hash(), hash);
        assert!(block.check_merkle_root());
        assert!(check_proof_of_work(&block.header, Target::MAX_ATTAINABLE_REGTEST));

        // The commitment output carries the ten-signature solution
        let script = block.txdata[0].output[1].script_pubkey.as_bytes();
        let at = script.windows(4).position(|w| w == &SIGNET_HEADER[..]).unwrap();
        let solution = decode_solution(&script[at + 4..]).unwrap();
        assert_eq!(solution.witness.len(), 10);
        assert!(solution.script_sig.is_empty());
    }

    #[tokio::test]
    async fn test_observer_finalizes_complete_round() {
        let node = observer();
        let chain = MemoryChain::new();
        let msg = round(18, &(20..30).collect::<Vec<_>>(), 10);

        let outcome = node.handle(PEER, &msg.encode(), &chain).await.unwrap();
        assert!(matches!(outcome, RoundOutcome::BlockSubmitted { new_tip: true, .. }));
        assert_eq!(chain.blocks().len(), 1);
    }

    #[tokio::test]
    async fn test_member_publishes_complete_round_unchanged() {
        let msg = round(25, &(0..10).collect::<Vec<_>>(), 10);

        let observer_chain = MemoryChain::new();
        let observed = observer().handle(PEER, &msg.encode(), &observer_chain).await.unwrap();

        let member_chain = MemoryChain::new();
        let node = member(50, 10);
        let published = node.handle(PEER, &msg.encode(), &member_chain).await.unwrap();

        let (
            RoundOutcome::BlockSubmitted { hash: a, .. },
            RoundOutcome::BlockSubmitted { hash: b, .. },
        ) = (observed, published)
        else {
            panic!("both nodes should submit");
        };
        assert_eq!(a, b);
        assert_eq!(
            encode::serialize(&observer_chain.blocks()[0]),
            encode::serialize(&member_chain.blocks()[0])
        );
        assert_eq!(node.relay().relayed_count(), 0);
    }

    #[tokio::test]
    async fn test_identical_rounds_produce_identical_blocks() {
        let chain = MemoryChain::new();
        let msg = round(19, &(0..10).collect::<Vec<_>>(), 10);

        let first = observer().handle(PEER, &msg.encode(), &chain).await.unwrap();
        let second = observer().handle(PEER, &msg.encode(), &chain).await.unwrap();

        let (
            RoundOutcome::BlockSubmitted { hash: a, new_tip: true },
            RoundOutcome::BlockSubmitted { hash: b, new_tip: false },
        ) = (first, second)
        else {
            panic!("both nodes should submit");
        };
        assert_eq!(a, b);
        assert_eq!(chain.blocks().len(), 1);
    }

    #[tokio::test]
    async fn test_template_without_commitment_ends_round() {
        let node = observer();
        let chain = MemoryChain::new();
        let mut msg = round(20, &(0..10).collect::<Vec<_>>(), 10);
        let mut block = template();
        block.txdata[0].output.pop();
        msg.block_template = encode::serialize(&block);

        node.sessions().start(21);
        let result = node.handle(PEER, &msg.encode(), &chain).await;

        assert!(matches!(result, Err(Error::NoWitnessCommitment)));
        assert!(!node.sessions().has(20));
        assert!(node.sessions().has(21));
        assert!(chain.blocks().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_template_ends_round() {
        let node = observer();
        let chain = MemoryChain::new();
        let mut msg = round(22, &(0..10).collect::<Vec<_>>(), 10);
        msg.block_template = b"test_block_template".to_vec();

        let result = node.handle(PEER, &msg.encode(), &chain).await;
        assert!(matches!(result, Err(Error::MalformedTemplate(_))));
        assert!(!node.sessions().has(22));
    }

    #[tokio::test]
    async fn test_rejected_block_keeps_sessions() {
        let node = observer();
        let chain = MemoryChain::new();
        chain.reject_all();
        node.sessions().start(1000);

        let msg = round(23, &(0..10).collect::<Vec<_>>(), 10);
        let result = node.handle(PEER, &msg.encode(), &chain).await;

        assert!(matches!(result, Err(Error::BlockSubmissionFailure(_))));
        assert!(node.sessions().has(1000));
        assert!(node.sessions().has(23));
    }

    #[tokio::test]
    async fn test_process_swallows_errors() {
        let node = member(0, 10);
        let chain = MemoryChain::new();

        node.process(PEER, &[0xff], &chain).await;
        node.process(PEER, &round(24, &[1], 10).encode(), &chain).await;

        assert_eq!(node.relay().relayed(24).len(), 1);
    }

    #[tokio::test]
    async fn test_initiate_single_key_round() {
        // Threshold one: the initiator alone completes the spend
        let node = member(0, 1);
        let chain = MemoryChain::new();

        let (msg, outcome) = node
            .initiate(spending_psbt().serialize(), encode::serialize(&template()), &chain)
            .await
            .unwrap();

        assert_eq!(msg.signers_short_ids, vec![compute_short_id(msg.nonce, &keys(DEFAULT_FEDERATION_SIZE)[0])]);
        assert!(matches!(outcome, RoundOutcome::BlockSubmitted { .. }));
        assert_eq!(chain.blocks().len(), 1);
        assert!(node.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_initiate_relays_to_all_peers() {
        let node = member(0, 10);
        let chain = MemoryChain::new();

        let (msg, outcome) = node
            .initiate(spending_psbt().serialize(), encode::serialize(&template()), &chain)
            .await
            .unwrap();

        assert_eq!(outcome, RoundOutcome::Relayed { signed: true });
        assert!(node.sessions().get(msg.nonce).unwrap().contributed);
        assert_eq!(node.relay().relayed(msg.nonce), vec![(None, msg)]);
    }

    #[tokio::test]
    async fn test_initiate_requires_federation() {
        let node = RoundProcessor::new(
            Arc::new(StaticFederation::unconfigured()),
            MemorySigner::failing(vec![]),
            MemoryRelay::new(),
        );
        let chain = MemoryChain::new();

        assert!(matches!(
            node.initiate(vec![], vec![], &chain).await,
            Err(Error::NoFederationConfigured)
        ));
    }

    #[tokio::test]
    async fn test_gossip_converges_to_one_block() {
        // Ten members pass the round along a line; the last one publishes
        let chain = MemoryChain::new();
        let nodes: Vec<_> = (0..10).map(|i| member(i, 10)).collect();

        let (mut msg, _) = nodes[0]
            .initiate(spending_psbt().serialize(), encode::serialize(&template()), &chain)
            .await
            .unwrap();

        for (i, node) in nodes.iter().enumerate().skip(1) {
            let outcome = node.handle(i as PeerId - 1, &msg.encode(), &chain).await.unwrap();
            if i < 9 {
                assert_eq!(outcome, RoundOutcome::Relayed { signed: true });
                msg = node.relay().relayed(msg.nonce).pop().unwrap().1;
                assert_eq!(msg.signers_short_ids.len(), i + 1);
            } else {
                assert!(matches!(outcome, RoundOutcome::BlockSubmitted { new_tip: true, .. }));
            }
        }

        assert_eq!(chain.blocks().len(), 1);
    }
}
