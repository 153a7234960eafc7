//! Flood-fill relay for round messages
//!
//! Every round message is forwarded to every connected peer except the one
//! it came from. Wire bytes are remembered for a while so a message that
//! travels back around the mesh is dropped instead of being processed and
//! forwarded again. Peers that send invalid rounds accumulate misbehaviour
//! score and are banned past a threshold.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use signet_core::round::Relay;
use signet_core::{PeerId, RoundMessage};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Score added per penalty
pub const PENALTY_SCORE: u32 = 10;

/// Score at which a peer is banned
pub const DEFAULT_BAN_SCORE: u32 = 100;

/// Messages queued per peer before the oldest is dropped
pub const DEFAULT_MAX_QUEUE: usize = 1024;

/// Relay error types
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),
    #[error("Peer banned: {0}")]
    Banned(PeerId),
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

impl From<RelayError> for signet_core::Error {
    fn from(e: RelayError) -> Self {
        signet_core::Error::Relay(e.to_string())
    }
}

/// Hex blake3 digest of wire bytes
pub fn message_digest(bytes: &[u8]) -> String {
    hex::encode(blake3::hash(bytes).as_bytes())
}

/// Recently seen wire messages
#[derive(Clone)]
pub struct SeenCache {
    /// digest -> expiry
    entries: Arc<DashMap<String, DateTime<Utc>>>,
    ttl_seconds: i64,
}

impl SeenCache {
    /// Create an empty cache remembering messages for `ttl_seconds`
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl_seconds,
        }
    }

    /// Record `bytes`; true if they were not seen within the TTL
    pub fn insert(&self, bytes: &[u8]) -> bool {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(self.ttl_seconds);

        let mut fresh = false;
        self.entries
            .entry(message_digest(bytes))
            .and_modify(|expiry| {
                if *expiry <= now {
                    fresh = true;
                }
                *expiry = expires_at;
            })
            .or_insert_with(|| {
                fresh = true;
                expires_at
            });
        fresh
    }

    /// Whether `bytes` were seen within the TTL
    pub fn contains(&self, bytes: &[u8]) -> bool {
        self.entries
            .get(&message_digest(bytes))
            .map(|expiry| *expiry > Utc::now())
            .unwrap_or(false)
    }

    /// Remove expired entries
    pub fn cleanup(&self) {
        let now = Utc::now();
        self.entries.retain(|_, expiry| *expiry > now);
    }

    /// Run [`SeenCache::cleanup`] every `period` on the tokio runtime
    pub fn spawn_cleanup(&self, period: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                cache.cleanup();
            }
        })
    }

    /// Number of remembered digests, expired ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new(600) // 10 minutes, about one signet block interval
    }
}

/// Connected peer state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Accumulated misbehaviour
    pub score: u32,
    /// Banned peers are neither read from nor written to
    pub banned: bool,
    /// Last inbound message
    pub last_seen: DateTime<Utc>,
}

impl PeerInfo {
    fn new() -> Self {
        Self {
            score: 0,
            banned: false,
            last_seen: Utc::now(),
        }
    }
}

/// In-process flood relay with per-peer outbound queues.
///
/// The network layer feeds inbound bytes through [`FloodRelay::accept_inbound`]
/// and drains each peer's queue with [`FloodRelay::drain`].
#[derive(Clone)]
pub struct FloodRelay {
    peers: Arc<DashMap<PeerId, PeerInfo>>,
    queues: Arc<DashMap<PeerId, VecDeque<Vec<u8>>>>,
    seen: SeenCache,
    ban_score: u32,
    max_queue: usize,
}

impl FloodRelay {
    /// Create a relay with no peers using `seen` for de-duplication
    pub fn new(seen: SeenCache) -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            queues: Arc::new(DashMap::new()),
            seen,
            ban_score: DEFAULT_BAN_SCORE,
            max_queue: DEFAULT_MAX_QUEUE,
        }
    }

    /// Set the misbehaviour score at which peers are banned
    pub fn with_ban_score(mut self, ban_score: u32) -> Self {
        self.ban_score = ban_score;
        self
    }

    /// Set the per-peer outbound queue bound
    pub fn with_max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue;
        self
    }

    /// Register a connected peer
    pub fn add_peer(&self, peer: PeerId) {
        self.peers.entry(peer).or_insert_with(PeerInfo::new);
        self.queues.entry(peer).or_default();
        info!(peer, "Peer connected");
    }

    /// Forget a disconnected peer and its queue
    pub fn remove_peer(&self, peer: PeerId) {
        self.peers.remove(&peer);
        self.queues.remove(&peer);
        info!(peer, "Peer disconnected");
    }

    /// Peers that are connected and not banned
    pub fn active_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|entry| !entry.banned)
            .map(|entry| *entry.key())
            .collect();
        peers.sort_unstable();
        peers
    }

    /// State of a connected peer
    pub fn peer_info(&self, peer: PeerId) -> Result<PeerInfo> {
        self.peers
            .get(&peer)
            .map(|entry| entry.value().clone())
            .ok_or(RelayError::UnknownPeer(peer))
    }

    /// Gate an inbound message; `Ok(true)` if it should be processed
    pub fn accept_inbound(&self, peer: PeerId, bytes: &[u8]) -> Result<bool> {
        {
            let mut info = self
                .peers
                .get_mut(&peer)
                .ok_or(RelayError::UnknownPeer(peer))?;
            if info.banned {
                return Err(RelayError::Banned(peer));
            }
            info.last_seen = Utc::now();
        }

        let fresh = self.seen.insert(bytes);
        if !fresh {
            debug!(peer, size = bytes.len(), "Dropping already seen message");
        }
        Ok(fresh)
    }

    /// Take everything queued for `peer`
    pub fn drain(&self, peer: PeerId) -> Vec<Vec<u8>> {
        self.queues
            .get_mut(&peer)
            .map(|mut queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    /// Number of messages waiting for `peer`
    pub fn queued(&self, peer: PeerId) -> usize {
        self.queues.get(&peer).map(|queue| queue.len()).unwrap_or(0)
    }

    /// De-duplication cache; spawn its cleanup alongside the relay
    pub fn seen(&self) -> &SeenCache {
        &self.seen
    }

    fn enqueue(&self, peer: PeerId, bytes: &[u8]) {
        if let Some(mut queue) = self.queues.get_mut(&peer) {
            if queue.len() >= self.max_queue {
                queue.pop_front();
                warn!(peer, max_queue = self.max_queue, "Outbound queue full, dropped oldest");
            }
            queue.push_back(bytes.to_vec());
        }
    }
}

impl Default for FloodRelay {
    fn default() -> Self {
        Self::new(SeenCache::default())
    }
}

#[async_trait]
impl Relay for FloodRelay {
    async fn relay(&self, from: Option<PeerId>, message: &RoundMessage) -> signet_core::Result<()> {
        let bytes = message.encode();
        // Our own output must not be processed again when it echoes back
        self.seen.insert(&bytes);

        let targets: Vec<PeerId> = self
            .active_peers()
            .into_iter()
            .filter(|peer| Some(*peer) != from)
            .collect();
        for peer in &targets {
            self.enqueue(*peer, &bytes);
        }

        debug!(
            nonce = message.nonce,
            signers = message.signers_short_ids.len(),
            peers = targets.len(),
            "Relayed round message"
        );
        Ok(())
    }

    async fn penalize(&self, peer: PeerId, reason: &str) {
        let Some(mut info) = self.peers.get_mut(&peer) else {
            return;
        };
        info.score = info.score.saturating_add(PENALTY_SCORE);
        warn!(peer, score = info.score, reason, "Peer misbehaving");

        if !info.banned && info.score >= self.ban_score {
            info.banned = true;
            drop(info);
            self.queues.remove(&peer);
            warn!(peer, "Peer banned");
        }
    }
}
