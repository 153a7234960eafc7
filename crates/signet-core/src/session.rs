//! Signing session bookkeeping
//!
//! One session per round nonce this node has observed or initiated. Sessions
//! end individually when a round is abandoned, or all at once when a block is
//! found and every in-flight template has become stale.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Local state of one signing round
#[derive(Debug, Clone)]
pub struct SigningSession {
    /// Round messages seen for this nonce
    pub observations: u32,
    /// Whether this node has contributed a signature
    pub contributed: bool,
    /// First time the round was seen
    pub started_at: DateTime<Utc>,
}

impl Default for SigningSession {
    fn default() -> Self {
        Self {
            observations: 0,
            contributed: false,
            started_at: Utc::now(),
        }
    }
}

/// Shared table of active signing sessions keyed by round nonce
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<u64, SigningSession>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark round `nonce` active; repeated starts only bump the observation count
    pub fn start(&self, nonce: u64) {
        let observations = {
            let mut session = self.sessions.entry(nonce).or_default();
            session.observations += 1;
            session.observations
        };

        if observations == 1 {
            info!(nonce, total = self.sessions.len(), "Signing session started");
        }
    }

    /// End round `nonce`; absent rounds are ignored
    pub fn end(&self, nonce: u64) {
        if self.sessions.remove(&nonce).is_some() {
            info!(nonce, remaining = self.sessions.len(), "Signing session ended");
        }
    }

    /// Drop every active session, returning how many were dropped
    pub fn surrender_all(&self) -> usize {
        let mut dropped = 0;
        self.sessions.retain(|_, _| {
            dropped += 1;
            false
        });
        info!(dropped, "All signing sessions surrendered");
        dropped
    }

    /// Whether round `nonce` is active
    pub fn has(&self, nonce: u64) -> bool {
        self.sessions.contains_key(&nonce)
    }

    /// Snapshot of a session
    pub fn get(&self, nonce: u64) -> Option<SigningSession> {
        self.sessions.get(&nonce).map(|entry| entry.value().clone())
    }

    /// Atomically claim the right to contribute to round `nonce`.
    ///
    /// Returns `false` if this node already contributed, so two messages for
    /// the same round racing through the processor never both sign.
    pub fn try_claim_contribution(&self, nonce: u64) -> bool {
        let mut session = self.sessions.entry(nonce).or_default();
        if session.contributed {
            return false;
        }
        session.contributed = true;
        true
    }

    /// Undo a claim after the local signing step failed
    pub fn release_contribution(&self, nonce: u64) {
        if let Some(mut session) = self.sessions.get_mut(&nonce) {
            session.contributed = false;
        }
    }

    /// Number of active sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is active
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
