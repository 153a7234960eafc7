//! Contributor validation for inbound round messages

use super::{compute_short_id, federation_short_ids, FederationSnapshot, SignerSetResolver};
use crate::{RoundMessage, ShortId};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Why a round message was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No federation key set could be resolved
    NoFederation,
    /// The message lists an id no federation key maps to in this round
    UnknownSigner(ShortId),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NoFederation => write!(f, "no federation configured"),
            RejectReason::UnknownSigner(id) => write!(f, "unknown signer {:#018x}", id),
        }
    }
}

/// Validator verdict for one round message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Drop the message
    Reject(RejectReason),
    /// All contributors are members and our own id is not listed
    Eligible,
    /// Our own id is already listed; nothing left for this node to add
    AlreadyComplete,
}

/// Number of distinct short ids in the message.
///
/// Duplicated ids (including in-round collisions) count once.
pub fn distinct_signers(msg: &RoundMessage) -> usize {
    msg.signers_short_ids.iter().collect::<HashSet<_>>().len()
}

/// Judges round messages against the current federation
#[derive(Clone)]
pub struct RoundValidator {
    resolver: Arc<dyn SignerSetResolver>,
}

impl RoundValidator {
    /// Create a validator backed by `resolver`
    pub fn new(resolver: Arc<dyn SignerSetResolver>) -> Self {
        Self { resolver }
    }

    /// Resolve the federation once; callers keep the snapshot for the whole message
    pub fn snapshot(&self) -> Option<FederationSnapshot> {
        self.resolver.resolve()
    }

    /// Classify `msg` against a federation snapshot
    pub fn validate(msg: &RoundMessage, federation: Option<&FederationSnapshot>) -> Decision {
        let Some(federation) = federation else {
            return Decision::Reject(RejectReason::NoFederation);
        };

        if let Err(reason) = Self::validate_signers(msg, federation) {
            return Decision::Reject(reason);
        }

        if Self::have_signed(msg, Some(federation)) {
            Decision::AlreadyComplete
        } else {
            Decision::Eligible
        }
    }

    /// Check every advertised id is derivable from the federation for this nonce
    pub fn validate_signers(
        msg: &RoundMessage,
        federation: &FederationSnapshot,
    ) -> Result<(), RejectReason> {
        let valid = federation_short_ids(msg.nonce, &federation.keys);
        match msg.signers_short_ids.iter().find(|id| !valid.contains(id)) {
            Some(unknown) => Err(RejectReason::UnknownSigner(*unknown)),
            None => Ok(()),
        }
    }

    /// Whether our own short id for this round is listed in `msg`
    pub fn have_signed(msg: &RoundMessage, federation: Option<&FederationSnapshot>) -> bool {
        match Self::our_short_id(msg.nonce, federation) {
            Some(ours) => msg.signers_short_ids.contains(&ours),
            None => false,
        }
    }

    /// Our short id for round `nonce`, if this node holds a federation key
    pub fn our_short_id(nonce: u64, federation: Option<&FederationSnapshot>) -> Option<ShortId> {
        federation?
            .local_key
            .as_deref()
            .map(|key| compute_short_id(nonce, key))
    }
}
