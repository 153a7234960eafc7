//! Federation membership
//!
//! The set of keys entitled to sign is resolved outside this crate (from a
//! descriptor, a config file, ...). The round logic only ever sees a
//! [`FederationSnapshot`] handed out by a [`SignerSetResolver`].

mod short_id;
mod validator;

pub use short_id::{compute_short_id, federation_short_ids};
pub use validator::{distinct_signers, Decision, RejectReason, RoundValidator};

use crate::FederationKey;

/// Federation keys as seen at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederationSnapshot {
    /// Every key entitled to contribute
    pub keys: Vec<FederationKey>,
    /// Key this node signs with, if it is a member
    pub local_key: Option<FederationKey>,
}

impl FederationSnapshot {
    /// Snapshot for a node that only observes and relays
    pub fn observer(keys: Vec<FederationKey>) -> Self {
        Self {
            keys,
            local_key: None,
        }
    }

    /// Snapshot for a node holding one of the federation keys
    pub fn member(keys: Vec<FederationKey>, local_key: FederationKey) -> Self {
        Self {
            keys,
            local_key: Some(local_key),
        }
    }
}

/// Supplies the current federation key set.
///
/// Returning `None` means no federation is configured; the node can then
/// neither validate contributors nor sign.
pub trait SignerSetResolver: Send + Sync {
    /// Resolve the current federation
    fn resolve(&self) -> Option<FederationSnapshot>;
}

/// Resolver over a fixed, pre-loaded key set
#[derive(Debug, Clone)]
pub struct StaticFederation {
    snapshot: Option<FederationSnapshot>,
}

impl StaticFederation {
    /// Create a resolver that always returns `snapshot`
    pub fn new(snapshot: FederationSnapshot) -> Self {
        Self {
            snapshot: Some(snapshot),
        }
    }

    /// Create a resolver for a node without any federation configured
    pub fn unconfigured() -> Self {
        Self { snapshot: None }
    }
}

impl SignerSetResolver for StaticFederation {
    fn resolve(&self) -> Option<FederationSnapshot> {
        self.snapshot.clone()
    }
}
