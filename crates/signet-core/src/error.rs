//! Error types for signet round processing

use crate::ShortId;
use thiserror::Error;

/// Result type alias for signet operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while processing a signing round
#[derive(Debug, Error)]
pub enum Error {
    /// Wire message could not be decoded
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Message advertises a short id outside the federation
    #[error("Unknown signer short id: {0:#018x}")]
    UnknownSigner(ShortId),

    /// No federation key set is available
    #[error("No federation configured")]
    NoFederationConfigured,

    /// Block template carries no witness commitment output
    #[error("Block template has no witness commitment")]
    NoWitnessCommitment,

    /// Block template could not be decoded or embedded into
    #[error("Malformed block template: {0}")]
    MalformedTemplate(String),

    /// PSBT bytes could not be decoded
    #[error("PSBT decode failed: {0}")]
    PsbtDecodeFailure(String),

    /// PSBT does not yet satisfy the spending script
    #[error("PSBT not finalizable: {0}")]
    PsbtNotFinalizable(String),

    /// Local signing step failed
    #[error("Contribution failed: {0}")]
    Contribution(String),

    /// The 32-bit nonce space was exhausted
    #[error("Proof of work exhausted for block {0}")]
    ProofOfWorkExhausted(String),

    /// Chain rejected the finished block
    #[error("Block submission failed: {0}")]
    BlockSubmissionFailure(String),

    /// Gossip relay error
    #[error("Relay error: {0}")]
    Relay(String),

    /// Invalid federation configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<bitcoin::consensus::encode::Error> for Error {
    fn from(e: bitcoin::consensus::encode::Error) -> Self {
        Error::MalformedMessage(e.to_string())
    }
}
