//! # Signet Core
//!
//! Round processing for a federated signet where 10 of 100 federation
//! members jointly sign every block.
//!
//! A signing round travels the gossip network as a [`RoundMessage`]: a
//! partially signed transaction (PSBT) spending the signet challenge, the
//! block template it commits to, and the short ids of every member that has
//! already contributed. This crate provides:
//! - Round-scoped short ids for federation keys
//! - Per-round session bookkeeping
//! - Validation of advertised contributors
//! - Embedding of the finalized solution into the coinbase
//! - The proof-of-work search for the finished block
//!
//! ## Example
//!
//! ```rust,ignore
//! use signet_core::{round::RoundProcessor, FederationConfig};
//! use std::sync::Arc;
//!
//! let config = FederationConfig::load("federation.json")?;
//! let processor = RoundProcessor::new(Arc::new(config.resolver()?), signer, relay)
//!     .with_threshold(config.threshold);
//!
//! // Feed every inbound `signetpsbt` payload to the processor
//! processor.process(peer_id, &payload, &chain).await;
//! ```

pub mod block;
pub mod config;
pub mod error;
pub mod federation;
pub mod round;
pub mod session;
pub mod types;

pub use config::FederationConfig;
pub use error::{Error, Result};
pub use types::{FederationKey, PeerId, RoundMessage, ShortId};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Number of distinct contributors needed to finalize a round
pub const DEFAULT_THRESHOLD: usize = 10;

/// Number of federation members
pub const DEFAULT_FEDERATION_SIZE: usize = 100;
