//! Core types for signet signing rounds

use bitcoin::consensus::encode::{self, Decodable, Encodable, VarInt};
use bitcoin::io::{self, Read, Write};
use serde::{Deserialize, Serialize};

/// Transport-assigned identifier of a connected peer
pub type PeerId = u64;

/// Round-scoped pseudonym of a federation member
pub type ShortId = u64;

/// Serialized federation public key (33-byte compressed or 32-byte x-only)
pub type FederationKey = Vec<u8>;

/// One signing attempt as it travels the gossip network.
///
/// Encoded on the wire as
/// `nonce (u64 LE) | psbt (varint + bytes) | block_template (varint + bytes) | signers (varint + u64 LE*)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundMessage {
    /// Round identifier, chosen by the initiator; also the short id key
    pub nonce: u64,
    /// Current, possibly partially signed, PSBT
    #[serde(with = "hex_bytes")]
    pub psbt: Vec<u8>,
    /// Candidate block the PSBT solution is destined for
    #[serde(with = "hex_bytes")]
    pub block_template: Vec<u8>,
    /// Short ids of every member that has contributed so far
    pub signers_short_ids: Vec<ShortId>,
}

impl RoundMessage {
    /// Create a message with no contributors yet
    pub fn new(nonce: u64, psbt: Vec<u8>, block_template: Vec<u8>) -> Self {
        Self {
            nonce,
            psbt,
            block_template,
            signers_short_ids: Vec::new(),
        }
    }

    /// Start a fresh round with a random nonce
    pub fn initiate(psbt: Vec<u8>, block_template: Vec<u8>) -> Self {
        Self::new(rand::random(), psbt, block_template)
    }

    /// Replace the PSBT with a locally signed one and record our short id.
    ///
    /// An id that is already listed is not appended again.
    pub fn with_contribution(mut self, psbt: Vec<u8>, short_id: ShortId) -> Self {
        self.psbt = psbt;
        if !self.signers_short_ids.contains(&short_id) {
            self.signers_short_ids.push(short_id);
        }
        self
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        encode::serialize(self)
    }

    /// Deserialize from wire bytes; trailing data is an error
    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        Ok(encode::deserialize(bytes)?)
    }
}

impl Encodable for RoundMessage {
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = self.nonce.consensus_encode(writer)?;
        len += self.psbt.consensus_encode(writer)?;
        len += self.block_template.consensus_encode(writer)?;
        len += VarInt(self.signers_short_ids.len() as u64).consensus_encode(writer)?;
        for id in &self.signers_short_ids {
            len += id.consensus_encode(writer)?;
        }
        Ok(len)
    }
}

impl Decodable for RoundMessage {
    fn consensus_decode_from_finite_reader<R: Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, encode::Error> {
        let nonce = u64::consensus_decode_from_finite_reader(reader)?;
        let psbt = Vec::<u8>::consensus_decode_from_finite_reader(reader)?;
        let block_template = Vec::<u8>::consensus_decode_from_finite_reader(reader)?;

        // The reader is bounded, so a lying count fails on EOF instead of allocating
        let count = VarInt::consensus_decode_from_finite_reader(reader)?.0;
        let mut signers_short_ids = Vec::new();
        for _ in 0..count {
            signers_short_ids.push(u64::consensus_decode_from_finite_reader(reader)?);
        }

        Ok(Self {
            nonce,
            psbt,
            block_template,
            signers_short_ids,
        })
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
