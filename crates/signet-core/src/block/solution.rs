//! Signet solution extraction and coinbase embedding

use bitcoin::consensus::encode::{self, Decodable, Encodable};
use bitcoin::io::{self, Read, Write};
use bitcoin::psbt::Psbt;
use bitcoin::script::PushBytesBuf;
use bitcoin::{Block, ScriptBuf, Transaction, Witness};
use thiserror::Error;

/// Marker of the witness commitment push in the coinbase
pub const WITNESS_COMMITMENT_HEADER: [u8; 4] = [0xaa, 0x21, 0xa9, 0xed];

/// Marker preceding the signet solution push
pub const SIGNET_HEADER: [u8; 4] = [0xec, 0xc7, 0xda, 0xa2];

/// OP_RETURN, push 36, commitment header, 32-byte commitment
const MINIMUM_WITNESS_COMMITMENT: usize = 38;

const OP_RETURN: u8 = 0x6a;
const OP_PUSHBYTES_36: u8 = 0x24;

/// Failure to embed a solution; the block is left untouched
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmbedError {
    /// Block has no transactions
    #[error("block has no coinbase transaction")]
    NoCoinbase,
    /// Coinbase has no witness commitment output
    #[error("coinbase has no witness commitment")]
    NoCommitment,
    /// Solution does not fit a single script push
    #[error("solution of {0} bytes does not fit a script push")]
    SolutionTooLarge(usize),
}

impl From<EmbedError> for crate::Error {
    fn from(e: EmbedError) -> Self {
        match e {
            EmbedError::NoCommitment => crate::Error::NoWitnessCommitment,
            other => crate::Error::MalformedTemplate(other.to_string()),
        }
    }
}

/// Final unlocking data of the signet challenge spend.
///
/// Serialized as `script_sig (varint + bytes) | witness (varint count + (varint + bytes)*)`,
/// the layout signet validation reads back out of the coinbase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignetSolution {
    pub script_sig: ScriptBuf,
    pub witness: Witness,
}

impl SignetSolution {
    /// Take the final fields of the PSBT's only input
    pub fn from_psbt(psbt: &Psbt) -> crate::Result<Self> {
        let input = psbt
            .inputs
            .first()
            .ok_or_else(|| crate::Error::PsbtNotFinalizable("PSBT has no inputs".into()))?;

        Ok(Self {
            script_sig: input.final_script_sig.clone().unwrap_or_default(),
            witness: input.final_script_witness.clone().unwrap_or_default(),
        })
    }
}

impl Encodable for SignetSolution {
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = self.script_sig.consensus_encode(writer)?;
        len += self.witness.consensus_encode(writer)?;
        Ok(len)
    }
}

impl Decodable for SignetSolution {
    fn consensus_decode_from_finite_reader<R: Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, encode::Error> {
        Ok(Self {
            script_sig: ScriptBuf::consensus_decode_from_finite_reader(reader)?,
            witness: Witness::consensus_decode_from_finite_reader(reader)?,
        })
    }
}

/// Serialize the solution carried by a finalized PSBT
pub fn extract_solution(psbt: &Psbt) -> crate::Result<Vec<u8>> {
    Ok(encode::serialize(&SignetSolution::from_psbt(psbt)?))
}

/// Parse solution bytes back into script and witness
pub fn decode_solution(bytes: &[u8]) -> crate::Result<SignetSolution> {
    encode::deserialize(bytes).map_err(|e| crate::Error::MalformedTemplate(e.to_string()))
}

/// Index of the coinbase output holding the witness commitment.
///
/// When several outputs match, the last one is the commitment.
pub fn witness_commitment_index(coinbase: &Transaction) -> Option<usize> {
    coinbase.output.iter().rposition(|out| {
        let script = out.script_pubkey.as_bytes();
        script.len() >= MINIMUM_WITNESS_COMMITMENT
            && script[0] == OP_RETURN
            && script[1] == OP_PUSHBYTES_36
            && script[2..6] == WITNESS_COMMITMENT_HEADER
    })
}

/// Append `SIGNET_HEADER || solution` to the commitment output and refresh the merkle root
pub fn embed_solution(block: &mut Block, solution: &[u8]) -> Result<(), EmbedError> {
    let coinbase = block.txdata.first().ok_or(EmbedError::NoCoinbase)?;
    let index = witness_commitment_index(coinbase).ok_or(EmbedError::NoCommitment)?;

    let payload = [&SIGNET_HEADER[..], solution].concat();
    let push = PushBytesBuf::try_from(payload)
        .map_err(|_| EmbedError::SolutionTooLarge(solution.len()))?;

    let mut coinbase = coinbase.clone();
    coinbase.output[index].script_pubkey.push_slice(push);
    block.txdata[0] = coinbase;

    // txdata is non-empty, so the root always exists
    if let Some(root) = block.compute_merkle_root() {
        block.header.merkle_root = root;
    }
    Ok(())
}
