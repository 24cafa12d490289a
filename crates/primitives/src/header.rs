//! The 80-byte block header and its proof-of-work checked codec.

use std::fmt;

use chaintip_consensus::{hash256_to_hex, Hash256};
use chaintip_pow::{compact_to_u256, hash_meets_target, CompactError};

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;

pub const HEADER_SIZE: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// The input was not exactly 80 bytes.
    WrongLength(usize),
    Decode(DecodeError),
    /// The compact bits field could not be decoded into a target.
    BadTarget(CompactError),
    /// The header hash exceeds its own declared target.
    InvalidProofOfWork,
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderError::WrongLength(len) => {
                write!(f, "block header must be {HEADER_SIZE} bytes, got {len}")
            }
            HeaderError::Decode(err) => write!(f, "{err}"),
            HeaderError::BadTarget(err) => write!(f, "{err}"),
            HeaderError::InvalidProofOfWork => write!(f, "header hash exceeds target"),
        }
    }
}

impl std::error::Error for HeaderError {}

impl From<DecodeError> for HeaderError {
    fn from(err: DecodeError) -> Self {
        HeaderError::Decode(err)
    }
}

impl From<CompactError> for HeaderError {
    fn from(err: CompactError) -> Self {
        HeaderError::BadTarget(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Parse exactly 80 bytes, verifying proof-of-work unless `skip_pow`.
    ///
    /// `skip_pow` exists for tests and for reloading headers already accepted
    /// to disk; network input is always checked.
    pub fn parse(bytes: &[u8], skip_pow: bool) -> Result<Self, HeaderError> {
        if bytes.len() != HEADER_SIZE {
            return Err(HeaderError::WrongLength(bytes.len()));
        }
        let mut decoder = Decoder::new(bytes);
        let header = Self::consensus_decode_from(&mut decoder)?;
        if !skip_pow {
            header.verify_pow()?;
        }
        Ok(header)
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_hash: decoder.read_hash()?,
            merkle_root: decoder.read_hash()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }

    pub fn consensus_encode_to(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev_hash);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }

    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        self.consensus_encode_to(&mut encoder);
        let bytes = encoder.into_inner();
        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&bytes);
        out
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.serialize())
    }

    /// Display-order hex of the header hash.
    pub fn hash_hex(&self) -> String {
        hash256_to_hex(&self.hash())
    }

    pub fn verify_pow(&self) -> Result<(), HeaderError> {
        let target = compact_to_u256(self.bits)?;
        if !hash_meets_target(&self.hash(), &target) {
            return Err(HeaderError::InvalidProofOfWork);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaintip_consensus::params::{chain_params, Network};

    #[test]
    fn genesis_round_trips_and_hashes() {
        let params = chain_params(Network::Mainnet);
        let header = BlockHeader::parse(&params.genesis_header, false).expect("genesis parses");
        assert_eq!(header.version, 1);
        assert_eq!(header.prev_hash, [0u8; 32]);
        assert_eq!(header.time, 1_231_006_505);
        assert_eq!(header.bits, 0x1d00_ffff);
        assert_eq!(header.nonce, 2_083_236_893);
        assert_eq!(
            header.hash_hex(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert_eq!(header.serialize(), params.genesis_header);
    }

    #[test]
    fn corrupted_nonce_fails_pow_but_parses_with_skip() {
        let params = chain_params(Network::Mainnet);
        let mut bytes = params.genesis_header;
        bytes[76] ^= 0x01;
        assert_eq!(
            BlockHeader::parse(&bytes, false),
            Err(HeaderError::InvalidProofOfWork)
        );
        let header = BlockHeader::parse(&bytes, true).expect("skip_pow parses");
        assert_ne!(header.nonce, 2_083_236_893);
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert_eq!(
            BlockHeader::parse(&[0u8; 79], true),
            Err(HeaderError::WrongLength(79))
        );
        assert_eq!(
            BlockHeader::parse(&[0u8; 81], true),
            Err(HeaderError::WrongLength(81))
        );
    }

    #[test]
    fn testnet_and_regtest_genesis_satisfy_pow() {
        for network in [Network::Testnet, Network::Regtest] {
            let params = chain_params(network);
            BlockHeader::parse(&params.genesis_header, false).expect("genesis pow holds");
        }
    }
}
