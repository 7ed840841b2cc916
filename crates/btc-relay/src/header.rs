//! Binary block header codec.

use bitcoin::block::Header as BlockHeader;
use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use num_bigint::BigUint;

use crate::error::RelayError;

/// Size of a serialized block header
pub const HEADER_SIZE: usize = 80;

/// Parse a raw 80-byte block header (six little-endian fields).
pub fn parse_header(bytes: &[u8]) -> Result<BlockHeader, RelayError> {
    if bytes.len() != HEADER_SIZE {
        return Err(RelayError::InvalidHeaderSize(bytes.len()));
    }
    encode::deserialize(bytes).map_err(|_| RelayError::InvalidHeaderSize(bytes.len()))
}

/// Serialize a block header into its 80-byte consensus form.
pub fn serialize_header(header: &BlockHeader) -> [u8; HEADER_SIZE] {
    let mut raw = [0u8; HEADER_SIZE];
    raw.copy_from_slice(&encode::serialize(header));
    raw
}

/// Double SHA-256 of the serialized header
pub fn header_hash(header: &BlockHeader) -> BlockHash {
    header.block_hash()
}

/// Interpret a block hash as a little-endian 256-bit integer, for target comparisons.
pub fn hash_to_uint(hash: &BlockHash) -> BigUint {
    BigUint::from_bytes_le(hash.as_byte_array())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    // Mainnet block #1
    const BLOCK_1: &str = "010000006fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000982051fd1e4ba744bbbe680e1fee14677ba1a3c3540bf7b1cdb606e857233e0e61bc6649ffff001d01e36299";

    #[test]
    fn test_parse_mainnet_header() {
        let raw = hex::decode(BLOCK_1).unwrap();
        let header = parse_header(&raw).unwrap();

        assert_eq!(header.version.to_consensus(), 1);
        assert_eq!(header.time, 1231469665);
        assert_eq!(header.bits.to_consensus(), 0x1d00ffff);
        assert_eq!(header.nonce, 2573394689);
        assert_eq!(
            header.prev_blockhash,
            BlockHash::from_str("000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f")
                .unwrap()
        );
        assert_eq!(
            header_hash(&header),
            BlockHash::from_str("00000000839a8e6886ab5951d76f411475428afc90947ee320161bbf18eb6048")
                .unwrap()
        );
    }

    #[test]
    fn test_serialize_round_trip() {
        let raw = hex::decode(BLOCK_1).unwrap();
        let header = parse_header(&raw).unwrap();
        let serialized = serialize_header(&header);
        assert_eq!(serialized.len(), HEADER_SIZE);
        assert_eq!(serialized.as_slice(), raw.as_slice());
        assert_eq!(parse_header(&serialized).unwrap(), header);
    }

    #[test]
    fn test_invalid_size() {
        let raw = hex::decode(BLOCK_1).unwrap();
        assert_eq!(
            parse_header(&raw[..79]),
            Err(RelayError::InvalidHeaderSize(79))
        );
        let mut long = raw.clone();
        long.push(0);
        assert_eq!(parse_header(&long), Err(RelayError::InvalidHeaderSize(81)));
        assert_eq!(parse_header(&[]), Err(RelayError::InvalidHeaderSize(0)));
    }

    #[test]
    fn test_hash_meets_its_target() {
        let raw = hex::decode(BLOCK_1).unwrap();
        let header = parse_header(&raw).unwrap();
        let target = crate::work::target_from_bits(header.bits.to_consensus()).unwrap();
        assert!(hash_to_uint(&header_hash(&header)) <= target);
    }
}
