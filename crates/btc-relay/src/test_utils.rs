//! Helpers for building synthetic header chains in tests.
//!
//! Headers are mined in-process, so they are meant for the regtest pow limit or targets
//! of the same order of magnitude.

use bitcoin::block::{Header as BlockHeader, Version};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, CompactTarget, Network, TxMerkleNode};
use num_bigint::BigUint;

use crate::header::hash_to_uint;
use crate::params::ChainParams;
use crate::work::target_from_bits;

/// Regtest pow limit, as a compact target
pub const REGTEST_BITS: u32 = 0x207f_ffff;

/// Timestamp of the synthetic genesis header
pub const GENESIS_TIME: u32 = 1_600_000_000;

/// Default spacing between synthetic blocks
pub const BLOCK_SPACING: u32 = 600;

/// Regtest limits with retargeting switched on
pub fn regtest_params() -> ChainParams {
    ChainParams {
        no_retargeting: false,
        ..ChainParams::new(Network::Regtest)
    }
}

/// Regtest limits with a four block difficulty period of 40 minutes
pub fn short_period_params() -> ChainParams {
    ChainParams {
        difficulty_adjustment_interval: 4,
        target_timespan: 4 * BLOCK_SPACING,
        ..regtest_params()
    }
}

/// Unmined header with no parent, declaring the regtest pow limit
pub fn genesis_header() -> BlockHeader {
    BlockHeader {
        version: Version::from_consensus(0x2000_0000),
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: TxMerkleNode::all_zeros(),
        time: GENESIS_TIME,
        bits: CompactTarget::from_consensus(REGTEST_BITS),
        nonce: 0,
    }
}

/// Unmined child of `parent` with the parent's bits; `salt` tells sibling headers apart.
pub fn child_header(parent: &BlockHeader, salt: u8) -> BlockHeader {
    BlockHeader {
        version: parent.version,
        prev_blockhash: parent.block_hash(),
        merkle_root: TxMerkleNode::from_byte_array([salt; 32]),
        time: parent.time + BLOCK_SPACING,
        bits: parent.bits,
        nonce: 0,
    }
}

/// Bump the nonce until the header hash meets `target`
pub fn mine(mut header: BlockHeader, target: &BigUint) -> BlockHeader {
    while hash_to_uint(&header.block_hash()) > *target {
        header.nonce = header.nonce.wrapping_add(1);
    }
    header
}

/// Mine a header against the target its own bits declare
pub fn mine_declared(header: BlockHeader) -> BlockHeader {
    let target = target_from_bits(header.bits.to_consensus())
        .expect("test headers declare valid compact targets");
    mine(header, &target)
}

/// Mined child of `parent` with the given timestamp and bits
pub fn mined_child(parent: &BlockHeader, salt: u8, time: u32, bits: u32) -> BlockHeader {
    let mut header = child_header(parent, salt);
    header.time = time;
    header.bits = CompactTarget::from_consensus(bits);
    mine_declared(header)
}
