//! Transaction inclusion proofs against stored block headers.

use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Txid};
use sha2::{Digest, Sha256};

use crate::chain_store::ChainStore;
use crate::error::RelayError;

/// Deepest Merkle path accepted; the transaction index is a 32-bit integer
pub const MAX_MERKLE_DEPTH: usize = 32;

/// Location of a transaction proven to be in the main chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedTransaction {
    pub block_height: u32,
    pub tx_index: u32,
    pub confirmations: u32,
}

/// Verify that `txid` sits at `tx_index` in the main-chain block `block_hash` and that the
/// block has at least `required_confirmations` confirmations.
///
/// Sibling hashes are in internal byte order, leaf level first.
pub fn verify_transaction(
    store: &ChainStore,
    txid: &Txid,
    block_hash: &BlockHash,
    tx_index: u32,
    merkle_path: &[[u8; 32]],
    required_confirmations: u32,
) -> Result<VerifiedTransaction, RelayError> {
    if *txid == Txid::all_zeros() {
        return Err(RelayError::InvalidTransactionId);
    }

    let record = store
        .lookup(block_hash)
        .ok_or(RelayError::BlockNotFound(*block_hash))?;
    if !record.is_main_chain() {
        return Err(RelayError::NotMainChain);
    }

    let root = compute_merkle_root(txid.to_byte_array(), tx_index, merkle_path)?;
    if root != record.header.merkle_root.to_byte_array() {
        return Err(RelayError::InvalidMerkleProofStructure);
    }

    let tip_height = store
        .main_chain_tip()
        .map(|tip| tip.height)
        .ok_or(RelayError::NotInitialized)?;
    let confirmations = tip_height - record.height + 1;
    if confirmations < required_confirmations {
        return Err(RelayError::InsufficientConfirmations {
            required: required_confirmations,
            actual: confirmations,
        });
    }

    Ok(VerifiedTransaction {
        block_height: record.height,
        tx_index,
        confirmations,
    })
}

/// Fold `leaf` with its sibling path; bit `i` of `index` set means the running hash is the
/// right-hand node at level `i`.
pub fn compute_merkle_root(
    leaf: [u8; 32],
    index: u32,
    path: &[[u8; 32]],
) -> Result<[u8; 32], RelayError> {
    if path.len() > MAX_MERKLE_DEPTH {
        return Err(RelayError::InvalidMerkleProofStructure);
    }
    // The index must address a leaf of a tree this deep
    if path.len() < MAX_MERKLE_DEPTH && index >> path.len() != 0 {
        return Err(RelayError::InvalidMerkleProofStructure);
    }

    let root = path
        .iter()
        .enumerate()
        .fold(leaf, |current, (level, sibling)| {
            if (index >> level) & 1 == 0 {
                double_sha256(&current, sibling)
            } else {
                double_sha256(sibling, &current)
            }
        });
    Ok(root)
}

/// Transaction Merkle tree of a block, built from its txids
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<[u8; 32]>>,
}

impl MerkleTree {
    /// Build the tree, duplicating the last node of odd-sized levels like Bitcoin does.
    ///
    /// Returns `None` for an empty transaction list.
    pub fn new(txids: &[Txid]) -> Option<Self> {
        if txids.is_empty() {
            return None;
        }
        let mut levels = vec![txids.iter().map(|txid| txid.to_byte_array()).collect::<Vec<_>>()];
        while let Some(current) = levels.last().filter(|level| level.len() > 1) {
            let parent = current
                .chunks(2)
                .map(|chunk| match chunk {
                    [left, right] => double_sha256(left, right),
                    [left] => double_sha256(left, left),
                    _ => unreachable!("Chunk size is at most 2"),
                })
                .collect();
            levels.push(parent);
        }
        Some(Self { levels })
    }

    /// Root in internal byte order
    pub fn root(&self) -> [u8; 32] {
        self.levels[self.levels.len() - 1][0]
    }

    /// Sibling path for the transaction at `tx_index`
    pub fn proof(&self, tx_index: u32) -> Option<Vec<[u8; 32]>> {
        let mut index = tx_index as usize;
        if index >= self.levels[0].len() {
            return None;
        }
        let mut path = Vec::with_capacity(self.levels.len() - 1);
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = if index % 2 == 1 {
                index - 1
            } else {
                // A missing right node is the left node duplicated
                (index + 1).min(level.len() - 1)
            };
            path.push(level[sibling]);
            index /= 2;
        }
        Some(path)
    }
}

fn double_sha256(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    let first = hasher.finalize();
    Sha256::digest(first).into()
}
