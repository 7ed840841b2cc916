//! Append-only header store with main-chain and fork bookkeeping.
//!
//! Records are never removed. A reorganization only moves hashes between the main-chain
//! height index and fork branches, relabeling the `branch_id` of the affected records.

use std::collections::{BTreeMap, HashMap};

use bitcoin::block::Header as BlockHeader;
use bitcoin::BlockHash;
use num_bigint::BigUint;
use tracing::debug;

use crate::difficulty::ChainHistory;
use crate::error::RelayError;

/// Branch identifier; 0 is the main chain, forks get increasing ids starting at 1
pub type BranchId = u32;

/// Branch id of the main chain
pub const MAIN_CHAIN: BranchId = 0;

/// A stored header together with its position in the block tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRecord {
    pub header: BlockHeader,
    pub hash: BlockHash,
    pub height: u32,
    /// Total work of the chain ending at this block
    pub chain_work: BigUint,
    pub branch_id: BranchId,
    /// Insertion order
    pub seq: u64,
}

impl HeaderRecord {
    pub fn is_main_chain(&self) -> bool {
        self.branch_id == MAIN_CHAIN
    }
}

/// Fork metadata: the record it diverges from and its hashes in height order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub id: BranchId,
    /// Parent of the first record of the branch
    pub anchor: BlockHash,
    pub records: Vec<BlockHash>,
}

impl Branch {
    pub fn tip(&self) -> Option<&BlockHash> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Summary of a chain reorganization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reorg {
    /// Fork that became the main chain
    pub promoted_branch: BranchId,
    /// Fork now holding the superseded main-chain records, if there were any
    pub demoted_branch: Option<BranchId>,
    /// Last block shared by the old and the new main chain
    pub common_ancestor: BlockHash,
    pub common_ancestor_height: u32,
    pub old_tip: BlockHash,
    pub new_tip: BlockHash,
}

#[derive(Debug)]
struct Genesis {
    hash: BlockHash,
    height: u32,
    epoch_start_time: u32,
}

#[derive(Debug)]
pub struct ChainStore {
    records: HashMap<BlockHash, HeaderRecord>,
    genesis: Option<Genesis>,
    /// Main-chain hashes, indexed by `height - genesis height`
    main_chain: Vec<BlockHash>,
    forks: BTreeMap<BranchId, Branch>,
    next_branch_id: BranchId,
    next_seq: u64,
}

impl Default for ChainStore {
    fn default() -> Self {
        Self {
            records: HashMap::new(),
            genesis: None,
            main_chain: Vec::new(),
            forks: BTreeMap::new(),
            next_branch_id: MAIN_CHAIN + 1,
            next_seq: 0,
        }
    }
}

impl ChainStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the trusted starting header.
    ///
    /// `epoch_start_time` is the timestamp of the first block of the difficulty period the
    /// genesis belongs to; it is needed for the first retarget when that block is not stored.
    pub fn set_genesis(
        &mut self,
        header: BlockHeader,
        height: u32,
        chain_work: BigUint,
        epoch_start_time: u32,
    ) -> Result<&HeaderRecord, RelayError> {
        if self.genesis.is_some() {
            return Err(RelayError::GenesisAlreadySet);
        }
        let hash = header.block_hash();
        self.genesis = Some(Genesis {
            hash,
            height,
            epoch_start_time,
        });
        self.main_chain.push(hash);
        Ok(self.insert_record(header, height, chain_work, MAIN_CHAIN))
    }

    pub fn is_initialized(&self) -> bool {
        self.genesis.is_some()
    }

    pub fn genesis(&self) -> Option<&HeaderRecord> {
        self.genesis
            .as_ref()
            .and_then(|genesis| self.records.get(&genesis.hash))
    }

    pub fn genesis_height(&self) -> Option<u32> {
        self.genesis.as_ref().map(|genesis| genesis.height)
    }

    pub fn lookup(&self, hash: &BlockHash) -> Option<&HeaderRecord> {
        self.records.get(hash)
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.records.contains_key(hash)
    }

    /// Number of stored records, across all branches
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records in insertion order
    pub fn records(&self) -> Vec<&HeaderRecord> {
        let mut records: Vec<_> = self.records.values().collect();
        records.sort_by_key(|record| record.seq);
        records
    }

    pub fn main_chain_tip(&self) -> Option<&HeaderRecord> {
        self.main_chain.last().and_then(|hash| self.records.get(hash))
    }

    /// Main-chain record at `height`
    pub fn main_chain_at(&self, height: u32) -> Option<&HeaderRecord> {
        let offset = height.checked_sub(self.genesis_height()?)?;
        self.main_chain
            .get(offset as usize)
            .and_then(|hash| self.records.get(hash))
    }

    pub fn branch(&self, branch_id: BranchId) -> Option<&Branch> {
        self.forks.get(&branch_id)
    }

    /// Live forks in id order
    pub fn branches(&self) -> impl Iterator<Item = &Branch> {
        self.forks.values()
    }

    /// Ancestor at `height` of the block `hash` (the block itself at its own height).
    pub fn ancestor_at(&self, hash: &BlockHash, height: u32) -> Option<&HeaderRecord> {
        let mut record = self.records.get(hash)?;
        loop {
            if record.height == height {
                return Some(record);
            }
            if record.height < height {
                return None;
            }
            if record.is_main_chain() {
                return self.main_chain_at(height);
            }
            record = self.records.get(&record.header.prev_blockhash)?;
        }
    }

    /// Append a header on top of the tip of `branch_id`.
    pub fn append(
        &mut self,
        branch_id: BranchId,
        header: BlockHeader,
        chain_work: BigUint,
    ) -> Result<&HeaderRecord, RelayError> {
        let hash = header.block_hash();
        if self.contains(&hash) {
            return Err(RelayError::DuplicateBlock(hash));
        }

        let tip = if branch_id == MAIN_CHAIN {
            *self.main_chain.last().ok_or(RelayError::NotInitialized)?
        } else {
            *self
                .forks
                .get(&branch_id)
                .and_then(Branch::tip)
                .ok_or(RelayError::InvalidForkId)?
        };
        if header.prev_blockhash != tip {
            return Err(if branch_id == MAIN_CHAIN {
                RelayError::NotMainChain
            } else {
                RelayError::ForkPrevBlock
            });
        }

        let height = self
            .lookup(&tip)
            .map(|record| record.height + 1)
            .ok_or(RelayError::PreviousBlockNotFound(tip))?;
        match self.forks.get_mut(&branch_id) {
            Some(branch) => branch.records.push(hash),
            None => self.main_chain.push(hash),
        }
        Ok(self.insert_record(header, height, chain_work, branch_id))
    }

    /// Start a new fork whose first record is `header`, built on `anchor`.
    pub fn create_fork(
        &mut self,
        anchor: BlockHash,
        header: BlockHeader,
        chain_work: BigUint,
    ) -> Result<(BranchId, &HeaderRecord), RelayError> {
        let hash = header.block_hash();
        if self.contains(&hash) {
            return Err(RelayError::DuplicateBlock(hash));
        }
        let anchor_height = self
            .lookup(&anchor)
            .map(|record| record.height)
            .ok_or(RelayError::InvalidForkId)?;
        if header.prev_blockhash != anchor {
            return Err(RelayError::ForkPrevBlock);
        }

        let branch_id = self.next_branch_id;
        self.next_branch_id += 1;
        self.forks.insert(
            branch_id,
            Branch {
                id: branch_id,
                anchor,
                records: vec![hash],
            },
        );
        debug!(
            "Fork #{} created at height {} on top of {}",
            branch_id, anchor_height, anchor
        );
        let record = self.insert_record(header, anchor_height + 1, chain_work, branch_id);
        Ok((branch_id, record))
    }

    /// Make the fork `branch_id` the main chain.
    ///
    /// The records from the last block shared with the main chain up to the fork tip are
    /// relabeled to the main chain; the main-chain records above that block move to a new
    /// fork anchored there. Intermediate forks the promoted one was built on lose the
    /// absorbed prefix and are re-anchored on the new main chain.
    pub fn promote_fork(&mut self, branch_id: BranchId) -> Result<Reorg, RelayError> {
        if branch_id == MAIN_CHAIN {
            return Err(RelayError::InvalidForkId);
        }
        let new_tip = *self
            .forks
            .get(&branch_id)
            .and_then(Branch::tip)
            .ok_or(RelayError::InvalidForkId)?;
        let old_tip = *self.main_chain.last().ok_or(RelayError::NotInitialized)?;
        let genesis_height = self.genesis_height().ok_or(RelayError::NotInitialized)?;

        // Walk down from the fork tip until the main chain is reached
        let mut path = Vec::new();
        let mut cursor = new_tip;
        let (ancestor, ancestor_height) = loop {
            let record = self
                .records
                .get(&cursor)
                .ok_or(RelayError::PreviousBlockNotFound(cursor))?;
            if record.is_main_chain() {
                break (cursor, record.height);
            }
            path.push((cursor, record.branch_id));
            cursor = record.header.prev_blockhash;
        };
        path.reverse();

        let demoted = self
            .main_chain
            .split_off((ancestor_height - genesis_height + 1) as usize);
        let demoted_branch = if demoted.is_empty() {
            None
        } else {
            let id = self.next_branch_id;
            self.next_branch_id += 1;
            for hash in &demoted {
                self.relabel(hash, id);
            }
            self.forks.insert(
                id,
                Branch {
                    id,
                    anchor: ancestor,
                    records: demoted,
                },
            );
            Some(id)
        };

        for (hash, previous_branch) in &path {
            self.relabel(hash, MAIN_CHAIN);
            self.main_chain.push(*hash);
            if let Some(branch) = self.forks.get_mut(previous_branch) {
                // The path covers a prefix of every branch it crosses
                if branch.records.first() == Some(hash) {
                    branch.records.remove(0);
                    branch.anchor = *hash;
                }
            }
        }
        self.forks.retain(|_, branch| !branch.is_empty());

        Ok(Reorg {
            promoted_branch: branch_id,
            demoted_branch,
            common_ancestor: ancestor,
            common_ancestor_height: ancestor_height,
            old_tip,
            new_tip,
        })
    }

    fn relabel(&mut self, hash: &BlockHash, branch_id: BranchId) {
        if let Some(record) = self.records.get_mut(hash) {
            record.branch_id = branch_id;
        }
    }

    fn insert_record(
        &mut self,
        header: BlockHeader,
        height: u32,
        chain_work: BigUint,
        branch_id: BranchId,
    ) -> &HeaderRecord {
        let hash = header.block_hash();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.records.entry(hash).or_insert(HeaderRecord {
            header,
            hash,
            height,
            chain_work,
            branch_id,
            seq,
        })
    }
}

impl ChainHistory for ChainStore {
    fn timestamp_at(&self, tip: &BlockHash, height: u32) -> Option<u32> {
        match self.ancestor_at(tip, height) {
            Some(record) => Some(record.header.time),
            // Blocks below the genesis all belong to its difficulty period
            None => self
                .genesis
                .as_ref()
                .filter(|genesis| height < genesis.height)
                .map(|genesis| genesis.epoch_start_time),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{child_header, genesis_header};

    fn work(n: u32) -> BigUint {
        BigUint::from(n)
    }

    /// Genesis at height 0 followed by `len` main-chain headers
    fn store_with_main_chain(len: u32) -> (ChainStore, Vec<BlockHeader>) {
        let mut store = ChainStore::new();
        let genesis = genesis_header();
        store
            .set_genesis(genesis, 0, work(1), genesis.time)
            .unwrap();
        let mut headers = vec![genesis];
        for i in 1..=len {
            let header = child_header(&headers[i as usize - 1], 0);
            store.append(MAIN_CHAIN, header, work(i + 1)).unwrap();
            headers.push(header);
        }
        (store, headers)
    }

    #[test]
    fn test_promote_rejects_main_chain_and_unknown_fork() {
        let (mut store, headers) = store_with_main_chain(2);
        assert_eq!(store.promote_fork(MAIN_CHAIN), Err(RelayError::InvalidForkId));
        assert_eq!(store.promote_fork(7), Err(RelayError::InvalidForkId));

        let fork_2 = child_header(&headers[1], 1);
        let (fork_id, _) = store
            .create_fork(headers[1].block_hash(), fork_2, work(3))
            .unwrap();
        assert_eq!(store.promote_fork(fork_id + 1), Err(RelayError::InvalidForkId));
        // Failed promotions leave the main chain alone
        assert_eq!(store.main_chain_tip().unwrap().hash, headers[2].block_hash());
        assert_eq!(store.branch(fork_id).unwrap().len(), 1);
    }

    #[test]
    fn test_genesis_set_once() {
        let (mut store, _) = store_with_main_chain(0);
        assert!(store.is_initialized());
        assert_eq!(store.main_chain_tip().unwrap().height, 0);
        let err = store
            .set_genesis(child_header(&genesis_header(), 1), 5, work(1), 0)
            .unwrap_err();
        assert_eq!(err, RelayError::GenesisAlreadySet);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_append_main_chain() {
        let (store, headers) = store_with_main_chain(3);
        let tip = store.main_chain_tip().unwrap();
        assert_eq!(tip.height, 3);
        assert_eq!(tip.hash, headers[3].block_hash());
        assert_eq!(tip.chain_work, work(4));
        assert_eq!(store.main_chain_at(1).unwrap().hash, headers[1].block_hash());
        assert!(store.main_chain_at(4).is_none());
        let seqs: Vec<u64> = headers
            .iter()
            .map(|header| store.lookup(&header.block_hash()).unwrap().seq)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_append_rejects_duplicates_and_gaps() {
        let (mut store, headers) = store_with_main_chain(2);
        assert_eq!(
            store.append(MAIN_CHAIN, headers[2], work(9)).unwrap_err(),
            RelayError::DuplicateBlock(headers[2].block_hash())
        );
        // Builds on height 1 instead of the tip
        let stale = child_header(&headers[1], 7);
        assert_eq!(
            store.append(MAIN_CHAIN, stale, work(9)).unwrap_err(),
            RelayError::NotMainChain
        );
        assert_eq!(
            store.append(42, stale, work(9)).unwrap_err(),
            RelayError::InvalidForkId
        );
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_create_and_extend_fork() {
        let (mut store, headers) = store_with_main_chain(3);
        let fork_1 = child_header(&headers[1], 1);
        let (fork_id, record) = store
            .create_fork(headers[1].block_hash(), fork_1, work(3))
            .unwrap();
        assert_eq!(fork_id, 1);
        assert_eq!(record.height, 2);
        assert_eq!(record.branch_id, fork_id);

        let fork_2 = child_header(&fork_1, 1);
        let record = store.append(fork_id, fork_2, work(4)).unwrap();
        assert_eq!(record.height, 3);

        let branch = store.branch(fork_id).unwrap();
        assert_eq!(branch.anchor, headers[1].block_hash());
        assert_eq!(branch.records, vec![fork_1.block_hash(), fork_2.block_hash()]);
        // Main chain is untouched
        assert_eq!(store.main_chain_tip().unwrap().hash, headers[3].block_hash());

        let unknown_anchor = child_header(&child_header(&headers[3], 9), 9);
        assert_eq!(
            store
                .create_fork(unknown_anchor.prev_blockhash, unknown_anchor, work(1))
                .unwrap_err(),
            RelayError::InvalidForkId
        );
    }

    #[test]
    fn test_promote_fork_swaps_labels() {
        let (mut store, headers) = store_with_main_chain(3);
        let fork_2 = child_header(&headers[1], 1);
        let (fork_id, _) = store
            .create_fork(headers[1].block_hash(), fork_2, work(10))
            .unwrap();
        let fork_3 = child_header(&fork_2, 1);
        let fork_4 = child_header(&fork_3, 1);
        store.append(fork_id, fork_3, work(11)).unwrap();
        store.append(fork_id, fork_4, work(12)).unwrap();

        let reorg = store.promote_fork(fork_id).unwrap();
        assert_eq!(reorg.promoted_branch, fork_id);
        assert_eq!(reorg.common_ancestor, headers[1].block_hash());
        assert_eq!(reorg.common_ancestor_height, 1);
        assert_eq!(reorg.old_tip, headers[3].block_hash());
        assert_eq!(reorg.new_tip, fork_4.block_hash());

        let tip = store.main_chain_tip().unwrap();
        assert_eq!(tip.hash, fork_4.block_hash());
        assert_eq!(tip.height, 4);
        for (height, header) in [(2, fork_2), (3, fork_3), (4, fork_4)] {
            let record = store.main_chain_at(height).unwrap();
            assert_eq!(record.hash, header.block_hash());
            assert!(record.is_main_chain());
        }

        let demoted_id = reorg.demoted_branch.unwrap();
        assert!(store.branch(fork_id).is_none());
        let demoted = store.branch(demoted_id).unwrap();
        assert_eq!(demoted.anchor, headers[1].block_hash());
        assert_eq!(
            demoted.records,
            vec![headers[2].block_hash(), headers[3].block_hash()]
        );
        for header in &headers[2..] {
            assert_eq!(
                store.lookup(&header.block_hash()).unwrap().branch_id,
                demoted_id
            );
        }
        // History is preserved
        assert_eq!(store.len(), 7);
    }

    #[test]
    fn test_promote_nested_fork() {
        let (mut store, headers) = store_with_main_chain(4);
        // Fork A from height 1, fork B from A's first block
        let a_2 = child_header(&headers[1], 1);
        let (fork_a, _) = store
            .create_fork(headers[1].block_hash(), a_2, work(3))
            .unwrap();
        let a_3 = child_header(&a_2, 1);
        store.append(fork_a, a_3, work(4)).unwrap();
        let b_3 = child_header(&a_2, 2);
        let (fork_b, _) = store.create_fork(a_2.block_hash(), b_3, work(4)).unwrap();
        let b_4 = child_header(&b_3, 2);
        let b_5 = child_header(&b_4, 2);
        store.append(fork_b, b_4, work(5)).unwrap();
        store.append(fork_b, b_5, work(6)).unwrap();

        let reorg = store.promote_fork(fork_b).unwrap();
        assert_eq!(reorg.common_ancestor_height, 1);
        let main: Vec<BlockHash> = (0..=5)
            .map(|height| store.main_chain_at(height).unwrap().hash)
            .collect();
        assert_eq!(
            main,
            vec![
                headers[0].block_hash(),
                headers[1].block_hash(),
                a_2.block_hash(),
                b_3.block_hash(),
                b_4.block_hash(),
                b_5.block_hash(),
            ]
        );

        // Fork A lost its first block to the main chain and is re-anchored on it
        let branch_a = store.branch(fork_a).unwrap();
        assert_eq!(branch_a.anchor, a_2.block_hash());
        assert_eq!(branch_a.records, vec![a_3.block_hash()]);
        assert!(store.branch(fork_b).is_none());
        assert_eq!(store.branch(reorg.demoted_branch.unwrap()).unwrap().len(), 3);
    }

    #[test]
    fn test_ancestor_lookup_across_branches() {
        let (mut store, headers) = store_with_main_chain(3);
        let fork_3 = child_header(&headers[2], 1);
        let (fork_id, _) = store
            .create_fork(headers[2].block_hash(), fork_3, work(4))
            .unwrap();
        let fork_4 = child_header(&fork_3, 1);
        store.append(fork_id, fork_4, work(5)).unwrap();

        let tip = fork_4.block_hash();
        assert_eq!(store.ancestor_at(&tip, 4).unwrap().hash, tip);
        assert_eq!(store.ancestor_at(&tip, 3).unwrap().hash, fork_3.block_hash());
        assert_eq!(store.ancestor_at(&tip, 1).unwrap().hash, headers[1].block_hash());
        assert!(store.ancestor_at(&tip, 5).is_none());
        assert_eq!(store.timestamp_at(&tip, 2), Some(headers[2].time));
    }

    #[test]
    fn test_timestamp_below_genesis_uses_epoch_start() {
        let mut store = ChainStore::new();
        let genesis = genesis_header();
        store.set_genesis(genesis, 2020, work(1), 1_000).unwrap();
        let hash = genesis.block_hash();
        assert_eq!(store.timestamp_at(&hash, 2016), Some(1_000));
        assert_eq!(store.timestamp_at(&hash, 2020), Some(genesis.time));
        assert_eq!(store.main_chain_at(2020).unwrap().hash, hash);
        assert!(store.main_chain_at(2019).is_none());
    }
}
