//! Relay state machine: header submission, fork tracking and reorganizations.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bitcoin::block::Header as BlockHeader;
use bitcoin::{BlockHash, Txid};
use num_bigint::BigUint;
use tracing::{debug, info};

use crate::chain_store::{Branch, BranchId, ChainStore, HeaderRecord, Reorg, MAIN_CHAIN};
use crate::difficulty::{check_proof_of_work, expected_target};
use crate::error::RelayError;
use crate::header::parse_header;
use crate::merkle::{self, VerifiedTransaction};
use crate::params::{RelayConfig, ReorgPolicy};
use crate::work::{target_from_bits, work_from_target};

/// What the submitter asserts about the header it sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    /// Extends the main-chain tip
    MainChain,
    /// Builds anywhere but on the main-chain tip
    Fork,
    /// Extends the tip of the given fork
    ForkId(BranchId),
    /// No assertion, the header goes wherever its parent leads
    Unchecked,
}

/// Where a header lands relative to the existing branches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    MainChain,
    ExtendFork(BranchId),
    NewFork(BlockHash),
}

/// Result of an accepted submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub hash: BlockHash,
    pub height: u32,
    /// Branch holding the header once the submission (and any reorg) completed
    pub branch_id: BranchId,
    pub chain_work: BigUint,
    /// Set when the submission made a fork the main chain
    pub reorg: Option<Reorg>,
}

/// Header relay over a single chain store.
///
/// Mutating operations validate everything before touching the store: on error the state
/// is left exactly as it was.
#[derive(Debug)]
pub struct Relay {
    config: RelayConfig,
    store: ChainStore,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            store: ChainStore::new(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn store(&self) -> &ChainStore {
        &self.store
    }

    pub fn is_initialized(&self) -> bool {
        self.store.is_initialized()
    }

    /// Set the trusted starting header.
    ///
    /// `epoch_start_time` is the timestamp of the first block of the genesis' difficulty
    /// period; it defaults to the genesis' own timestamp, which is exact when the genesis
    /// opens a period.
    pub fn initialize(
        &mut self,
        raw: &[u8],
        height: u32,
        chain_work: BigUint,
        epoch_start_time: Option<u32>,
    ) -> Result<&HeaderRecord, RelayError> {
        if self.store.is_initialized() {
            return Err(RelayError::GenesisAlreadySet);
        }
        let header = parse_header(raw)?;

        let bits = header.bits.to_consensus();
        let incorrect = RelayError::IncorrectDifficultyTarget {
            expected: self.config.params.pow_limit_bits,
            actual: bits,
        };
        match target_from_bits(bits) {
            Ok(target) if target <= self.config.params.pow_limit() => {}
            _ => return Err(incorrect),
        }

        let record = self.store.set_genesis(
            header,
            height,
            chain_work,
            epoch_start_time.unwrap_or(header.time),
        )?;
        info!(
            "Relay initialized at height {} with block {}",
            record.height, record.hash
        );
        Ok(record)
    }

    /// Submit a header, asserting whether it extends the main-chain tip.
    pub fn submit_header(
        &mut self,
        raw: &[u8],
        claimed_main_chain: bool,
    ) -> Result<SubmitOutcome, RelayError> {
        let claim = if claimed_main_chain {
            Claim::MainChain
        } else {
            Claim::Fork
        };
        self.apply(raw, claim)
    }

    /// Submit a header extending the tip of fork `fork_id`.
    pub fn submit_fork_header(
        &mut self,
        raw: &[u8],
        fork_id: BranchId,
    ) -> Result<SubmitOutcome, RelayError> {
        self.apply(raw, Claim::ForkId(fork_id))
    }

    /// Submit a header without any assertion about its branch.
    pub fn ingest_header(&mut self, raw: &[u8]) -> Result<SubmitOutcome, RelayError> {
        self.apply(raw, Claim::Unchecked)
    }

    fn apply(&mut self, raw: &[u8], claim: Claim) -> Result<SubmitOutcome, RelayError> {
        let result = self.try_apply(raw, claim);
        if let Err(err) = &result {
            debug!("Header rejected: {}", err);
        }
        result
    }

    fn try_apply(&mut self, raw: &[u8], claim: Claim) -> Result<SubmitOutcome, RelayError> {
        let header = parse_header(raw)?;
        let tip_hash = self
            .store
            .main_chain_tip()
            .map(|tip| tip.hash)
            .ok_or(RelayError::NotInitialized)?;
        if let Claim::ForkId(fork_id) = claim {
            if self.store.branch(fork_id).is_none() {
                return Err(RelayError::InvalidForkId);
            }
        }

        let hash = header.block_hash();
        if self.store.contains(&hash) {
            return Err(RelayError::DuplicateBlock(hash));
        }
        let parent = self
            .store
            .lookup(&header.prev_blockhash)
            .ok_or(RelayError::PreviousBlockNotFound(header.prev_blockhash))?;

        let placement = self.placement(parent, &tip_hash);
        match (claim, placement) {
            (Claim::MainChain, Placement::MainChain) => {}
            (Claim::MainChain, _) => return Err(RelayError::NotMainChain),
            (Claim::Fork, Placement::MainChain) => return Err(RelayError::NotFork),
            (Claim::ForkId(fork_id), Placement::ExtendFork(id)) if id == fork_id => {}
            (Claim::ForkId(_), _) => return Err(RelayError::ForkPrevBlock),
            _ => {}
        }

        let target = expected_target(&self.config.params, &self.store, parent)?;
        check_proof_of_work(&header, &target)?;
        let chain_work = &parent.chain_work + work_from_target(&target);

        let record = match placement {
            Placement::MainChain => self.store.append(MAIN_CHAIN, header, chain_work)?,
            Placement::ExtendFork(fork_id) => self.store.append(fork_id, header, chain_work)?,
            Placement::NewFork(anchor) => self.store.create_fork(anchor, header, chain_work)?.1,
        };
        debug!(
            "Stored block {} at height {} on branch #{}",
            record.hash, record.height, record.branch_id
        );
        let (height, branch_id) = (record.height, record.branch_id);

        let reorg = if branch_id != MAIN_CHAIN && self.overtakes_main_chain(&hash) {
            let reorg = self.store.promote_fork(branch_id)?;
            info!(
                "Reorganization: fork #{} promoted, new tip {} at height {} (common ancestor at height {})",
                reorg.promoted_branch, reorg.new_tip, height, reorg.common_ancestor_height
            );
            Some(reorg)
        } else {
            None
        };

        let record = self
            .store
            .lookup(&hash)
            .ok_or(RelayError::BlockNotFound(hash))?;
        Ok(SubmitOutcome {
            hash,
            height,
            branch_id: record.branch_id,
            chain_work: record.chain_work.clone(),
            reorg,
        })
    }

    fn placement(&self, parent: &HeaderRecord, tip_hash: &BlockHash) -> Placement {
        if parent.hash == *tip_hash {
            return Placement::MainChain;
        }
        let is_fork_tip = !parent.is_main_chain()
            && self.store.branch(parent.branch_id).and_then(Branch::tip) == Some(&parent.hash);
        if is_fork_tip {
            Placement::ExtendFork(parent.branch_id)
        } else {
            Placement::NewFork(parent.hash)
        }
    }

    /// Whether the fork record `hash` is strictly ahead of the main-chain tip.
    ///
    /// Both chains share everything up to their common ancestor, so comparing totals is
    /// the same as comparing what each accumulated since that ancestor.
    fn overtakes_main_chain(&self, hash: &BlockHash) -> bool {
        let (Some(record), Some(tip)) = (self.store.lookup(hash), self.store.main_chain_tip())
        else {
            return false;
        };
        match self.config.policy {
            ReorgPolicy::CumulativeWork => record.chain_work > tip.chain_work,
            ReorgPolicy::ChainLength => record.height > tip.height,
        }
    }

    /// Current main-chain tip
    pub fn tip(&self) -> Option<&HeaderRecord> {
        self.store.main_chain_tip()
    }

    pub fn best_height(&self) -> Option<u32> {
        self.tip().map(|tip| tip.height)
    }

    pub fn header_by_hash(&self, hash: &BlockHash) -> Option<&HeaderRecord> {
        self.store.lookup(hash)
    }

    /// Main-chain header at `height`
    pub fn header_at(&self, height: u32) -> Option<&BlockHeader> {
        self.store.main_chain_at(height).map(|record| &record.header)
    }

    pub fn is_main_chain(&self, hash: &BlockHash) -> bool {
        self.store
            .lookup(hash)
            .is_some_and(HeaderRecord::is_main_chain)
    }

    /// Number of confirmations of a main-chain block, the block itself included
    pub fn confirmations(&self, hash: &BlockHash) -> Result<u32, RelayError> {
        let record = self
            .store
            .lookup(hash)
            .ok_or(RelayError::BlockNotFound(*hash))?;
        if !record.is_main_chain() {
            return Err(RelayError::NotMainChain);
        }
        let tip_height = self.best_height().ok_or(RelayError::NotInitialized)?;
        Ok(tip_height - record.height + 1)
    }

    /// Verify a transaction inclusion proof against a main-chain block.
    pub fn verify_transaction(
        &self,
        txid: &Txid,
        block_hash: &BlockHash,
        tx_index: u32,
        merkle_path: &[[u8; 32]],
        required_confirmations: u32,
    ) -> Result<VerifiedTransaction, RelayError> {
        merkle::verify_transaction(
            &self.store,
            txid,
            block_hash,
            tx_index,
            merkle_path,
            required_confirmations,
        )
    }
}

/// Relay shared between a single writer and concurrent readers.
///
/// Submissions hold the write lock for their whole duration, so readers observe either the
/// state before a submission (and its reorg) or after it.
#[derive(Debug, Clone)]
pub struct SharedRelay {
    inner: Arc<RwLock<Relay>>,
}

impl SharedRelay {
    pub fn new(relay: Relay) -> Self {
        Self {
            inner: Arc::new(RwLock::new(relay)),
        }
    }

    /// The relay keeps no invariant across a panic point, so a poisoned lock is still usable.
    pub fn read(&self) -> RwLockReadGuard<'_, Relay> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Relay> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn submit_header(
        &self,
        raw: &[u8],
        claimed_main_chain: bool,
    ) -> Result<SubmitOutcome, RelayError> {
        self.write().submit_header(raw, claimed_main_chain)
    }

    pub fn submit_fork_header(
        &self,
        raw: &[u8],
        fork_id: BranchId,
    ) -> Result<SubmitOutcome, RelayError> {
        self.write().submit_fork_header(raw, fork_id)
    }

    pub fn verify_transaction(
        &self,
        txid: &Txid,
        block_hash: &BlockHash,
        tx_index: u32,
        merkle_path: &[[u8; 32]],
        required_confirmations: u32,
    ) -> Result<VerifiedTransaction, RelayError> {
        self.read().verify_transaction(
            txid,
            block_hash,
            tx_index,
            merkle_path,
            required_confirmations,
        )
    }
}
