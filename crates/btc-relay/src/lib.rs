//! Bitcoin header relay
//!
//! This crate maintains an SPV view of the Bitcoin blockchain from headers submitted by
//! untrusted parties: it checks proof-of-work and difficulty retargeting, tracks the main
//! chain and competing forks, reorganizes when a fork accumulates more work, and verifies
//! Merkle proofs of transaction inclusion against confirmed main-chain blocks.

pub mod chain_store;
pub mod difficulty;
pub mod error;
pub mod header;
pub mod merkle;
pub mod params;
pub mod relay;
pub mod work;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use chain_store::{Branch, BranchId, ChainStore, HeaderRecord, Reorg, MAIN_CHAIN};
pub use error::RelayError;
pub use merkle::{verify_transaction, MerkleTree, VerifiedTransaction};
pub use params::{ChainParams, RelayConfig, ReorgPolicy};
pub use relay::{Relay, SharedRelay, SubmitOutcome};
