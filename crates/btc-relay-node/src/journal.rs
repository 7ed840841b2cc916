//! Persistence seam for accepted headers.

use async_trait::async_trait;
use bitcoin::BlockHash;
use num_bigint::BigUint;

use crate::store::StoreError;

/// Trusted starting point of the relay, as supplied at initialization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenesisRecord {
    /// Raw 80-byte header
    pub header: Vec<u8>,
    pub height: u32,
    pub chain_work: BigUint,
    /// Timestamp of the first block of the genesis' difficulty period
    pub epoch_start_time: u32,
}

/// Append-only log of the genesis and every accepted header, in acceptance order.
///
/// Replaying the log through the relay reproduces the same chain state, reorgs included.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HeaderJournal: Send + Sync {
    async fn load_genesis(&self) -> Result<Option<GenesisRecord>, StoreError>;
    async fn save_genesis(&self, genesis: &GenesisRecord) -> Result<(), StoreError>;
    async fn append_header(&self, hash: &BlockHash, header: &[u8]) -> Result<(), StoreError>;
    /// Raw headers in acceptance order
    async fn load_headers(&self) -> Result<Vec<Vec<u8>>, StoreError>;
}
