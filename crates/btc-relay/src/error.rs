//! Errors returned by relay operations.
//!
//! Every variant is terminal to the call that produced it; the relay never retries
//! internally and leaves its state untouched when an error is returned.

use bitcoin::BlockHash;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Genesis initialization attempted twice
    #[error("Initial parent has already been set")]
    GenesisAlreadySet,
    /// Operation attempted before the genesis header was set
    #[error("Relay has not been initialized with a genesis header")]
    NotInitialized,
    /// Referenced fork (or fork anchor) does not exist
    #[error("Incorrect fork identifier")]
    InvalidForkId,
    /// Raw header is not exactly 80 bytes
    #[error("Invalid block header size: {0} bytes")]
    InvalidHeaderSize(usize),
    #[error("Block already stored: {0}")]
    DuplicateBlock(BlockHash),
    #[error("Previous block hash not found: {0}")]
    PreviousBlockNotFound(BlockHash),
    /// Explicit fork submission does not build on that fork's tip
    #[error("Previous block hash does not match last block in fork submission")]
    ForkPrevBlock,
    #[error("Block not found: {0}")]
    BlockNotFound(BlockHash),
    #[error("PoW hash does not meet difficulty target of header: {0}")]
    InsufficientProofOfWork(BlockHash),
    #[error("Incorrect difficulty target specified in block header: expected {expected:#010x}, got {actual:#010x}")]
    IncorrectDifficultyTarget { expected: u32, actual: u32 },
    #[error("Main chain submission indicated, but submitted block is on a fork")]
    NotMainChain,
    #[error("Indicated fork submission, but block is in main chain")]
    NotFork,
    #[error("Invalid transaction identifier")]
    InvalidTransactionId,
    #[error("Transaction has less confirmations than requested: {actual} < {required}")]
    InsufficientConfirmations { required: u32, actual: u32 },
    #[error("Invalid Merkle Proof structure")]
    InvalidMerkleProofStructure,
}
