//! Difficulty retargeting and proof-of-work validation.

use bitcoin::block::Header as BlockHeader;
use bitcoin::BlockHash;
use num_bigint::BigUint;

use crate::chain_store::HeaderRecord;
use crate::error::RelayError;
use crate::header::hash_to_uint;
use crate::params::ChainParams;
use crate::work::{bits_from_target, round_to_compact, target_from_bits};

/// Read access to the timestamps of a branch's ancestors
pub trait ChainHistory {
    /// Timestamp of the block at `height` on the chain ending at `tip`
    fn timestamp_at(&self, tip: &BlockHash, height: u32) -> Option<u32>;
}

/// Compute the target a child of `parent` must declare.
///
/// Outside of period boundaries the parent's target carries over. At a boundary the
/// parent's target is rescaled by how long the closing period took.
pub fn expected_target<H: ChainHistory + ?Sized>(
    params: &ChainParams,
    history: &H,
    parent: &HeaderRecord,
) -> Result<BigUint, RelayError> {
    let parent_bits = parent.header.bits.to_consensus();
    let prev_target = target_from_bits(parent_bits).map_err(|_| {
        RelayError::IncorrectDifficultyTarget {
            expected: params.pow_limit_bits,
            actual: parent_bits,
        }
    })?;

    let height = parent.height + 1;
    if !params.is_retarget_height(height) {
        return Ok(prev_target);
    }

    let first_height = height - params.difficulty_adjustment_interval;
    let first_time = history
        .timestamp_at(&parent.hash, first_height)
        .ok_or(RelayError::PreviousBlockNotFound(parent.hash))?;
    Ok(retarget(params, &prev_target, first_time, parent.header.time))
}

/// Rescale `prev_target` by the duration of the closing period.
///
/// The measured timespan is clamped to a factor of four either way, the result is capped
/// at the network's pow limit and rounded to compact precision.
pub fn retarget(
    params: &ChainParams,
    prev_target: &BigUint,
    first_time: u32,
    last_time: u32,
) -> BigUint {
    if params.target_timespan == 0 {
        return round_to_compact(prev_target);
    }
    let timespan = i64::from(params.target_timespan);
    let actual_timespan =
        (i64::from(last_time) - i64::from(first_time)).clamp(timespan / 4, timespan * 4);

    let mut target = prev_target * BigUint::from(actual_timespan as u64)
        / BigUint::from(timespan as u64);
    let pow_limit = params.pow_limit();
    if target > pow_limit {
        target = pow_limit;
    }
    round_to_compact(&target)
}

/// Check the declared target and the proof-of-work of `header` against `expected_target`.
pub fn check_proof_of_work(
    header: &BlockHeader,
    expected_target: &BigUint,
) -> Result<(), RelayError> {
    let hash = header.block_hash();
    if hash_to_uint(&hash) > *expected_target {
        return Err(RelayError::InsufficientProofOfWork(hash));
    }

    let declared_bits = header.bits.to_consensus();
    let incorrect = RelayError::IncorrectDifficultyTarget {
        expected: bits_from_target(expected_target),
        actual: declared_bits,
    };
    match target_from_bits(declared_bits) {
        Ok(declared) if declared == *expected_target => Ok(()),
        _ => Err(incorrect),
    }
}
