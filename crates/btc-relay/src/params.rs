//! Consensus constants and relay policy.

use std::str::FromStr;

use bitcoin::Network;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::work::target_from_bits;

/// Number of blocks between difficulty adjustments
pub const DIFFICULTY_ADJUSTMENT_INTERVAL: u32 = 2016;

/// Expected duration of one difficulty period (two weeks, in seconds)
pub const TARGET_TIMESPAN: u32 = 14 * 24 * 60 * 60;

/// Proof-of-work limits, as compact targets
const MAINNET_POW_LIMIT_BITS: u32 = 0x1d00_ffff;
const SIGNET_POW_LIMIT_BITS: u32 = 0x1e03_77ae;
const REGTEST_POW_LIMIT_BITS: u32 = 0x207f_ffff;

/// Per-network parameters used by difficulty validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainParams {
    /// Easiest allowed target (compact encoding)
    pub pow_limit_bits: u32,
    /// Blocks per difficulty period
    pub difficulty_adjustment_interval: u32,
    /// Expected duration of a difficulty period in seconds
    pub target_timespan: u32,
    /// Keep the previous target at period boundaries (regtest)
    pub no_retargeting: bool,
}

impl ChainParams {
    pub fn new(network: Network) -> Self {
        let (pow_limit_bits, no_retargeting) = match network {
            Network::Signet => (SIGNET_POW_LIMIT_BITS, false),
            Network::Regtest => (REGTEST_POW_LIMIT_BITS, true),
            _ => (MAINNET_POW_LIMIT_BITS, false),
        };
        Self {
            pow_limit_bits,
            difficulty_adjustment_interval: DIFFICULTY_ADJUSTMENT_INTERVAL,
            target_timespan: TARGET_TIMESPAN,
            no_retargeting,
        }
    }

    /// Decoded proof-of-work limit
    pub fn pow_limit(&self) -> BigUint {
        // An unusable limit admits no header at all
        target_from_bits(self.pow_limit_bits).unwrap_or_default()
    }

    /// Whether a block at `height` recomputes its difficulty target
    pub fn is_retarget_height(&self, height: u32) -> bool {
        // Empty periods never retarget
        !self.no_retargeting
            && self.difficulty_adjustment_interval != 0
            && self.target_timespan != 0
            && height % self.difficulty_adjustment_interval == 0
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::new(Network::Bitcoin)
    }
}

/// Rule deciding when a fork replaces the main chain.
///
/// The fork must be strictly ahead; ties keep the current main chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReorgPolicy {
    /// Fork tip has more cumulative work than the main-chain tip (Bitcoin's rule)
    #[default]
    CumulativeWork,
    /// Fork tip is higher than the main-chain tip
    ChainLength,
}

impl FromStr for ReorgPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "work" | "cumulative_work" => Ok(Self::CumulativeWork),
            "length" | "chain_length" => Ok(Self::ChainLength),
            other => Err(format!("unknown reorg policy: {other}")),
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub params: ChainParams,
    pub policy: ReorgPolicy,
}

impl RelayConfig {
    pub fn new(network: Network, policy: ReorgPolicy) -> Self {
        Self {
            params: ChainParams::new(network),
            policy,
        }
    }
}
