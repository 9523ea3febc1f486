//! Quorum arithmetic

use crate::error::{ConsensusError, ConsensusResult};
use serde::{Deserialize, Serialize};

/// Decision classes and the votes they require.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusKind {
    /// More than half: `⌊n/2⌋ + 1`.
    Majority,
    /// At least two thirds: `⌈2n/3⌉`.
    Supermajority,
    /// Every participant.
    Unanimous,
    /// Sum of voter weights above a threshold fraction.
    Weighted { threshold: f64 },
    /// PBFT three-phase voting; requires `n ≥ 3f + 1`.
    Byzantine,
}

impl ConsensusKind {
    /// Votes required among `n` participants. For `Weighted` this is the
    /// count-agnostic zero; weighted tallies compare weight sums instead.
    pub fn required_votes(&self, n: usize) -> usize {
        match self {
            ConsensusKind::Majority => n / 2 + 1,
            ConsensusKind::Supermajority => (2 * n).div_ceil(3),
            ConsensusKind::Unanimous => n,
            ConsensusKind::Weighted { .. } => 0,
            ConsensusKind::Byzantine => ByzantineParams::new(n).quorum,
        }
    }
}

/// Byzantine fault tolerance parameters: `n` participants tolerate
/// `f = ⌊(n-1)/3⌋` faults with commit quorum `2f + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByzantineParams {
    pub n: usize,
    pub f: usize,
    pub quorum: usize,
}

impl ByzantineParams {
    pub fn new(n: usize) -> Self {
        let f = n.saturating_sub(1) / 3;
        Self {
            n,
            f,
            quorum: 2 * f + 1,
        }
    }

    /// Build from a required tolerance, validating `n ≥ 3f + 1`.
    pub fn with_tolerance(n: usize, f: usize) -> ConsensusResult<Self> {
        if n < 3 * f + 1 {
            return Err(ConsensusError::InvalidParticipants(format!(
                "n ({}) must be >= 3f+1 ({}) for f={}",
                n,
                3 * f + 1,
                f
            )));
        }
        Ok(Self {
            n,
            f,
            quorum: 2 * f + 1,
        })
    }

    /// Prepares needed before a replica commits.
    pub fn prepare_quorum(&self) -> usize {
        2 * self.f
    }

    /// Commits needed before a replica decides.
    pub fn commit_quorum(&self) -> usize {
        self.quorum
    }

    pub fn has_quorum(&self, count: usize) -> bool {
        count >= self.quorum
    }
}


#[cfg(test)]
mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn quorum_sizes_are_consistent(n in 1usize..200) {
            let majority = ConsensusKind::Majority.required_votes(n);
            // Strictly more than half, and one vote fewer is not.
            prop_assert!(2 * majority > n);
            prop_assert!(2 * (majority - 1) <= n);

            let supermajority = ConsensusKind::Supermajority.required_votes(n);
            prop_assert!(3 * supermajority >= 2 * n);
            prop_assert!(supermajority >= majority);
            prop_assert!(supermajority <= n);

            prop_assert_eq!(ConsensusKind::Unanimous.required_votes(n), n);
        }

        #[test]
        fn byzantine_params_stay_within_bounds(n in 1usize..200) {
            let params = ByzantineParams::new(n);
            prop_assert!(n >= 3 * params.f + 1);
            prop_assert_eq!(params.quorum, 2 * params.f + 1);
            prop_assert!(params.quorum <= n);
        }
    }
}
