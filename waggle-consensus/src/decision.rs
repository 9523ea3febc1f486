//! Decision tallying
//!
//! Turns a ballot of choices into a [`DecisionOutcome`] for the
//! non-Byzantine decision classes. Byzantine decisions come out of
//! [`crate::pbft`] and are reported through the same outcome shape.

use crate::quorum::ConsensusKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result of a collective decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionOutcome {
    /// Whether the required quorum was reached.
    pub consensus: bool,
    /// Winning choice, when consensus was reached.
    pub final_choice: Option<String>,
    /// Votes for the winner over all eligible voters.
    pub approval_rate: f64,
    /// Votes cast over all eligible voters.
    pub participation_rate: f64,
    /// Votes for the winner over votes cast.
    pub confidence_score: f64,
}

impl DecisionOutcome {
    pub fn aborted() -> Self {
        Self {
            consensus: false,
            final_choice: None,
            approval_rate: 0.0,
            participation_rate: 0.0,
            confidence_score: 0.0,
        }
    }
}

/// Tally a ballot of `voter -> choice` against a decision class.
///
/// `eligible` is the number of voters entitled to participate; `weights`
/// applies only to [`ConsensusKind::Weighted`], with missing voters
/// defaulting to weight 1.0.
pub fn tally_votes(
    kind: ConsensusKind,
    eligible: usize,
    ballots: &BTreeMap<String, String>,
    weights: Option<&BTreeMap<String, f64>>,
) -> DecisionOutcome {
    if eligible == 0 || ballots.is_empty() {
        return DecisionOutcome::aborted();
    }

    let weight_of = |voter: &str| weights.and_then(|w| w.get(voter).copied()).unwrap_or(1.0);

    // Vote counts and weight sums per choice.
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut weight_sums: BTreeMap<&str, f64> = BTreeMap::new();
    for (voter, choice) in ballots {
        *counts.entry(choice.as_str()).or_insert(0) += 1;
        *weight_sums.entry(choice.as_str()).or_insert(0.0) += weight_of(voter);
    }

    // Winner by weight for weighted decisions, by count otherwise; ties
    // break toward the lexicographically first choice.
    let winner: String = match kind {
        ConsensusKind::Weighted { .. } => weight_sums
            .iter()
            .fold(None::<(&str, f64)>, |best, (&choice, &weight)| match best {
                Some((_, w)) if w >= weight => best,
                _ => Some((choice, weight)),
            })
            .map(|(choice, _)| choice.to_string())
            .unwrap_or_default(),
        _ => counts
            .iter()
            .fold(None::<(&str, usize)>, |best, (&choice, &count)| match best {
                Some((_, c)) if c >= count => best,
                _ => Some((choice, count)),
            })
            .map(|(choice, _)| choice.to_string())
            .unwrap_or_default(),
    };
    let winner_votes = counts.get(winner.as_str()).copied().unwrap_or(0);

    let cast = ballots.len();
    let consensus = match kind {
        ConsensusKind::Weighted { threshold } => {
            let total: f64 = ballots.keys().map(|v| weight_of(v)).sum();
            let winning = weight_sums.get(winner.as_str()).copied().unwrap_or(0.0);
            total > 0.0 && winning / total >= threshold
        }
        _ => winner_votes >= kind.required_votes(eligible),
    };

    DecisionOutcome {
        final_choice: consensus.then(|| winner.clone()),
        approval_rate: winner_votes as f64 / eligible as f64,
        participation_rate: cast as f64 / eligible as f64,
        confidence_score: winner_votes as f64 / cast as f64,
        consensus,
    }
}
