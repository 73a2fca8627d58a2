//! Club-wide statistics derived from a record set.

use crate::types::InvestmentRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClubStatistics {
    pub total_proposals: u64,
    pub verified_proposals: u64,
    /// Sum of clear amounts over verified records.
    pub total_investment: u128,
    /// Distinct creators across all records.
    pub active_members: u64,
    /// Mean public signal over all records, 0 for an empty set.
    pub avg_public_signal: f64,
}

/// Aggregate `records` into [`ClubStatistics`].
///
/// Pure: reads nothing but its argument.
pub fn compute_statistics(records: &[InvestmentRecord]) -> ClubStatistics {
    if records.is_empty() {
        return ClubStatistics::default();
    }

    let mut verified_proposals = 0u64;
    let mut total_investment = 0u128;
    let mut signal_sum = 0u128;
    let mut creators = HashSet::new();

    for record in records {
        if let Some(clear) = record.clear_amount() {
            verified_proposals += 1;
            total_investment += u128::from(clear);
        }
        signal_sum += u128::from(record.public_signal);
        creators.insert(&record.creator);
    }

    ClubStatistics {
        total_proposals: records.len() as u64,
        verified_proposals,
        total_investment,
        active_members: creators.len() as u64,
        avg_public_signal: signal_sum as f64 / records.len() as f64,
    }
}
