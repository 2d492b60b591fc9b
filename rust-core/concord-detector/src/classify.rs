// SPDX-License-Identifier: PMPL-1.0-or-later
//! Conflict classification table
//!
//! Evaluated over the full item set of a conflict, first match wins:
//!
//! | Order | Type | Rule |
//! |---|---|---|
//! | 1 | contradiction | same entity + metric, different categorical/boolean values |
//! | 2 | divergence | same entity + metric, numeric relative delta above threshold |
//! | 3 | missing_data | a tracked entity has fewer reporting sources than required |
//! | 4 | ambiguity | at least half the pairwise similarities sit within the band around the join threshold |
//! | 5 | inconsistency | stage ordinals go backwards in time; also the fallback |

use concord_model::{ClaimValue, ConflictItem, ConflictType, EntityRef, Severity};
use concord_similarity::similarity;
use std::collections::BTreeMap;

use crate::polarity::relative_delta;

/// Reporting coverage of one tracked entity within its window
#[derive(Debug, Clone, PartialEq)]
pub struct SourceCoverage {
    pub entity: EntityRef,
    pub distinct_sources: usize,
    pub min_sources: usize,
}

impl SourceCoverage {
    pub fn is_short(&self) -> bool {
        self.distinct_sources < self.min_sources
    }
}

/// Thresholds the table needs
#[derive(Debug, Clone, Copy)]
pub struct ClassificationThresholds {
    pub join_threshold: f64,
    pub ambiguity_band: f64,
    pub divergence_threshold: f64,
}

/// Classify a conflict from its items.
pub fn classify(
    items: &[ConflictItem],
    coverage: &[SourceCoverage],
    thresholds: ClassificationThresholds,
) -> ConflictType {
    let groups = claims_by_entity_metric(items);

    if groups.values().any(|values| has_categorical_disagreement(values)) {
        return ConflictType::Contradiction;
    }

    let diverges = groups.values().any(|values| {
        max_numeric_delta(values).is_some_and(|d| d > thresholds.divergence_threshold)
    });
    if diverges {
        return ConflictType::Divergence;
    }

    if coverage.iter().any(SourceCoverage::is_short) {
        return ConflictType::MissingData;
    }

    if is_ambiguous(items, thresholds) {
        return ConflictType::Ambiguity;
    }

    ConflictType::Inconsistency
}

/// Whether any entity's stage claims go backwards when ordered by time.
pub fn has_stage_regression(items: &[ConflictItem]) -> bool {
    let mut stages: BTreeMap<(&EntityRef, &str), Vec<(chrono::DateTime<chrono::Utc>, u32)>> =
        BTreeMap::new();
    for item in items {
        if let Some(claim) = &item.claim {
            if let ClaimValue::Stage { ordinal, .. } = claim.value {
                stages
                    .entry((&item.entity, claim.metric.as_str()))
                    .or_default()
                    .push((item.observed_at(), ordinal));
            }
        }
    }
    stages.values_mut().any(|seq| {
        seq.sort();
        seq.windows(2).any(|w| w[1].1 < w[0].1)
    })
}

/// Severity assigned when a conflict is opened. Revised only by analysis.
pub fn initial_severity(conflict_type: ConflictType, coverage: &[SourceCoverage]) -> Severity {
    match conflict_type {
        ConflictType::Contradiction | ConflictType::Divergence | ConflictType::Inconsistency => {
            Severity::Medium
        }
        ConflictType::Ambiguity => Severity::Low,
        ConflictType::MissingData => {
            let silent = coverage
                .iter()
                .filter(|c| c.is_short())
                .any(|c| c.distinct_sources == 0);
            if silent {
                Severity::High
            } else {
                Severity::Medium
            }
        }
    }
}

fn claims_by_entity_metric(items: &[ConflictItem]) -> BTreeMap<(&EntityRef, &str), Vec<&ClaimValue>> {
    let mut groups: BTreeMap<(&EntityRef, &str), Vec<&ClaimValue>> = BTreeMap::new();
    for item in items {
        if let Some(claim) = &item.claim {
            groups
                .entry((&item.entity, claim.metric.as_str()))
                .or_default()
                .push(&claim.value);
        }
    }
    groups
}

fn has_categorical_disagreement(values: &[&ClaimValue]) -> bool {
    let mut keys = values
        .iter()
        .filter(|v| v.is_categorical())
        .filter_map(|v| v.vote_key());
    match keys.next() {
        Some(first) => keys.any(|k| k != first),
        None => false,
    }
}

fn max_numeric_delta(values: &[&ClaimValue]) -> Option<f64> {
    let nums: Vec<f64> = values.iter().filter_map(|v| v.as_numeric()).collect();
    if nums.len() < 2 {
        return None;
    }
    let mut max = 0.0f64;
    for (i, a) in nums.iter().enumerate() {
        for b in &nums[i + 1..] {
            max = max.max(relative_delta(*a, *b));
        }
    }
    Some(max)
}

fn is_ambiguous(items: &[ConflictItem], thresholds: ClassificationThresholds) -> bool {
    if items.len() < 2 {
        return false;
    }
    let mut total = 0usize;
    let mut near = 0usize;
    for (i, a) in items.iter().enumerate() {
        for b in &items[i + 1..] {
            let score = similarity(&a.as_vector(), &b.as_vector());
            total += 1;
            if (score.value - thresholds.join_threshold).abs() <= thresholds.ambiguity_band {
                near += 1;
            }
        }
    }
    near * 2 >= total
}
