// SPDX-License-Identifier: PMPL-1.0-or-later
//! Severity scoring
//!
//! ```text
//! score = base(type)                                    0..45
//!       + (1 - max pairwise similarity) * 25            contradiction / divergence only
//!       + min(distinct systems, 5) / 5 * 20
//!       + recency(newest item) * 15                     step function over hours
//! ```
//!
//! Clamped to `[0, 100]` and mapped to a level with fixed cut points.

use chrono::{DateTime, Utc};
use concord_model::{ConflictItem, ConflictType, Severity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const SPREAD_WEIGHT: f64 = 25.0;
pub const SYSTEMS_WEIGHT: f64 = 20.0;
pub const RECENCY_WEIGHT: f64 = 15.0;
const SYSTEMS_CAP: usize = 5;

/// Base weight of each conflict type
pub fn base_weight(conflict_type: ConflictType) -> f64 {
    match conflict_type {
        ConflictType::Contradiction => 40.0,
        ConflictType::MissingData => 45.0,
        ConflictType::Divergence => 30.0,
        ConflictType::Inconsistency => 25.0,
        ConflictType::Ambiguity => 15.0,
    }
}

/// Recency factor from the age of the newest item
pub fn recency_factor(age_hours: i64) -> f64 {
    match age_hours {
        h if h <= 24 => 1.0,
        h if h <= 72 => 0.6,
        h if h <= 168 => 0.3,
        _ => 0.0,
    }
}

/// Individual score components, kept for the rationale
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeverityBreakdown {
    pub base: f64,
    pub spread: f64,
    pub systems: f64,
    pub recency: f64,
}

impl SeverityBreakdown {
    pub fn total(&self) -> f64 {
        (self.base + self.spread + self.systems + self.recency).clamp(0.0, 100.0)
    }

    pub fn rationale(&self, conflict_type: ConflictType, severity: Severity) -> String {
        format!(
            "base {:.1} ({}) + similarity spread {:.1} + affected systems {:.1} + recency {:.1} = {:.1} -> {}",
            self.base,
            conflict_type,
            self.spread,
            self.systems,
            self.recency,
            self.total(),
            severity
        )
    }
}

/// Score a conflict as of `as_of`.
pub fn score(
    conflict_type: ConflictType,
    items: &[ConflictItem],
    max_pairwise_similarity: f64,
    as_of: DateTime<Utc>,
) -> SeverityBreakdown {
    let spread = match conflict_type {
        ConflictType::Contradiction | ConflictType::Divergence if items.len() > 1 => {
            (1.0 - max_pairwise_similarity.clamp(0.0, 1.0)) * SPREAD_WEIGHT
        }
        _ => 0.0,
    };

    let systems: BTreeSet<&str> = items.iter().map(|i| i.source_system.as_str()).collect();
    let systems = systems.len().min(SYSTEMS_CAP) as f64 / SYSTEMS_CAP as f64 * SYSTEMS_WEIGHT;

    let recency = items
        .iter()
        .map(ConflictItem::observed_at)
        .max()
        .map(|newest| recency_factor((as_of - newest).num_hours().max(0)))
        .unwrap_or(0.0)
        * RECENCY_WEIGHT;

    SeverityBreakdown {
        base: base_weight(conflict_type),
        spread,
        systems,
        recency,
    }
}

/// Map a score to a level with explicit cut points.
pub fn level(score: f64, cut_points: [f64; 3]) -> Severity {
    let [medium, high, critical] = cut_points;
    if score >= critical {
        Severity::Critical
    } else if score >= high {
        Severity::High
    } else if score >= medium {
        Severity::Medium
    } else {
        Severity::Low
    }
}
