// SPDX-License-Identifier: PMPL-1.0-or-later
//! Analysis results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{ConflictId, EdgeType, ItemId, ResolutionStrategy, Severity};

/// A ranked, evidence-backed explanation for why a conflict arose
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCause {
    pub cause: String,
    /// Confidence in `[0, 1]`
    pub confidence: f64,
    #[serde(default)]
    pub evidence: Option<String>,
}

/// Reference from an analyzed conflict to a similar one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedConflict {
    pub target: ConflictId,
    pub edge_type: EdgeType,
    pub similarity: f64,
}

/// Estimated effort to reconcile a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Moderate,
    Hard,
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Difficulty::Easy => write!(f, "easy"),
            Difficulty::Moderate => write!(f, "moderate"),
            Difficulty::Hard => write!(f, "hard"),
        }
    }
}

/// Per-system impact note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemImpact {
    pub system: String,
    pub item_count: usize,
    pub note: String,
}

/// Pairwise similarity of two items in the same conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSimilarity {
    pub left: ItemId,
    pub right: ItemId,
    pub similarity: f64,
    /// Computed with the lexical fallback
    pub approximate: bool,
}

/// Output of one analyzer run. Replaced wholesale on re-analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictAnalysisResult {
    /// Score in `[0, 100]`
    pub severity_score: f64,
    pub severity: Severity,
    pub severity_rationale: String,
    /// Ordered by confidence descending, then cause text
    pub root_causes: Vec<RootCause>,
    pub related_conflicts: Vec<RelatedConflict>,
    pub suggested_strategy: ResolutionStrategy,
    pub difficulty: Difficulty,
    pub system_impacts: Vec<SystemImpact>,
    pub item_similarities: Vec<ItemSimilarity>,
    pub analyzed_at: DateTime<Utc>,
}

impl ConflictAnalysisResult {
    /// Highest-ranked root cause
    pub fn top_root_cause(&self) -> Option<&RootCause> {
        self.root_causes.first()
    }

    /// Largest pairwise item similarity, 0 when fewer than two items
    pub fn max_item_similarity(&self) -> f64 {
        self.item_similarities
            .iter()
            .map(|s| s.similarity)
            .fold(0.0, f64::max)
    }
}
