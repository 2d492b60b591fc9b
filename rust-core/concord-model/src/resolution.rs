// SPDX-License-Identifier: PMPL-1.0-or-later
//! Resolutions and their review state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{ConflictId, ResolutionId};

/// Reconciliation strategy, dispatched once in the resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Take the item from the highest-priority source
    SourcePriority,
    /// Weighted mean (numeric) or weighted vote (categorical)
    WeightedTruth,
    /// Delegate to the external generative capability
    AiConsensus,
    /// Source priority and weighted truth fed into AI consensus
    Hybrid,
}

impl ResolutionStrategy {
    /// How the narrative of this strategy is produced
    pub fn generated_by(self) -> GeneratedBy {
        match self {
            ResolutionStrategy::SourcePriority | ResolutionStrategy::WeightedTruth => {
                GeneratedBy::Rule
            }
            ResolutionStrategy::AiConsensus => GeneratedBy::Llm,
            ResolutionStrategy::Hybrid => GeneratedBy::Hybrid,
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionStrategy::SourcePriority => write!(f, "source_priority"),
            ResolutionStrategy::WeightedTruth => write!(f, "weighted_truth"),
            ResolutionStrategy::AiConsensus => write!(f, "ai_consensus"),
            ResolutionStrategy::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source_priority" => Ok(ResolutionStrategy::SourcePriority),
            "weighted_truth" => Ok(ResolutionStrategy::WeightedTruth),
            "ai_consensus" => Ok(ResolutionStrategy::AiConsensus),
            "hybrid" => Ok(ResolutionStrategy::Hybrid),
            other => Err(format!("unknown resolution strategy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratedBy {
    Rule,
    Llm,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPriority {
    Low,
    Medium,
    High,
}

/// Follow-up action attached to a resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendedAction {
    pub action: String,
    pub priority: ActionPriority,
    #[serde(default)]
    pub target_system: Option<String>,
}

impl RecommendedAction {
    pub fn new(action: impl Into<String>, priority: ActionPriority) -> Self {
        Self {
            action: action.into(),
            priority,
            target_system: None,
        }
    }

    pub fn for_system(mut self, system: impl Into<String>) -> Self {
        self.target_system = Some(system.into());
        self
    }
}

/// Who or what produced the narrative, and at what token cost
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationProvenance {
    pub generated_by: GeneratedBy,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt_tokens: Option<u32>,
    #[serde(default)]
    pub completion_tokens: Option<u32>,
}

impl GenerationProvenance {
    pub fn rule() -> Self {
        Self {
            generated_by: GeneratedBy::Rule,
            model: None,
            prompt_tokens: None,
            completion_tokens: None,
        }
    }
}

/// Human review fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewState {
    pub reviewed: bool,
    pub reviewer: Option<String>,
    pub notes: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub accepted: bool,
    pub accepted_at: Option<DateTime<Utc>>,
}

/// Reconciled conclusion produced by a named strategy.
///
/// At most one resolution per conflict has `review.accepted == true`.
/// A resolution that loses acceptance keeps its record and gets
/// `superseded_at` set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightConflictResolution {
    pub id: ResolutionId,
    pub conflict_id: ConflictId,
    pub strategy: ResolutionStrategy,
    pub resolved_summary: String,
    pub consensus_narrative: String,
    pub recommended_actions: Vec<RecommendedAction>,
    /// Confidence in `[0, 1]`
    pub confidence: f64,
    pub rationale: String,
    /// Normalized weights used by weighted strategies
    #[serde(default)]
    pub source_weights: Option<BTreeMap<String, f64>>,
    /// Priority order used by priority strategies
    #[serde(default)]
    pub priority_order: Option<Vec<String>>,
    pub provenance: GenerationProvenance,
    #[serde(default)]
    pub review: ReviewState,
    #[serde(default)]
    pub superseded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl InsightConflictResolution {
    pub fn is_accepted(&self) -> bool {
        self.review.accepted
    }

    /// Mark accepted at `now`.
    pub fn accept(&mut self, now: DateTime<Utc>) {
        self.review.accepted = true;
        self.review.accepted_at = Some(now);
    }

    /// Drop acceptance in favour of a newer resolution.
    pub fn supersede(&mut self, now: DateTime<Utc>) {
        self.review.accepted = false;
        self.superseded_at = Some(now);
    }
}
