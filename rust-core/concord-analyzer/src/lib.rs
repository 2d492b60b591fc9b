// SPDX-License-Identifier: PMPL-1.0-or-later
//! Concord Conflict Analyzer
//!
//! Given a conflict and its items, computes in order:
//!
//! 1. a severity score in `[0, 100]` and its level,
//! 2. ranked root causes from per-type rule templates,
//! 3. the k most similar other open conflicts, with an edge type,
//! 4. a suggested resolution strategy,
//! 5. difficulty, per-system impact notes and pairwise item similarities.
//!
//! Every input, including "now", is passed in. Analyzing an unchanged
//! conflict twice yields identical output.

use chrono::{DateTime, Duration, Utc};
use concord_graph::{most_similar, ConflictSignature};
use concord_model::{
    Conflict, ConflictAnalysisResult, ConflictItem, ConflictType, Difficulty, EdgeType,
    ItemSimilarity, RelatedConflict, ResolutionStrategy, Severity, SourcePolicy, SystemImpact,
};
use concord_similarity::similarity;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::debug;

mod root_cause;
mod severity;

pub use root_cause::{root_causes, CauseContext};
pub use severity::{base_weight, level, recency_factor, score, SeverityBreakdown};

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Score cut points for medium, high, critical
    pub cut_points: [f64; 3],
    /// Related conflicts to return
    pub related_k: usize,
    /// Minimum similarity for a related conflict
    pub related_min_similarity: f64,
    /// Reporting cadence assumed for sources with no tracked cadence
    pub default_cadence_secs: i64,
    /// Spread of reliability weights that counts as "distinct"
    pub weight_divergence_threshold: f64,
    /// Join threshold shared with the detector
    pub join_threshold: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            cut_points: Severity::CUT_POINTS,
            related_k: 5,
            related_min_similarity: 0.5,
            default_cadence_secs: 3600,
            weight_divergence_threshold: 0.1,
            join_threshold: 0.72,
        }
    }
}

impl AnalyzerConfig {
    pub fn validate(&self) -> Result<(), AnalyzerError> {
        let [a, b, c] = self.cut_points;
        if !(0.0 <= a && a < b && b < c && c <= 100.0) {
            return Err(AnalyzerError::InvalidConfig(format!(
                "cut points must be increasing within [0, 100], got {:?}",
                self.cut_points
            )));
        }
        if !(0.0..=1.0).contains(&self.related_min_similarity) {
            return Err(AnalyzerError::InvalidConfig(
                "related_min_similarity must be in [0, 1]".to_string(),
            ));
        }
        if self.default_cadence_secs <= 0 {
            return Err(AnalyzerError::InvalidConfig(
                "default_cadence_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything one analyzer run reads
pub struct AnalysisInput<'a> {
    pub conflict: &'a Conflict,
    pub items: &'a [ConflictItem],
    /// Signatures of the other open conflicts of the organization
    pub candidates: &'a [ConflictSignature],
    pub policy: &'a SourcePolicy,
    /// Shortest tracked cadence for the conflict's entities, if any
    pub cadence: Option<Duration>,
    pub as_of: DateTime<Utc>,
}

/// Conflict analyzer
#[derive(Debug, Clone)]
pub struct ConflictAnalyzer {
    config: AnalyzerConfig,
    causality: Regex,
    negation: Regex,
}

impl ConflictAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Result<Self, AnalyzerError> {
        config.validate()?;
        let causality = Regex::new(
            r"\b(because|due to|caused by|as a result of|result of|driven by|triggered by|following|after)\b",
        )
        .map_err(|e| AnalyzerError::InvalidPattern(e.to_string()))?;
        let negation = Regex::new(r"\b(not|no|never|denied|denies|false|isn'?t|doesn'?t|won'?t)\b")
            .map_err(|e| AnalyzerError::InvalidPattern(e.to_string()))?;
        Ok(Self {
            config,
            causality,
            negation,
        })
    }

    pub fn with_defaults() -> Result<Self, AnalyzerError> {
        Self::new(AnalyzerConfig::default())
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Run the full analysis.
    pub fn analyze(&self, input: &AnalysisInput<'_>) -> ConflictAnalysisResult {
        let item_similarities = pairwise(input.items);
        let max_similarity = item_similarities
            .iter()
            .map(|s| s.similarity)
            .fold(0.0, f64::max);

        let breakdown = score(
            input.conflict.conflict_type,
            input.items,
            max_similarity,
            input.as_of,
        );
        let severity_score = breakdown.total();
        let severity = level(severity_score, self.config.cut_points);

        let cadence = input
            .cadence
            .unwrap_or_else(|| Duration::seconds(self.config.default_cadence_secs));
        let root_causes = root_causes(
            input.conflict.conflict_type,
            &CauseContext {
                items: input.items,
                cadence,
                join_threshold: self.config.join_threshold,
                max_similarity,
            },
        );

        let related_conflicts = self.related(input);
        let suggested_strategy = self.suggest_strategy(input.conflict, input.items, input.policy);
        let difficulty = difficulty(input.conflict.conflict_type, input.items, &item_similarities);
        let system_impacts = system_impacts(input.items);

        debug!(
            conflict_id = %input.conflict.id,
            severity_score,
            severity = %severity,
            strategy = %suggested_strategy,
            related = related_conflicts.len(),
            "Conflict analyzed"
        );

        ConflictAnalysisResult {
            severity_score,
            severity,
            severity_rationale: breakdown.rationale(input.conflict.conflict_type, severity),
            root_causes,
            related_conflicts,
            suggested_strategy,
            difficulty,
            system_impacts,
            item_similarities,
            analyzed_at: input.as_of,
        }
    }

    /// Most similar other conflicts, tagged `caused_by` when either side's
    /// text carries a causal phrase, `contradicts` when exactly one side is
    /// negated, `related` otherwise.
    fn related(&self, input: &AnalysisInput<'_>) -> Vec<RelatedConflict> {
        let target = ConflictSignature::from_items(input.conflict, input.items);
        let by_id: BTreeMap<_, _> = input.candidates.iter().map(|c| (&c.id, c)).collect();

        most_similar(
            &target,
            input.candidates,
            self.config.related_k,
            self.config.related_min_similarity,
        )
        .into_iter()
        .map(|(id, score)| {
            let other_text = by_id
                .get(&id)
                .map(|c| c.text.to_lowercase())
                .unwrap_or_default();
            let own_text = target.text.to_lowercase();
            let edge_type = if self.causality.is_match(&own_text) || self.causality.is_match(&other_text)
            {
                EdgeType::CausedBy
            } else if self.negation.is_match(&own_text) != self.negation.is_match(&other_text) {
                EdgeType::Contradicts
            } else {
                EdgeType::Related
            };
            RelatedConflict {
                target: id,
                edge_type,
                similarity: score.value,
            }
        })
        .collect()
    }

    /// - `hybrid`: an authoritative source is present and reliability
    ///   weights are meaningfully divergent
    /// - `source_priority`: an authoritative source is present
    /// - `weighted_truth`: reliability weights are meaningfully divergent
    /// - `ai_consensus`: neither
    pub fn suggest_strategy(
        &self,
        conflict: &Conflict,
        items: &[ConflictItem],
        policy: &SourcePolicy,
    ) -> ResolutionStrategy {
        let systems: BTreeSet<&str> = items.iter().map(|i| i.source_system.as_str()).collect();

        let has_priority = conflict
            .source_entities
            .iter()
            .filter_map(|e| policy.authoritative_for(e.kind))
            .any(|source| systems.contains(source));

        let weights: Vec<f64> = systems
            .iter()
            .filter_map(|s| policy.reliability_of(s))
            .collect();
        let divergent = weights.len() >= 2 && {
            let max = weights.iter().cloned().fold(f64::MIN, f64::max);
            let min = weights.iter().cloned().fold(f64::MAX, f64::min);
            max - min >= self.config.weight_divergence_threshold
        };

        match (has_priority, divergent) {
            (true, true) => ResolutionStrategy::Hybrid,
            (true, false) => ResolutionStrategy::SourcePriority,
            (false, true) => ResolutionStrategy::WeightedTruth,
            (false, false) => ResolutionStrategy::AiConsensus,
        }
    }
}

/// Pairwise similarities in item order
pub fn pairwise(items: &[ConflictItem]) -> Vec<ItemSimilarity> {
    let mut out = Vec::new();
    for (i, a) in items.iter().enumerate() {
        for b in &items[i + 1..] {
            let s = similarity(&a.as_vector(), &b.as_vector());
            out.push(ItemSimilarity {
                left: a.id.clone(),
                right: b.id.clone(),
                similarity: s.value,
                approximate: s.approximate,
            });
        }
    }
    out
}

fn difficulty(
    conflict_type: ConflictType,
    items: &[ConflictItem],
    similarities: &[ItemSimilarity],
) -> Difficulty {
    let systems: BTreeSet<&str> = items.iter().map(|i| i.source_system.as_str()).collect();
    let points = [
        items.len() >= 3,
        systems.len() >= 3,
        matches!(conflict_type, ConflictType::Contradiction | ConflictType::Ambiguity),
        similarities.iter().any(|s| s.approximate),
    ]
    .iter()
    .filter(|p| **p)
    .count();
    match points {
        0 | 1 => Difficulty::Easy,
        2 => Difficulty::Moderate,
        _ => Difficulty::Hard,
    }
}

fn system_impacts(items: &[ConflictItem]) -> Vec<SystemImpact> {
    let mut by_system: BTreeMap<&str, Vec<&ConflictItem>> = BTreeMap::new();
    for item in items {
        by_system.entry(&item.source_system).or_default().push(item);
    }
    by_system
        .into_iter()
        .map(|(system, items)| {
            let mean_confidence =
                items.iter().map(|i| i.confidence).sum::<f64>() / items.len() as f64;
            let claims: BTreeSet<String> = items
                .iter()
                .filter_map(|i| i.claim.as_ref())
                .map(|c| format!("{}={}", c.metric, c.value))
                .collect();
            let mut note = format!(
                "{} item(s), mean confidence {:.2}",
                items.len(),
                mean_confidence
            );
            if !claims.is_empty() {
                note.push_str(&format!("; reports {}", claims.into_iter().collect::<Vec<_>>().join(", ")));
            }
            SystemImpact {
                system: system.to_string(),
                item_count: items.len(),
                note,
            }
        })
        .collect()
}
