// SPDX-License-Identifier: PMPL-1.0-or-later
//! Concord Conflict Resolver
//!
//! Turns a conflict and its items into a reconciled conclusion using one of
//! four strategies, dispatched once on [`ResolutionStrategy`]:
//!
//! - `source_priority`: the item from the highest-priority source wins.
//! - `weighted_truth`: weighted mean for numeric claims, weighted vote for
//!   categorical ones; confidence falls as weighted variance rises.
//! - `ai_consensus`: the [`NarrativeGenerator`] synthesizes the narrative.
//!   Transient generation failures are retried with exponential backoff.
//! - `hybrid`: both rule strategies run concurrently and feed the AI path;
//!   confidence is demoted when they disagree.
//!
//! The resolver only produces a [`ResolutionDraft`]. Persisting it, review
//! state and status transitions belong to the engine.

use chrono::{DateTime, Utc};
use concord_model::{
    Conflict, ConflictAnalysisResult, ConflictId, ConflictItem, GeneratedBy,
    GenerationProvenance, InsightConflictResolution, RecommendedAction, ResolutionId,
    ResolutionStrategy, ReviewState, SourcePolicy,
};
use concord_similarity::{similarity, InsightVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

mod generator;
mod rules;

pub use generator::{
    GeneratedNarrative, GenerationError, ItemContext, NarrativeGenerator, NarrativeRequest,
    RuleOutcome, ScriptedGenerator,
};
pub use rules::{
    categorical_dispersion, normalize_weights, numeric_dispersion, priority_order,
    source_priority, weighted_truth, Consensus, RuleResult, DEFAULT_RELIABILITY,
};

#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("Conflict has no items to resolve")]
    NoItems,

    #[error("Invalid source weights: {0}")]
    InvalidWeights(String),

    #[error("Invalid resolver configuration: {0}")]
    InvalidConfig(String),

    #[error("Generation failed after {attempts} attempt(s): {error}")]
    Generation {
        error: GenerationError,
        attempts: u32,
    },
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Retries after the first attempt, transient failures only
    pub max_retries: u32,
    /// Backoff before the first retry; doubles per retry
    pub retry_backoff_ms: u64,
    /// Vote weights this close to the top weight tie
    pub vote_tie_tolerance: f64,
    /// Rule-strategy disagreement above which hybrid confidence is demoted
    pub hybrid_disagreement_threshold: f64,
    /// Fraction removed from hybrid confidence on disagreement
    pub hybrid_confidence_penalty: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_backoff_ms: 100,
            vote_tie_tolerance: 0.02,
            hybrid_disagreement_threshold: 0.25,
            hybrid_confidence_penalty: 0.10,
        }
    }
}

impl ResolverConfig {
    pub fn validate(&self) -> Result<(), ResolverError> {
        if !(0.0..=1.0).contains(&self.vote_tie_tolerance) {
            return Err(ResolverError::InvalidConfig(
                "vote_tie_tolerance must be in [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.hybrid_disagreement_threshold) {
            return Err(ResolverError::InvalidConfig(
                "hybrid_disagreement_threshold must be in [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.hybrid_confidence_penalty) {
            return Err(ResolverError::InvalidConfig(
                "hybrid_confidence_penalty must be in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    fn backoff(&self, retry: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(1u64 << retry.min(16)))
    }
}

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// Caller-supplied strategy parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveOptions {
    /// Explicit source order for `source_priority`
    pub priority_order: Option<Vec<String>>,
    /// Explicit source weights for `weighted_truth`; normalized if needed
    pub source_weights: Option<BTreeMap<String, f64>>,
}

/// What the resolver reads
#[derive(Debug, Clone, Copy)]
pub struct ResolutionContext<'a> {
    pub conflict: &'a Conflict,
    pub items: &'a [ConflictItem],
    pub analysis: Option<&'a ConflictAnalysisResult>,
}

/// Resolution content before the engine gives it an id and review state
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionDraft {
    pub strategy: ResolutionStrategy,
    pub resolved_summary: String,
    pub consensus_narrative: String,
    pub recommended_actions: Vec<RecommendedAction>,
    pub confidence: f64,
    pub rationale: String,
    pub source_weights: Option<BTreeMap<String, f64>>,
    pub priority_order: Option<Vec<String>>,
    pub provenance: GenerationProvenance,
}

impl ResolutionDraft {
    fn from_rule(strategy: ResolutionStrategy, rule: RuleResult) -> Self {
        Self {
            strategy,
            resolved_summary: rule.summary,
            consensus_narrative: rule.narrative,
            recommended_actions: rule.actions,
            confidence: rule.confidence,
            rationale: rule.rationale.join("; "),
            source_weights: rule.source_weights,
            priority_order: rule.priority_order,
            provenance: GenerationProvenance::rule(),
        }
    }

    /// Materialize as an unaccepted, unreviewed resolution.
    pub fn into_resolution(
        self,
        conflict_id: ConflictId,
        now: DateTime<Utc>,
    ) -> InsightConflictResolution {
        InsightConflictResolution {
            id: ResolutionId::generate(),
            conflict_id,
            strategy: self.strategy,
            resolved_summary: self.resolved_summary,
            consensus_narrative: self.consensus_narrative,
            recommended_actions: self.recommended_actions,
            confidence: self.confidence,
            rationale: self.rationale,
            source_weights: self.source_weights,
            priority_order: self.priority_order,
            provenance: self.provenance,
            review: ReviewState::default(),
            superseded_at: None,
            created_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// ConflictResolver
// ---------------------------------------------------------------------------

pub struct ConflictResolver {
    config: ResolverConfig,
    generator: Option<Arc<dyn NarrativeGenerator>>,
}

impl ConflictResolver {
    pub fn new(config: ResolverConfig) -> Result<Self, ResolverError> {
        config.validate()?;
        Ok(Self {
            config,
            generator: None,
        })
    }

    pub fn with_generator(mut self, generator: Arc<dyn NarrativeGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolve with `strategy`.
    pub async fn resolve(
        &self,
        ctx: ResolutionContext<'_>,
        strategy: ResolutionStrategy,
        options: &ResolveOptions,
        policy: &SourcePolicy,
    ) -> Result<ResolutionDraft, ResolverError> {
        if ctx.items.is_empty() {
            return Err(ResolverError::NoItems);
        }

        let draft = match strategy {
            ResolutionStrategy::SourcePriority => {
                ResolutionDraft::from_rule(strategy, self.source_priority(ctx, options, policy)?)
            }
            ResolutionStrategy::WeightedTruth => {
                ResolutionDraft::from_rule(strategy, self.weighted_truth(ctx, options, policy)?)
            }
            ResolutionStrategy::AiConsensus => self.ai_consensus(ctx, Vec::new()).await?,
            ResolutionStrategy::Hybrid => self.hybrid(ctx, options, policy).await?,
        };

        info!(
            conflict_id = %ctx.conflict.id,
            strategy = %strategy,
            confidence = draft.confidence,
            "Resolution drafted"
        );
        Ok(draft)
    }

    fn source_priority(
        &self,
        ctx: ResolutionContext<'_>,
        options: &ResolveOptions,
        policy: &SourcePolicy,
    ) -> Result<RuleResult, ResolverError> {
        let order = priority_order(ctx.conflict, options.priority_order.as_deref(), policy);
        source_priority(ctx.conflict, ctx.items, order)
    }

    fn weighted_truth(
        &self,
        ctx: ResolutionContext<'_>,
        options: &ResolveOptions,
        policy: &SourcePolicy,
    ) -> Result<RuleResult, ResolverError> {
        let weights = normalize_weights(ctx.items, options.source_weights.as_ref(), policy)?;
        weighted_truth(ctx.items, weights, self.config.vote_tie_tolerance)
    }

    async fn ai_consensus(
        &self,
        ctx: ResolutionContext<'_>,
        rule_outcomes: Vec<RuleOutcome>,
    ) -> Result<ResolutionDraft, ResolverError> {
        let request = NarrativeRequest {
            conflict_id: ctx.conflict.id.clone(),
            conflict_type: ctx.conflict.conflict_type,
            title: ctx.conflict.title.clone(),
            items: ctx
                .items
                .iter()
                .map(|i| ItemContext {
                    source_system: i.source_system.clone(),
                    text: i.text().to_string(),
                    confidence: i.confidence,
                    claim: i.claim.clone(),
                })
                .collect(),
            analysis: ctx.analysis.cloned(),
            rule_outcomes,
        };

        let (generated, attempts) = self.generate_with_retry(&request).await?;
        let narrative = generated.narrative.trim();
        if narrative.is_empty() {
            return Err(ResolverError::Generation {
                error: GenerationError::Malformed("empty narrative".to_string()),
                attempts,
            });
        }
        if !generated.confidence.is_finite() {
            return Err(ResolverError::Generation {
                error: GenerationError::Malformed(format!(
                    "confidence {} is not a number",
                    generated.confidence
                )),
                attempts,
            });
        }

        let summary = generated
            .summary
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or_else(|| narrative.lines().next())
            .unwrap_or(narrative)
            .to_string();

        let mut rationale = format!("generated by {}", generated.model);
        if attempts > 1 {
            rationale.push_str(&format!(" after {} attempts", attempts));
        }
        if generated.confidence != generated.confidence.clamp(0.0, 1.0) {
            rationale.push_str(&format!(
                "; reported confidence {} clamped to [0, 1]",
                generated.confidence
            ));
        }

        Ok(ResolutionDraft {
            strategy: ResolutionStrategy::AiConsensus,
            resolved_summary: summary,
            consensus_narrative: narrative.to_string(),
            recommended_actions: generated.recommended_actions,
            confidence: generated.confidence.clamp(0.0, 1.0),
            rationale,
            source_weights: None,
            priority_order: None,
            provenance: GenerationProvenance {
                generated_by: GeneratedBy::Llm,
                model: Some(generated.model),
                prompt_tokens: generated.prompt_tokens,
                completion_tokens: generated.completion_tokens,
            },
        })
    }

    async fn generate_with_retry(
        &self,
        request: &NarrativeRequest,
    ) -> Result<(GeneratedNarrative, u32), ResolverError> {
        let generator = self.generator.as_ref().ok_or_else(|| ResolverError::Generation {
            error: GenerationError::Unavailable("no narrative generator configured".to_string()),
            attempts: 0,
        })?;

        let mut retry = 0u32;
        loop {
            match generator.generate(request).await {
                Ok(generated) => return Ok((generated, retry + 1)),
                Err(error) if error.is_transient() && retry < self.config.max_retries => {
                    let backoff = self.config.backoff(retry);
                    warn!(
                        conflict_id = %request.conflict_id,
                        class = error.class(),
                        retry = retry + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        "Generation failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    retry += 1;
                }
                Err(error) => {
                    warn!(
                        conflict_id = %request.conflict_id,
                        class = error.class(),
                        attempts = retry + 1,
                        "Generation failed"
                    );
                    return Err(ResolverError::Generation {
                        error,
                        attempts: retry + 1,
                    });
                }
            }
        }
    }

    async fn hybrid(
        &self,
        ctx: ResolutionContext<'_>,
        options: &ResolveOptions,
        policy: &SourcePolicy,
    ) -> Result<ResolutionDraft, ResolverError> {
        let (priority, weighted) = tokio::join!(
            async { self.source_priority(ctx, options, policy) },
            async { self.weighted_truth(ctx, options, policy) },
        );
        let (priority, weighted) = (priority?, weighted?);

        let disagreement = disagreement(&priority, &weighted);
        debug!(
            conflict_id = %ctx.conflict.id,
            disagreement,
            "Rule strategies compared"
        );

        let outcomes = vec![
            RuleOutcome {
                strategy: ResolutionStrategy::SourcePriority,
                summary: priority.summary.clone(),
                confidence: priority.confidence,
            },
            RuleOutcome {
                strategy: ResolutionStrategy::WeightedTruth,
                summary: weighted.summary.clone(),
                confidence: weighted.confidence,
            },
        ];
        let ai = self.ai_consensus(ctx, outcomes).await?;

        let mut confidence = ai.confidence;
        let mut rationale = vec![
            format!("source_priority: {}", priority.rationale.join("; ")),
            format!("weighted_truth: {}", weighted.rationale.join("; ")),
            ai.rationale,
        ];
        if disagreement > self.config.hybrid_disagreement_threshold {
            confidence *= 1.0 - self.config.hybrid_confidence_penalty;
            rationale.push(format!(
                "source_priority and weighted_truth disagree ({:.2} > {:.2}); confidence demoted by {:.0}%",
                disagreement,
                self.config.hybrid_disagreement_threshold,
                self.config.hybrid_confidence_penalty * 100.0
            ));
        }

        Ok(ResolutionDraft {
            strategy: ResolutionStrategy::Hybrid,
            resolved_summary: ai.resolved_summary,
            consensus_narrative: ai.consensus_narrative,
            recommended_actions: ai.recommended_actions,
            confidence: confidence.clamp(0.0, 1.0),
            rationale: rationale.join("; "),
            source_weights: weighted.source_weights,
            priority_order: priority.priority_order,
            provenance: GenerationProvenance {
                generated_by: GeneratedBy::Hybrid,
                ..ai.provenance
            },
        })
    }
}

/// Disagreement in `[0, 1]` between two rule results.
///
/// Compared per shared metric: relative delta for numeric values, 0 or 1 for
/// categorical ones; the maximum wins. Without shared metrics the summaries
/// are compared textually.
pub fn disagreement(a: &RuleResult, b: &RuleResult) -> f64 {
    let shared: Vec<f64> = a
        .values
        .iter()
        .filter_map(|(metric, left)| {
            let right = b.values.get(metric)?;
            Some(match (left, right) {
                (Consensus::Numeric(x), Consensus::Numeric(y)) => {
                    let scale = x.abs().max(y.abs());
                    if scale <= f64::EPSILON {
                        0.0
                    } else {
                        ((x - y).abs() / scale).min(1.0)
                    }
                }
                (l, r) if l == r => 0.0,
                _ => 1.0,
            })
        })
        .collect();

    if shared.is_empty() {
        1.0 - similarity(
            &InsightVector::new(&a.summary),
            &InsightVector::new(&b.summary),
        )
        .value
    } else {
        shared.into_iter().fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use concord_model::{
        Claim, ClaimValue, ConflictStatus, ConflictType, CreateConflictItemInput, EntityKind,
        EntityRef, ItemRole, Severity,
    };

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn conflict() -> Conflict {
        Conflict {
            id: ConflictId::new("c-1"),
            organization_id: "org".into(),
            conflict_type: ConflictType::Contradiction,
            severity: Severity::Medium,
            status: ConflictStatus::Analyzing,
            title: "Acme sentiment".into(),
            summary: String::new(),
            source_entities: vec![EntityRef::new(EntityKind::Brand, "acme")],
            affected_systems: vec!["governance".into(), "media_monitoring".into()],
            analysis: None,
            resolved_at: None,
            resolved_by: None,
            dismissed_reason: None,
            cluster_id: None,
            cluster_similarity: None,
            root_cause: None,
            reality_map_nodes: None,
            created_at: at(),
            updated_at: at(),
            version: 1,
        }
    }

    fn sentiment(source: &str, value: &str, confidence: f64) -> ConflictItem {
        ConflictItem::from_input(
            ConflictId::new("c-1"),
            CreateConflictItemInput {
                entity: EntityRef::new(EntityKind::Brand, "acme"),
                raw_text: format!("Acme coverage is {}", value),
                processed_text: None,
                embedding: None,
                source_system: source.into(),
                source_timestamp: Some(at()),
                confidence,
                role: None,
                claim: Some(Claim::new("sentiment", ClaimValue::Categorical(value.into()))),
            },
            ItemRole::Secondary,
            at(),
        )
    }

    fn narrative(text: &str, confidence: f64) -> GeneratedNarrative {
        GeneratedNarrative {
            summary: None,
            narrative: text.into(),
            recommended_actions: vec![],
            confidence,
            model: "test-model".into(),
            prompt_tokens: Some(100),
            completion_tokens: Some(20),
        }
    }

    fn fast() -> ResolverConfig {
        ResolverConfig {
            retry_backoff_ms: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ai_consensus_clamps_confidence() {
        let resolver = ConflictResolver::new(fast())
            .unwrap()
            .with_generator(Arc::new(ScriptedGenerator::always("Coverage is mixed.", 1.7)));
        let c = conflict();
        let items = vec![sentiment("media_monitoring", "positive", 0.8)];
        let draft = resolver
            .resolve(
                ResolutionContext {
                    conflict: &c,
                    items: &items,
                    analysis: None,
                },
                ResolutionStrategy::AiConsensus,
                &ResolveOptions::default(),
                &SourcePolicy::default(),
            )
            .await
            .unwrap();
        assert_eq!(draft.confidence, 1.0);
        assert_eq!(draft.resolved_summary, "Coverage is mixed.");
        assert_eq!(draft.provenance.generated_by, GeneratedBy::Llm);
        assert!(draft.rationale.contains("clamped"));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Err(GenerationError::Timeout("t".into())),
            Err(GenerationError::RateLimited("r".into())),
            Ok(narrative("Settled.", 0.7)),
        ]));
        let resolver = ConflictResolver::new(fast())
            .unwrap()
            .with_generator(generator.clone());
        let c = conflict();
        let items = vec![sentiment("media_monitoring", "positive", 0.8)];
        let draft = resolver
            .resolve(
                ResolutionContext {
                    conflict: &c,
                    items: &items,
                    analysis: None,
                },
                ResolutionStrategy::AiConsensus,
                &ResolveOptions::default(),
                &SourcePolicy::default(),
            )
            .await
            .unwrap();
        assert_eq!(generator.calls(), 3);
        assert!(draft.rationale.contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let generator = Arc::new(ScriptedGenerator::new(vec![Err(GenerationError::Timeout(
            "t".into(),
        ))]));
        let resolver = ConflictResolver::new(fast())
            .unwrap()
            .with_generator(generator.clone());
        let c = conflict();
        let items = vec![sentiment("media_monitoring", "positive", 0.8)];
        let err = resolver
            .resolve(
                ResolutionContext {
                    conflict: &c,
                    items: &items,
                    analysis: None,
                },
                ResolutionStrategy::AiConsensus,
                &ResolveOptions::default(),
                &SourcePolicy::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(generator.calls(), 3);
        assert!(matches!(err, ResolverError::Generation { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_malformed_output_is_not_retried() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Err(GenerationError::Malformed("not json".into())),
            Ok(narrative("never reached", 0.5)),
        ]));
        let resolver = ConflictResolver::new(fast())
            .unwrap()
            .with_generator(generator.clone());
        let c = conflict();
        let items = vec![sentiment("media_monitoring", "positive", 0.8)];
        let result = resolver
            .resolve(
                ResolutionContext {
                    conflict: &c,
                    items: &items,
                    analysis: None,
                },
                ResolutionStrategy::AiConsensus,
                &ResolveOptions::default(),
                &SourcePolicy::default(),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_narrative_is_rejected() {
        let resolver = ConflictResolver::new(fast())
            .unwrap()
            .with_generator(Arc::new(ScriptedGenerator::always("   ", 0.9)));
        let c = conflict();
        let items = vec![sentiment("media_monitoring", "positive", 0.8)];
        let err = resolver
            .resolve(
                ResolutionContext {
                    conflict: &c,
                    items: &items,
                    analysis: None,
                },
                ResolutionStrategy::AiConsensus,
                &ResolveOptions::default(),
                &SourcePolicy::default(),
            )
            .await
            .unwrap_err();
        match err {
            ResolverError::Generation { error, .. } => {
                assert!(matches!(error, GenerationError::Malformed(_)))
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_hybrid_demotes_on_disagreement() {
        let resolver = ConflictResolver::new(fast())
            .unwrap()
            .with_generator(Arc::new(ScriptedGenerator::always("Mostly negative.", 0.8)));
        let c = conflict();
        let items = vec![
            sentiment("media_monitoring", "positive", 0.6),
            sentiment("governance", "negative", 0.9),
            sentiment("risk_forecasting", "negative", 0.7),
        ];
        let draft = resolver
            .resolve(
                ResolutionContext {
                    conflict: &c,
                    items: &items,
                    analysis: None,
                },
                ResolutionStrategy::Hybrid,
                &ResolveOptions::default(),
                &SourcePolicy::default(),
            )
            .await
            .unwrap();
        assert!((draft.confidence - 0.72).abs() < 1e-9);
        assert!(draft.rationale.contains("disagree"));
        assert_eq!(draft.provenance.generated_by, GeneratedBy::Hybrid);
        assert!(draft.source_weights.is_some());
        assert!(draft.priority_order.is_some());
    }

    #[tokio::test]
    async fn test_ai_without_generator_is_generation_error() {
        let resolver = ConflictResolver::new(fast()).unwrap();
        let c = conflict();
        let items = vec![sentiment("media_monitoring", "positive", 0.8)];
        let err = resolver
            .resolve(
                ResolutionContext {
                    conflict: &c,
                    items: &items,
                    analysis: None,
                },
                ResolutionStrategy::AiConsensus,
                &ResolveOptions::default(),
                &SourcePolicy::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResolverError::Generation {
                error: GenerationError::Unavailable(_),
                attempts: 0
            }
        ));
    }

    #[test]
    fn test_draft_materializes_unaccepted() {
        let draft = ResolutionDraft {
            strategy: ResolutionStrategy::WeightedTruth,
            resolved_summary: "s".into(),
            consensus_narrative: "n".into(),
            recommended_actions: vec![],
            confidence: 0.5,
            rationale: "r".into(),
            source_weights: None,
            priority_order: None,
            provenance: GenerationProvenance::rule(),
        };
        let resolution = draft.into_resolution(ConflictId::new("c"), at());
        assert!(!resolution.is_accepted());
        assert!(resolution.superseded_at.is_none());
    }
}
