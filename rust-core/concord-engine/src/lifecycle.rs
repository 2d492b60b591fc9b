// SPDX-License-Identifier: PMPL-1.0-or-later
//! Analysis, resolution, review and dismissal.
//!
//! Each operation owns the conflict's writer slot from first read to commit.
//! Status changes go through [`Conflict::transition`], and every change is
//! written as its own audit entry with before/after snapshots.

use std::time::Duration;

use concord_analyzer::AnalysisInput;
use concord_audit::{AuditEvent, AuditEventType};
use concord_graph::ConflictSignature;
use concord_model::{
    Actor, Conflict, ConflictAnalysisResult, ConflictId, ConflictStatus,
    InsightConflictResolution, InvalidTransition, ResolutionId, ResolutionStrategy,
};
use concord_resolver::{ResolutionContext, ResolveOptions};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::{snapshot, Commit, ConcordEngine, EngineError};

#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    /// Overrides the configured operation timeout
    pub timeout: Option<Duration>,
    pub actor: Option<Actor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeOutcome {
    pub conflict: Conflict,
    pub analysis: ConflictAnalysisResult,
}

#[derive(Debug, Clone, Default)]
pub struct ResolveRequest {
    pub options: ResolveOptions,
    /// Accept the new resolution and resolve the conflict in one commit
    pub auto_accept: bool,
    pub timeout: Option<Duration>,
    pub actor: Option<Actor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveOutcome {
    pub conflict: Conflict,
    pub resolution: InsightConflictResolution,
}

#[derive(Debug, Clone)]
pub struct ReviewDecision {
    pub accept: bool,
    pub notes: Option<String>,
    pub reviewer: Actor,
}

impl ReviewDecision {
    pub fn accept(reviewer: Actor) -> Self {
        Self {
            accept: true,
            notes: None,
            reviewer,
        }
    }

    pub fn reject(reviewer: Actor, notes: impl Into<String>) -> Self {
        Self {
            accept: false,
            notes: Some(notes.into()),
            reviewer,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub conflict: Conflict,
    pub resolution: InsightConflictResolution,
}

/// Per-id outcome of a batch operation
#[derive(Debug)]
pub struct BatchResult<T> {
    pub conflict_id: ConflictId,
    pub result: Result<T, EngineError>,
}

impl<T> BatchResult<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

fn transition_error(id: &ConflictId) -> impl Fn(InvalidTransition) -> EngineError + '_ {
    move |e| EngineError::state(id, e.from, e.to_string())
}

impl ConcordEngine {
    // -----------------------------------------------------------------------
    // Analysis
    // -----------------------------------------------------------------------

    /// Analyze an open conflict. A `detected` conflict moves to `analyzing`.
    pub async fn analyze_conflict(
        &self,
        id: &ConflictId,
        options: AnalyzeOptions,
    ) -> Result<AnalyzeOutcome, EngineError> {
        let result = self.analyze_inner(id, options).await;
        self.tally("analyze_conflict", result)
    }

    async fn analyze_inner(
        &self,
        id: &ConflictId,
        options: AnalyzeOptions,
    ) -> Result<AnalyzeOutcome, EngineError> {
        let actor = options.actor.unwrap_or_else(Actor::system);
        let _guard = self.locks.acquire(id, self.config.lock_wait()).await?;

        let (conflict, items, candidates, cadence) = {
            let state = self.state.read().await;
            let conflict = state.conflict(id)?.clone();
            if !conflict.status.is_open() {
                return Err(EngineError::state(
                    id,
                    conflict.status,
                    "only open conflicts can be analyzed",
                ));
            }
            let candidates: Vec<ConflictSignature> = state
                .open_conflicts(&conflict.organization_id)
                .into_iter()
                .filter(|c| &c.id != id)
                .map(|c| ConflictSignature::from_items(c, state.items_of(&c.id)))
                .collect();
            let cadence = state.cadence_for(&conflict.organization_id, &conflict.source_entities);
            (conflict, state.items_of(id).to_vec(), candidates, cadence)
        };

        let as_of = self.clock.now();
        let analysis = self
            .time_boxed(id, "analyze", options.timeout, &actor, async {
                Ok(self.analyzer.analyze(&AnalysisInput {
                    conflict: &conflict,
                    items: &items,
                    candidates: &candidates,
                    policy: &self.config.policy,
                    cadence,
                    as_of,
                }))
            })
            .await?;

        let now = self.clock.now();
        let before = snapshot(&conflict);
        let mut updated = conflict;
        updated.severity = analysis.severity;
        updated.root_cause = analysis.root_causes.first().cloned();
        updated.analysis = Some(analysis.clone());
        if updated.status == ConflictStatus::Detected {
            updated
                .transition(ConflictStatus::Analyzing, now)
                .map_err(transition_error(id))?;
        } else {
            updated.touch(now);
        }

        let event = AuditEvent::new(id.clone(), AuditEventType::Analyzed, actor, now)
            .with_states(Some(before), Some(snapshot(&updated)))
            .with_details(json!({
                "severity_score": analysis.severity_score,
                "suggested_strategy": analysis.suggested_strategy,
                "difficulty": analysis.difficulty,
                "root_causes": analysis.root_causes.len(),
                "related_conflicts": analysis.related_conflicts.len(),
            }));
        let mut commit = Commit::conflict(updated.clone());
        commit.events.push(event);
        self.commit(commit).await?;

        info!(
            conflict_id = %id,
            severity = %updated.severity,
            score = analysis.severity_score,
            strategy = %analysis.suggested_strategy,
            "Conflict analyzed"
        );
        Ok(AnalyzeOutcome {
            conflict: updated,
            analysis,
        })
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    /// Produce a resolution. Without an explicit strategy the analysis'
    /// suggestion is used. A `detected` conflict moves to `analyzing` in the
    /// same commit.
    pub async fn resolve_conflict(
        &self,
        id: &ConflictId,
        strategy: Option<ResolutionStrategy>,
        request: ResolveRequest,
    ) -> Result<ResolveOutcome, EngineError> {
        let result = self.resolve_inner(id, strategy, request).await;
        self.tally("resolve_conflict", result)
    }

    async fn resolve_inner(
        &self,
        id: &ConflictId,
        strategy: Option<ResolutionStrategy>,
        request: ResolveRequest,
    ) -> Result<ResolveOutcome, EngineError> {
        let actor = request.actor.clone().unwrap_or_else(Actor::system);
        let _guard = self.locks.acquire(id, self.config.lock_wait()).await?;

        let (conflict, items, existing) = {
            let state = self.state.read().await;
            let conflict = state.conflict(id)?.clone();
            if !conflict.status.is_open() {
                return Err(EngineError::state(
                    id,
                    conflict.status,
                    "only open conflicts can be resolved",
                ));
            }
            (
                conflict,
                state.items_of(id).to_vec(),
                state.resolutions_of(id).to_vec(),
            )
        };
        let strategy = strategy
            .or_else(|| conflict.analysis.as_ref().map(|a| a.suggested_strategy))
            .ok_or_else(|| {
                EngineError::invalid(id, "no strategy given and the conflict has not been analyzed")
            })?;

        let draft = self
            .time_boxed(id, "resolve", request.timeout, &actor, async {
                self.resolver
                    .resolve(
                        ResolutionContext {
                            conflict: &conflict,
                            items: &items,
                            analysis: conflict.analysis.as_ref(),
                        },
                        strategy,
                        &request.options,
                        &self.config.policy,
                    )
                    .await
                    .map_err(|source| EngineError::Resolver {
                        conflict_id: id.clone(),
                        source,
                    })
            })
            .await?;

        let now = self.clock.now();
        let mut resolution = draft.into_resolution(id.clone(), now);
        let mut updated = conflict;
        let mut commit = Commit::default();

        if updated.status == ConflictStatus::Detected {
            commit
                .events
                .push(self.status_event(&mut updated, ConflictStatus::Analyzing, &actor)?);
        } else {
            updated.touch(now);
        }
        commit.events.push(
            AuditEvent::new(id.clone(), AuditEventType::ResolutionCreated, actor.clone(), now)
                .with_details(json!({
                    "resolution_id": resolution.id,
                    "strategy": resolution.strategy,
                    "confidence": resolution.confidence,
                    "generated_by": resolution.provenance.generated_by,
                })),
        );

        if request.auto_accept {
            self.stage_acceptance(&mut updated, &mut resolution, &existing, &actor, &mut commit)?;
        }

        commit.resolutions.push(resolution.clone());
        commit.conflict = Some(updated.clone());
        self.commit(commit).await?;

        if let Some(metrics) = &self.metrics {
            metrics.resolutions_created.inc();
        }
        info!(
            conflict_id = %id,
            resolution_id = %resolution.id,
            strategy = %strategy,
            confidence = resolution.confidence,
            accepted = resolution.is_accepted(),
            "Conflict resolution created"
        );
        Ok(ResolveOutcome {
            conflict: updated,
            resolution,
        })
    }

    /// Accept or reject a resolution.
    ///
    /// Accepting supersedes the previously accepted resolution, if any, and
    /// resolves an `analyzing` conflict. Accepting the already accepted
    /// resolution changes nothing. The accepted resolution cannot be
    /// rejected; accept another one instead. Resolutions of a dismissed
    /// conflict cannot be reviewed at all.
    pub async fn review_resolution(
        &self,
        resolution_id: &ResolutionId,
        decision: ReviewDecision,
    ) -> Result<ReviewOutcome, EngineError> {
        let result = self.review_inner(resolution_id, decision).await;
        self.tally("review_resolution", result)
    }

    async fn review_inner(
        &self,
        resolution_id: &ResolutionId,
        decision: ReviewDecision,
    ) -> Result<ReviewOutcome, EngineError> {
        let conflict_id = {
            let state = self.state.read().await;
            state
                .resolution_index
                .get(resolution_id)
                .cloned()
                .ok_or_else(|| EngineError::not_found("Resolution", resolution_id))?
        };
        let id = &conflict_id;
        let _guard = self.locks.acquire(id, self.config.lock_wait()).await?;

        let (conflict, existing) = {
            let state = self.state.read().await;
            (state.conflict(id)?.clone(), state.resolutions_of(id).to_vec())
        };
        let mut target = existing
            .iter()
            .find(|r| &r.id == resolution_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("Resolution", resolution_id))?;

        // Dismissal freezes the resolutions; review needs a conflict that has
        // been through analysis.
        if !matches!(
            conflict.status,
            ConflictStatus::Analyzing | ConflictStatus::Resolved
        ) {
            return Err(EngineError::state(
                id,
                conflict.status,
                "resolutions can only be reviewed while analyzing or resolved",
            ));
        }

        let now = self.clock.now();
        let mut updated = conflict;
        let mut commit = Commit::default();
        let reviewer = decision.reviewer;

        if decision.accept {
            if target.is_accepted() {
                return Ok(ReviewOutcome {
                    conflict: updated,
                    resolution: target,
                });
            }
            mark_reviewed(&mut target, &reviewer, decision.notes, now);
            self.stage_acceptance(&mut updated, &mut target, &existing, &reviewer, &mut commit)?;
        } else {
            if target.is_accepted() {
                return Err(EngineError::state(
                    id,
                    updated.status,
                    "the accepted resolution cannot be rejected; accept another one instead",
                ));
            }
            mark_reviewed(&mut target, &reviewer, decision.notes.clone(), now);
            updated.touch(now);
            commit.events.push(
                AuditEvent::new(id.clone(), AuditEventType::ResolutionRejected, reviewer.clone(), now)
                    .with_details(json!({
                        "resolution_id": target.id,
                        "notes": decision.notes,
                    })),
            );
        }

        commit.resolutions.push(target.clone());
        commit.conflict = Some(updated.clone());
        self.commit(commit).await?;

        info!(
            conflict_id = %id,
            resolution_id = %resolution_id,
            accepted = target.is_accepted(),
            reviewer = %reviewer.id,
            status = %updated.status,
            "Resolution reviewed"
        );
        Ok(ReviewOutcome {
            conflict: updated,
            resolution: target,
        })
    }

    /// Stage acceptance of `resolution`: supersede whatever is accepted now,
    /// accept, and resolve an `analyzing` conflict.
    fn stage_acceptance(
        &self,
        conflict: &mut Conflict,
        resolution: &mut InsightConflictResolution,
        existing: &[InsightConflictResolution],
        actor: &Actor,
        commit: &mut Commit,
    ) -> Result<(), EngineError> {
        let now = self.clock.now();
        for prior in existing
            .iter()
            .filter(|r| r.is_accepted() && r.id != resolution.id)
        {
            let mut prior = prior.clone();
            prior.supersede(now);
            commit.events.push(
                AuditEvent::new(
                    conflict.id.clone(),
                    AuditEventType::ResolutionSuperseded,
                    actor.clone(),
                    now,
                )
                .with_details(json!({
                    "resolution_id": prior.id,
                    "superseded_by": resolution.id,
                })),
            );
            commit.resolutions.push(prior);
        }

        resolution.accept(now);
        commit.events.push(
            AuditEvent::new(
                conflict.id.clone(),
                AuditEventType::ResolutionAccepted,
                actor.clone(),
                now,
            )
            .with_details(json!({ "resolution_id": resolution.id })),
        );

        match conflict.status {
            ConflictStatus::Analyzing => {
                commit
                    .events
                    .push(self.status_event(conflict, ConflictStatus::Resolved, actor)?);
            }
            _ => conflict.touch(now),
        }
        conflict.resolved_at = Some(now);
        conflict.resolved_by = Some(actor.id.clone());
        Ok(())
    }

    /// Transition `conflict` and describe the change.
    fn status_event(
        &self,
        conflict: &mut Conflict,
        next: ConflictStatus,
        actor: &Actor,
    ) -> Result<AuditEvent, EngineError> {
        let now = self.clock.now();
        let before = snapshot(conflict);
        conflict
            .transition(next, now)
            .map_err(transition_error(&conflict.id))?;
        Ok(
            AuditEvent::new(conflict.id.clone(), AuditEventType::StatusChanged, actor.clone(), now)
                .with_states(Some(before), Some(snapshot(conflict))),
        )
    }

    // -----------------------------------------------------------------------
    // Dismissal
    // -----------------------------------------------------------------------

    /// Dismiss an open conflict. Its resolutions are left as they are.
    pub async fn dismiss_conflict(
        &self,
        id: &ConflictId,
        reason: &str,
        actor: Actor,
    ) -> Result<Conflict, EngineError> {
        let result = self.dismiss_inner(id, reason, actor).await;
        self.tally("dismiss_conflict", result)
    }

    async fn dismiss_inner(
        &self,
        id: &ConflictId,
        reason: &str,
        actor: Actor,
    ) -> Result<Conflict, EngineError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EngineError::invalid(id, "a dismissal reason is required"));
        }
        let _guard = self.locks.acquire(id, self.config.lock_wait()).await?;
        let mut conflict = {
            let state = self.state.read().await;
            state.conflict(id)?.clone()
        };
        if !conflict.status.is_open() {
            return Err(EngineError::state(
                id,
                conflict.status,
                "only open conflicts can be dismissed",
            ));
        }

        let event = self
            .status_event(&mut conflict, ConflictStatus::Dismissed, &actor)?
            .with_details(json!({ "reason": reason }));
        let event = AuditEvent {
            event_type: AuditEventType::Dismissed,
            ..event
        };
        conflict.dismissed_reason = Some(reason.to_string());
        let mut commit = Commit::conflict(conflict.clone());
        commit.events.push(event);
        self.commit(commit).await?;

        info!(conflict_id = %id, actor = %actor.id, reason, "Conflict dismissed");
        Ok(conflict)
    }

    // -----------------------------------------------------------------------
    // Batches
    // -----------------------------------------------------------------------

    /// Analyze each id independently; failures do not stop the batch.
    pub async fn batch_analyze(
        &self,
        ids: &[ConflictId],
        options: AnalyzeOptions,
    ) -> Vec<BatchResult<AnalyzeOutcome>> {
        join_all(ids.iter().map(|id| {
            let options = options.clone();
            async move {
                BatchResult {
                    conflict_id: id.clone(),
                    result: self.analyze_conflict(id, options).await,
                }
            }
        }))
        .await
    }

    pub async fn batch_resolve(
        &self,
        ids: &[ConflictId],
        strategy: Option<ResolutionStrategy>,
        request: ResolveRequest,
    ) -> Vec<BatchResult<ResolveOutcome>> {
        join_all(ids.iter().map(|id| {
            let request = request.clone();
            async move {
                BatchResult {
                    conflict_id: id.clone(),
                    result: self.resolve_conflict(id, strategy, request).await,
                }
            }
        }))
        .await
    }

    pub async fn batch_dismiss(
        &self,
        ids: &[ConflictId],
        reason: &str,
        actor: Actor,
    ) -> Vec<BatchResult<Conflict>> {
        join_all(ids.iter().map(|id| {
            let actor = actor.clone();
            async move {
                BatchResult {
                    conflict_id: id.clone(),
                    result: self.dismiss_conflict(id, reason, actor).await,
                }
            }
        }))
        .await
    }
}

fn mark_reviewed(
    resolution: &mut InsightConflictResolution,
    reviewer: &Actor,
    notes: Option<String>,
    now: chrono::DateTime<chrono::Utc>,
) {
    resolution.review.reviewed = true;
    resolution.review.reviewer = Some(reviewer.id.clone());
    resolution.review.notes = notes;
    resolution.review.reviewed_at = Some(now);
}
