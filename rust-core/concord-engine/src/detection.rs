// SPDX-License-Identifier: PMPL-1.0-or-later
//! Insight ingestion, replay and reporting-gap backfill.

use std::time::Duration;

use chrono::{DateTime, Utc};
use concord_audit::{AuditEvent, AuditEventType};
use concord_detector::{
    initial_severity, normalize, ConflictDetector, DetectionDecision, DetectorConfig,
    Disagreement, LoggedInsight, NormalizedInsight, OpenConflictView, ReportingGap, SourcePayload,
    TrackedEntity,
};
use concord_model::{
    check_shared_dimension, Actor, Conflict, ConflictId, ConflictItem, ConflictType, ErrorKind,
    ItemId, ItemRole, Severity,
};
use concord_similarity::SimilarityScore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::query::DateRange;
use crate::{creation_events, snapshot, to_json, Commit, ConcordEngine, Deadline, EngineError};

/// One rejected insight of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightFailure {
    /// Position in the submitted batch
    pub index: usize,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushSummary {
    pub conflicts_created: Vec<ConflictId>,
    /// Pre-existing conflicts that gained items
    pub conflicts_extended: Vec<ConflictId>,
    /// Insights logged without joining or opening a conflict
    pub independent: usize,
    pub errors: Vec<InsightFailure>,
    /// The deadline passed; the remaining insights are reported as
    /// `timeout_error` failures and were not placed.
    #[serde(default)]
    pub timed_out: bool,
}

/// Parameters of a replay/backfill pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionRun {
    pub organization_id: Option<String>,
    /// Restrict replay and gap checks to these systems; empty means all
    pub target_systems: Vec<String>,
    /// Replay window over observation times. `to` is also the instant gap
    /// checks are evaluated at.
    pub range: DateRange,
    /// Detector settings for this pass only
    pub detector: Option<DetectorConfig>,
    /// Overrides the configured operation timeout
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionReport {
    pub conflicts_detected: usize,
    pub conflicts: Vec<Conflict>,
    pub errors: Vec<String>,
}

enum Placement {
    Created(ConflictId),
    Extended(ConflictId),
    Independent,
}

/// Why an insight joins an existing conflict
struct Join {
    role: ItemRole,
    similarity: SimilarityScore,
    reason: Disagreement,
}

impl PushSummary {
    /// Report insights `from..total` as unplaced after the deadline.
    fn expire(&mut self, from: usize, total: usize, error: &EngineError) {
        self.timed_out = true;
        self.errors.extend((from..total).map(|index| InsightFailure {
            index,
            kind: ErrorKind::Timeout,
            message: error.to_string(),
        }));
    }
}

impl ConcordEngine {
    /// Normalize and place each payload in order. Invalid payloads are
    /// reported by index and never stop the batch.
    pub async fn push_insight_batch(&self, payloads: Vec<SourcePayload>) -> PushSummary {
        self.push_insight_batch_within(payloads, None).await
    }

    /// [`push_insight_batch`](Self::push_insight_batch) under a deadline.
    ///
    /// Placements committed before the deadline stand. From the first
    /// insight that misses it, every remaining insight is reported as a
    /// timeout failure; one already normalized is kept in the insight log so
    /// a later replay can place it.
    pub async fn push_insight_batch_within(
        &self,
        payloads: Vec<SourcePayload>,
        timeout: Option<Duration>,
    ) -> PushSummary {
        let deadline = self.deadline("push_insight_batch", timeout);
        let _pass = self.detection.lock().await;
        let mut summary = PushSummary::default();
        let total = payloads.len();

        for (index, payload) in payloads.into_iter().enumerate() {
            if let Err(e) = deadline.check() {
                summary.expire(index, total, &e);
                self.count_failure(ErrorKind::Timeout);
                break;
            }
            let insight = match normalize(payload, self.config.embedding_dimension) {
                Ok(insight) => insight,
                Err(e) => {
                    warn!(index, error = %e, "Rejected insight");
                    self.count_failure(ErrorKind::Validation);
                    summary.errors.push(InsightFailure {
                        index,
                        kind: ErrorKind::Validation,
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let observed_at = insight.observed_at(self.clock.now());
            self.state
                .write()
                .await
                .insight_log
                .observe(&insight, observed_at);

            match self
                .place(&self.detector, insight, observed_at, None, &deadline)
                .await
            {
                Ok(Placement::Created(id)) => summary.conflicts_created.push(id),
                Ok(Placement::Extended(id)) => {
                    if !summary.conflicts_created.contains(&id)
                        && !summary.conflicts_extended.contains(&id)
                    {
                        summary.conflicts_extended.push(id);
                    }
                }
                Ok(Placement::Independent) => summary.independent += 1,
                Err(e @ EngineError::PassTimeout { .. }) => {
                    summary.expire(index, total, &e);
                    self.count_failure(ErrorKind::Timeout);
                    break;
                }
                Err(e) => {
                    let kind = e.kind();
                    warn!(index, kind = %kind, error = %e, "Insight placement failed");
                    self.count_failure(kind);
                    summary.errors.push(InsightFailure {
                        index,
                        kind,
                        message: e.to_string(),
                    });
                }
            }
        }

        if summary.timed_out {
            warn!(
                created = summary.conflicts_created.len(),
                extended = summary.conflicts_extended.len(),
                unplaced = summary.errors.iter().filter(|f| f.kind == ErrorKind::Timeout).count(),
                "Insight batch timed out"
            );
        }
        info!(
            created = summary.conflicts_created.len(),
            extended = summary.conflicts_extended.len(),
            independent = summary.independent,
            errors = summary.errors.len(),
            "Insight batch processed"
        );
        summary
    }

    /// Replay logged insights and check tracked entities for reporting gaps.
    pub async fn run_detection(&self, run: DetectionRun) -> Result<DetectionReport, EngineError> {
        let result = self.run_detection_inner(run).await;
        self.tally("run_detection", result)
    }

    async fn run_detection_inner(&self, run: DetectionRun) -> Result<DetectionReport, EngineError> {
        let deadline = self.deadline("run_detection", run.timeout);
        let detector = match run.detector {
            Some(config) => ConflictDetector::new(config)
                .map_err(|e| EngineError::validation(e.to_string()))?,
            None => self.detector.clone(),
        };
        let _pass = self.detection.lock().await;
        let as_of = run.range.to.unwrap_or_else(|| self.clock.now());
        let from = run.range.from.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let in_scope = |system: &str| {
            run.target_systems.is_empty() || run.target_systems.iter().any(|s| s == system)
        };

        let mut created = Vec::new();
        let mut errors = Vec::new();

        // Replay
        let pending: Vec<LoggedInsight> = {
            let state = self.state.read().await;
            let orgs: Vec<String> = match &run.organization_id {
                Some(org) => vec![org.clone()],
                None => state
                    .insight_log
                    .organizations()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            };
            let mut pending: Vec<LoggedInsight> = orgs
                .iter()
                .flat_map(|org| state.insight_log.between(org, from, as_of))
                .filter(|e| !e.paired && in_scope(&e.insight.item.source_system))
                .cloned()
                .collect();
            pending.sort_by(|a, b| a.observed_at.cmp(&b.observed_at).then_with(|| a.id.cmp(&b.id)));
            pending
        };

        for entry in pending {
            if let Err(e) = deadline.check() {
                return Err(self.abandon_run(e, &created));
            }
            let org = entry.insight.organization_id.clone();
            {
                // Claim the entry so it cannot pair with itself.
                let mut state = self.state.write().await;
                if state.insight_log.get(&org, &entry.id).map_or(true, |e| e.paired) {
                    continue;
                }
                state.insight_log.mark_paired(&org, &entry.id);
            }
            let placed = self
                .place(
                    &detector,
                    entry.insight,
                    entry.observed_at,
                    Some(entry.id.clone()),
                    &deadline,
                )
                .await;
            match placed {
                Ok(Placement::Created(id)) => created.push(id),
                Ok(Placement::Extended(_)) => {}
                Ok(Placement::Independent) => {
                    self.state.write().await.insight_log.release(&org, &entry.id);
                }
                Err(e) => {
                    self.state.write().await.insight_log.release(&org, &entry.id);
                    if matches!(e, EngineError::PassTimeout { .. }) {
                        return Err(self.abandon_run(e, &created));
                    }
                    errors.push(format!("insight {}: {}", entry.id, e));
                }
            }
        }

        // Reporting gaps
        let tracked: Vec<TrackedEntity> = {
            let state = self.state.read().await;
            state
                .tracked
                .iter()
                .filter(|t| {
                    run.organization_id
                        .as_ref()
                        .map_or(true, |org| &t.organization_id == org)
                        && (run.target_systems.is_empty() || t.systems.iter().any(|s| in_scope(s)))
                })
                .cloned()
                .collect()
        };
        for entity in tracked {
            if let Err(e) = deadline.check() {
                return Err(self.abandon_run(e, &created));
            }
            let gap = {
                let state = self.state.read().await;
                if state.has_open_gap(&entity.organization_id, &entity.entity) {
                    debug!(entity = %entity.entity, "Gap already open");
                    continue;
                }
                detector.check_reporting_gap(
                    &entity,
                    state
                        .insight_log
                        .last_reports(&entity.organization_id, &entity.entity),
                    as_of,
                )
            };
            let Some(gap) = gap else {
                continue;
            };
            match self.open_gap(&entity, gap, &deadline).await {
                Ok(id) => created.push(id),
                Err(e @ EngineError::PassTimeout { .. }) => {
                    return Err(self.abandon_run(e, &created));
                }
                Err(e) => errors.push(format!("tracked entity {}: {}", entity.entity, e)),
            }
        }

        let conflicts: Vec<Conflict> = {
            let state = self.state.read().await;
            created
                .iter()
                .filter_map(|id| state.conflicts.get(id).cloned())
                .collect()
        };
        info!(
            detected = conflicts.len(),
            errors = errors.len(),
            as_of = %as_of,
            "Detection pass complete"
        );
        Ok(DetectionReport {
            conflicts_detected: conflicts.len(),
            conflicts,
            errors,
        })
    }

    /// Attach, open or log one insight. `logged` names the insight-log entry
    /// being replayed, which is already claimed by the caller.
    async fn place(
        &self,
        detector: &ConflictDetector,
        insight: NormalizedInsight,
        observed_at: DateTime<Utc>,
        logged: Option<ItemId>,
        deadline: &Deadline,
    ) -> Result<Placement, EngineError> {
        let decision = {
            let state = self.state.read().await;
            let open = state.open_conflicts(&insight.organization_id);
            let views: Vec<OpenConflictView<'_>> = open
                .iter()
                .copied()
                .map(|c| OpenConflictView {
                    conflict: c,
                    items: state.items_of(&c.id),
                })
                .collect();
            detector.decide(&insight, &views, &state.insight_log, observed_at)
        };

        match decision {
            DetectionDecision::Attach {
                conflict_id,
                role,
                similarity,
                reason,
            } => {
                self.attach(
                    detector,
                    insight,
                    observed_at,
                    &conflict_id,
                    Join {
                        role,
                        similarity,
                        reason,
                    },
                    logged,
                    deadline,
                )
                .await
            }
            DetectionDecision::Open {
                peer_id,
                similarity,
                reason,
            } => {
                if let Err(e) = deadline.check() {
                    self.shelve(insight, observed_at, logged.as_ref()).await;
                    return Err(e);
                }
                self.open(detector, insight, peer_id, similarity, reason, logged)
                    .await
            }
            DetectionDecision::Independent => {
                if logged.is_none() {
                    let id = self
                        .state
                        .write()
                        .await
                        .insight_log
                        .push(insight, observed_at);
                    debug!(insight_id = %id, "Insight logged as independent");
                }
                Ok(Placement::Independent)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attach(
        &self,
        detector: &ConflictDetector,
        insight: NormalizedInsight,
        observed_at: DateTime<Utc>,
        conflict_id: &ConflictId,
        join: Join,
        logged: Option<ItemId>,
        deadline: &Deadline,
    ) -> Result<Placement, EngineError> {
        let Join {
            role,
            similarity,
            reason,
        } = join;
        let _guard = self.locks.acquire(conflict_id, self.config.lock_wait()).await?;
        if let Err(e) = deadline.check() {
            self.shelve(insight, observed_at, logged.as_ref()).await;
            return Err(e);
        }
        let now = self.clock.now();
        let organization_id = insight.organization_id.clone();

        let current = {
            let state = self.state.read().await;
            let conflict = state.conflict(conflict_id)?;
            conflict
                .status
                .is_open()
                .then(|| (conflict.clone(), state.items_of(conflict_id).to_vec()))
        };
        let Some((mut conflict, mut items)) = current else {
            // Closed while we waited for the slot.
            debug!(conflict_id = %conflict_id, "Join target closed; logging insight");
            self.shelve(insight, observed_at, logged.as_ref()).await;
            return Ok(Placement::Independent);
        };
        check_shared_dimension(&items, &insight.item)
            .map_err(|e| EngineError::invalid(conflict_id, e.to_string()))?;

        let item = ConflictItem::from_input(conflict_id.clone(), insight.item, role, now);
        let before = snapshot(&conflict);
        conflict.note_item(&item.entity, &item.source_system);
        items.push(item.clone());

        let coverage = {
            let state = self.state.read().await;
            state.coverage_for(&organization_id, &conflict.source_entities, now)
        };
        let previous_type = conflict.conflict_type;
        conflict.conflict_type = detector.classify(&items, &coverage);
        conflict.touch(now);

        let event = AuditEvent::new(
            conflict_id.clone(),
            AuditEventType::ItemAttached,
            Actor::system(),
            now,
        )
        .with_states(Some(before), Some(to_json(&item)?))
        .with_details(json!({
            "item_id": item.id,
            "role": item.role,
            "similarity": similarity.value,
            "approximate": similarity.approximate,
            "reason": reason.to_string(),
            "conflict_type": conflict.conflict_type,
            "previous_conflict_type": previous_type,
        }));

        let mut commit = Commit::conflict(conflict.clone());
        commit.items.push(item.clone());
        commit.events.push(event);
        if let Some(id) = logged {
            commit.paired.push((organization_id, id));
        }
        self.commit(commit).await?;

        if let Some(metrics) = &self.metrics {
            metrics.items_attached.inc();
        }
        info!(
            conflict_id = %conflict_id,
            item_id = %item.id,
            role = %role,
            conflict_type = %conflict.conflict_type,
            "Insight attached to conflict"
        );
        Ok(Placement::Extended(conflict_id.clone()))
    }

    async fn open(
        &self,
        detector: &ConflictDetector,
        insight: NormalizedInsight,
        peer_id: ItemId,
        similarity: SimilarityScore,
        reason: Disagreement,
        logged: Option<ItemId>,
    ) -> Result<Placement, EngineError> {
        let now = self.clock.now();
        let organization_id = insight.organization_id.clone();
        let peer = {
            let state = self.state.read().await;
            state
                .insight_log
                .get(&organization_id, &peer_id)
                .cloned()
                .ok_or_else(|| EngineError::Internal(format!("logged insight {} vanished", peer_id)))?
        };

        if let (Some(a), Some(b)) = (&peer.insight.item.embedding, &insight.item.embedding) {
            if a.len() != b.len() {
                return Err(EngineError::validation(format!(
                    "embedding dimension {} does not match paired insight {} ({})",
                    b.len(),
                    peer_id,
                    a.len()
                )));
            }
        }

        let mut conflict = Conflict::detected(
            organization_id.clone(),
            ConflictType::Inconsistency,
            Severity::Low,
            String::new(),
            String::new(),
            now,
        );
        let items = vec![
            ConflictItem::from_input(conflict.id.clone(), peer.insight.item, ItemRole::Primary, now),
            ConflictItem::from_input(conflict.id.clone(), insight.item, ItemRole::Secondary, now),
        ];
        for item in &items {
            conflict.note_item(&item.entity, &item.source_system);
        }
        let coverage = {
            let state = self.state.read().await;
            state.coverage_for(&organization_id, &conflict.source_entities, now)
        };
        conflict.conflict_type = detector.classify(&items, &coverage);
        conflict.severity = initial_severity(conflict.conflict_type, &coverage);
        conflict.title = detector.title(conflict.conflict_type, &items);
        conflict.summary = detector.summary(&items, &reason);

        let events = creation_events(
            &conflict,
            &items,
            &Actor::system(),
            json!({
                "origin": "detection",
                "peer_id": peer_id,
                "similarity": similarity.value,
                "approximate": similarity.approximate,
                "reason": reason.to_string(),
            }),
        )?;
        let mut paired = vec![(organization_id.clone(), peer_id)];
        if let Some(id) = logged {
            paired.push((organization_id, id));
        }
        self.commit(Commit {
            conflict: Some(conflict.clone()),
            items,
            events,
            paired,
            ..Default::default()
        })
        .await?;

        if let Some(metrics) = &self.metrics {
            metrics.conflicts_created.inc();
        }
        info!(
            conflict_id = %conflict.id,
            conflict_type = %conflict.conflict_type,
            severity = %conflict.severity,
            "Conflict detected"
        );
        Ok(Placement::Created(conflict.id))
    }

    async fn open_gap(
        &self,
        tracked: &TrackedEntity,
        gap: ReportingGap,
        deadline: &Deadline,
    ) -> Result<ConflictId, EngineError> {
        deadline.check()?;
        let now = self.clock.now();
        let mut conflict = Conflict::detected(
            tracked.organization_id.clone(),
            ConflictType::MissingData,
            gap.severity,
            gap.title,
            gap.summary,
            now,
        );
        let item = ConflictItem::from_input(conflict.id.clone(), gap.item, ItemRole::Primary, now);
        conflict.note_item(&item.entity, &item.source_system);
        for system in &gap.silent_systems {
            if !conflict.has_system(system) {
                conflict.affected_systems.push(system.clone());
            }
        }
        conflict.affected_systems.sort();

        let events = creation_events(
            &conflict,
            std::slice::from_ref(&item),
            &Actor::system(),
            json!({
                "origin": "backfill",
                "silent_systems": gap.silent_systems,
                "last_report": gap.last_report,
                "distinct_sources": gap.coverage.distinct_sources,
                "min_sources": gap.coverage.min_sources,
            }),
        )?;
        self.commit(Commit {
            conflict: Some(conflict.clone()),
            items: vec![item],
            events,
            ..Default::default()
        })
        .await?;

        if let Some(metrics) = &self.metrics {
            metrics.conflicts_created.inc();
        }
        info!(
            conflict_id = %conflict.id,
            entity = %tracked.entity,
            severity = %conflict.severity,
            "Reporting gap detected"
        );
        Ok(conflict.id)
    }

    /// Keep an insight that was not placed in the log for a later replay.
    /// Replayed entries are already there.
    async fn shelve(
        &self,
        insight: NormalizedInsight,
        observed_at: DateTime<Utc>,
        logged: Option<&ItemId>,
    ) {
        if logged.is_none() {
            let id = self
                .state
                .write()
                .await
                .insight_log
                .push(insight, observed_at);
            debug!(insight_id = %id, "Insight logged without placement");
        }
    }

    fn abandon_run(&self, error: EngineError, created: &[ConflictId]) -> EngineError {
        warn!(created = created.len(), error = %error, "Detection pass abandoned");
        error
    }
}
