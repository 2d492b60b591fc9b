// SPDX-License-Identifier: PMPL-1.0-or-later
//! Concord Conflict Detector
//!
//! Decides, for each normalized insight, whether it extends an open
//! conflict, opens a new one together with a recently logged peer, or is
//! independent. Also watches tracked entities for reporting gaps.
//!
//! The detector is a pure decision component. It never mutates conflicts;
//! the orchestrator applies its decisions under the per-conflict lock and
//! writes the audit entries.

use chrono::{DateTime, Duration, Utc};
use concord_model::{
    Claim, ClaimValue, Conflict, ConflictId, ConflictItem, ConflictType, CreateConflictItemInput,
    EntityRef, ItemId, ItemRole, Severity,
};
use concord_similarity::{similarity, InsightVector, SimilarityScore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use thiserror::Error;
use tracing::debug;

mod classify;
mod normalize;
mod polarity;

pub use classify::{
    classify, has_stage_regression, initial_severity, ClassificationThresholds, SourceCoverage,
};
pub use normalize::{
    normalize, process_text, CompetitiveSignal, GenericInsight, GovernanceFinding, MediaMention,
    NormalizeError, NormalizedInsight, RiskForecast, SourcePayload, COMPETITIVE_INTELLIGENCE,
    GOVERNANCE, MEDIA_MONITORING, RISK_FORECASTING,
};
pub use polarity::{relative_delta, Disagreement, PolarityHeuristics};

/// Source system name used for items the engine synthesizes itself
pub const ENGINE_SOURCE: &str = "concord";

/// Detector errors
#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Minimum similarity for an item to join a conflict or pair with a peer
    pub join_threshold: f64,
    /// Relative numeric delta above which claims diverge
    pub divergence_threshold: f64,
    /// Half-width of the band around `join_threshold` treated as ambiguous
    pub ambiguity_band: f64,
    /// Relative numeric delta above which two insights disagree at all
    pub numeric_tolerance: f64,
    /// Peers older than this (relative to the new item) are not paired
    pub pairing_window_secs: i64,
    /// Per-organization capacity of the independent-insight log
    pub insight_log_capacity: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            join_threshold: 0.72,
            divergence_threshold: 0.25,
            ambiguity_band: 0.05,
            numeric_tolerance: 0.10,
            pairing_window_secs: 24 * 3600,
            insight_log_capacity: 10_000,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), DetectorError> {
        for (name, value) in [
            ("join_threshold", self.join_threshold),
            ("divergence_threshold", self.divergence_threshold),
            ("ambiguity_band", self.ambiguity_band),
            ("numeric_tolerance", self.numeric_tolerance),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(DetectorError::InvalidThreshold(format!(
                    "{} = {} is outside [0, 1]",
                    name, value
                )));
            }
        }
        if self.pairing_window_secs <= 0 {
            return Err(DetectorError::InvalidThreshold(
                "pairing_window_secs must be positive".to_string(),
            ));
        }
        if self.insight_log_capacity == 0 {
            return Err(DetectorError::InvalidThreshold(
                "insight_log_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pairing_window(&self) -> Duration {
        Duration::seconds(self.pairing_window_secs)
    }

    pub fn thresholds(&self) -> ClassificationThresholds {
        ClassificationThresholds {
            join_threshold: self.join_threshold,
            ambiguity_band: self.ambiguity_band,
            divergence_threshold: self.divergence_threshold,
        }
    }
}

// ---------------------------------------------------------------------------
// Insight log
// ---------------------------------------------------------------------------

/// An independent insight kept for later pairing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggedInsight {
    pub id: ItemId,
    pub insight: NormalizedInsight,
    pub observed_at: DateTime<Utc>,
    /// Already used to open a conflict
    pub paired: bool,
}

/// Bounded per-organization log of independent insights, plus the last
/// report time of every (entity, source) pair. Both are capped at
/// `capacity` per organization.
#[derive(Debug, Default)]
pub struct InsightLog {
    capacity: usize,
    entries: HashMap<String, VecDeque<LoggedInsight>>,
    last_reports: HashMap<String, HashMap<EntityRef, BTreeMap<String, DateTime<Utc>>>>,
}

impl InsightLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            last_reports: HashMap::new(),
        }
    }

    /// Record that a source reported on an entity. A new entity evicts the
    /// one whose latest report is oldest once the organization is at
    /// capacity.
    pub fn observe(&mut self, insight: &NormalizedInsight, at: DateTime<Utc>) {
        let reports = self
            .last_reports
            .entry(insight.organization_id.clone())
            .or_default();
        if !reports.contains_key(&insight.item.entity) && reports.len() >= self.capacity {
            let stalest = reports
                .iter()
                .min_by_key(|(_, by_source)| by_source.values().max().copied())
                .map(|(entity, _)| entity.clone());
            if let Some(entity) = stalest {
                debug!(entity = %entity, "Evicting report history");
                reports.remove(&entity);
            }
        }
        let slot = reports
            .entry(insight.item.entity.clone())
            .or_default()
            .entry(insight.item.source_system.clone())
            .or_insert(at);
        if at > *slot {
            *slot = at;
        }
    }

    /// Keep an independent insight. The oldest entry of the organization is
    /// evicted once capacity is reached.
    pub fn push(&mut self, insight: NormalizedInsight, observed_at: DateTime<Utc>) -> ItemId {
        let id = ItemId::generate();
        let log = self
            .entries
            .entry(insight.organization_id.clone())
            .or_default();
        while log.len() >= self.capacity {
            log.pop_front();
        }
        log.push_back(LoggedInsight {
            id: id.clone(),
            insight,
            observed_at,
            paired: false,
        });
        id
    }

    /// Unpaired insights of an organization about an entity, oldest first.
    pub fn peers<'a>(
        &'a self,
        organization_id: &str,
        entity: &'a EntityRef,
    ) -> impl Iterator<Item = &'a LoggedInsight> + 'a {
        self.entries
            .get(organization_id)
            .into_iter()
            .flat_map(|log| log.iter())
            .filter(move |e| !e.paired && &e.insight.item.entity == entity)
    }

    pub fn get(&self, organization_id: &str, id: &ItemId) -> Option<&LoggedInsight> {
        self.entries
            .get(organization_id)?
            .iter()
            .find(|e| &e.id == id)
    }

    pub fn mark_paired(&mut self, organization_id: &str, id: &ItemId) {
        if let Some(entry) = self
            .entries
            .get_mut(organization_id)
            .and_then(|log| log.iter_mut().find(|e| &e.id == id))
        {
            entry.paired = true;
        }
    }

    /// Make a paired entry available for pairing again.
    pub fn release(&mut self, organization_id: &str, id: &ItemId) {
        if let Some(entry) = self
            .entries
            .get_mut(organization_id)
            .and_then(|log| log.iter_mut().find(|e| &e.id == id))
        {
            entry.paired = false;
        }
    }

    /// Latest report time per source for an entity
    pub fn last_reports(
        &self,
        organization_id: &str,
        entity: &EntityRef,
    ) -> Option<&BTreeMap<String, DateTime<Utc>>> {
        self.last_reports.get(organization_id)?.get(entity)
    }

    /// Organizations with at least one logged insight, sorted
    pub fn organizations(&self) -> Vec<&str> {
        let mut orgs: Vec<&str> = self
            .entries
            .iter()
            .filter(|(_, log)| !log.is_empty())
            .map(|(org, _)| org.as_str())
            .collect();
        orgs.sort_unstable();
        orgs
    }

    /// Insights logged for an organization
    pub fn len(&self, organization_id: &str) -> usize {
        self.entries.get(organization_id).map_or(0, VecDeque::len)
    }

    /// Every logged insight of an organization observed in `[from, to]`
    pub fn between(
        &self,
        organization_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<&LoggedInsight> {
        self.entries
            .get(organization_id)
            .into_iter()
            .flat_map(|log| log.iter())
            .filter(|e| e.observed_at >= from && e.observed_at <= to)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tracked entities
// ---------------------------------------------------------------------------

/// Entity whose reporting cadence is monitored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedEntity {
    pub organization_id: String,
    pub entity: EntityRef,
    /// Expected reporting interval
    pub cadence_secs: i64,
    /// Distinct sources expected per window
    pub min_sources: usize,
    /// Systems expected to report
    pub systems: Vec<String>,
    pub registered_at: DateTime<Utc>,
}

impl TrackedEntity {
    pub fn cadence(&self) -> Duration {
        Duration::seconds(self.cadence_secs)
    }

    /// Twice the cadence
    pub fn window(&self) -> Duration {
        Duration::seconds(self.cadence_secs.saturating_mul(2))
    }

    /// Coverage of this entity as of `now`.
    pub fn coverage(
        &self,
        last_reports: Option<&BTreeMap<String, DateTime<Utc>>>,
        now: DateTime<Utc>,
    ) -> SourceCoverage {
        let since = now - self.window();
        let distinct_sources = last_reports
            .map(|reports| reports.values().filter(|at| **at > since && **at <= now).count())
            .unwrap_or(0);
        SourceCoverage {
            entity: self.entity.clone(),
            distinct_sources,
            min_sources: self.min_sources,
        }
    }
}

/// A reporting gap found by [`ConflictDetector::check_reporting_gap`]
#[derive(Debug, Clone)]
pub struct ReportingGap {
    pub coverage: SourceCoverage,
    pub severity: Severity,
    /// Expected systems without a report in the window
    pub silent_systems: Vec<String>,
    pub last_report: Option<DateTime<Utc>>,
    /// Synthetic primary item describing the gap
    pub item: CreateConflictItemInput,
    pub title: String,
    pub summary: String,
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Read-only view of an open conflict offered as a join candidate
#[derive(Debug, Clone, Copy)]
pub struct OpenConflictView<'a> {
    pub conflict: &'a Conflict,
    pub items: &'a [ConflictItem],
}

/// Outcome of detection for one insight
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionDecision {
    /// Attach to an open conflict
    Attach {
        conflict_id: ConflictId,
        role: ItemRole,
        similarity: SimilarityScore,
        reason: Disagreement,
    },
    /// Open a new conflict with a logged peer as primary
    Open {
        peer_id: ItemId,
        similarity: SimilarityScore,
        reason: Disagreement,
    },
    /// No conflict; log the insight
    Independent,
}

/// Conflict detector
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    config: DetectorConfig,
    polarity: PolarityHeuristics,
}

impl ConflictDetector {
    pub fn new(config: DetectorConfig) -> Result<Self, DetectorError> {
        config.validate()?;
        let polarity = PolarityHeuristics::new(config.numeric_tolerance)?;
        Ok(Self { config, polarity })
    }

    pub fn with_defaults() -> Result<Self, DetectorError> {
        Self::new(DetectorConfig::default())
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn polarity(&self) -> &PolarityHeuristics {
        &self.polarity
    }

    /// Candidate open conflicts: same organization, and sharing the item's
    /// entity or listing its source among the affected systems.
    pub fn is_candidate(&self, insight: &NormalizedInsight, conflict: &Conflict) -> bool {
        conflict.status.is_open()
            && conflict.organization_id == insight.organization_id
            && (conflict.has_entity(&insight.item.entity)
                || conflict.has_system(&insight.item.source_system))
    }

    /// Decide what to do with one insight.
    pub fn decide(
        &self,
        insight: &NormalizedInsight,
        open: &[OpenConflictView<'_>],
        log: &InsightLog,
        observed_at: DateTime<Utc>,
    ) -> DetectionDecision {
        let vector = insight_vector(&insight.item);

        // Best candidate by similarity to its primary items; ties break on id
        // so the outcome never depends on iteration order.
        let mut best: Option<(SimilarityScore, &OpenConflictView<'_>, &ConflictItem)> = None;
        for view in open.iter().filter(|v| self.is_candidate(insight, v.conflict)) {
            for primary in view.items.iter().filter(|i| i.role == ItemRole::Primary) {
                let score = similarity(&vector, &primary.as_vector());
                let better = match best {
                    None => true,
                    Some((s, v, _)) => {
                        score.value > s.value
                            || (score.value == s.value && view.conflict.id < v.conflict.id)
                    }
                };
                if better {
                    best = Some((score, view, primary));
                }
            }
        }

        if let Some((score, view, primary)) = best {
            if score.value > self.config.join_threshold {
                if let Some(reason) = self.polarity.disagreement(
                    insight.item.processed_text.as_deref().unwrap_or(&insight.item.raw_text),
                    insight.item.claim.as_ref(),
                    primary.text(),
                    primary.claim.as_ref(),
                ) {
                    let role = if score.value - self.config.join_threshold <= self.config.ambiguity_band {
                        ItemRole::Context
                    } else {
                        ItemRole::Secondary
                    };
                    debug!(
                        conflict_id = %view.conflict.id,
                        similarity = score.value,
                        role = %role,
                        "Insight joins open conflict"
                    );
                    return DetectionDecision::Attach {
                        conflict_id: view.conflict.id.clone(),
                        role,
                        similarity: score,
                        reason,
                    };
                }
            }
        }

        let window = self.config.pairing_window();
        let mut best_peer: Option<(SimilarityScore, &LoggedInsight, Disagreement)> = None;
        for peer in log.peers(&insight.organization_id, &insight.item.entity) {
            if (observed_at - peer.observed_at).abs() > window {
                continue;
            }
            let score = similarity(&vector, &insight_vector(&peer.insight.item));
            if score.value <= self.config.join_threshold {
                continue;
            }
            let Some(reason) = self.polarity.disagreement(
                insight.item.processed_text.as_deref().unwrap_or(&insight.item.raw_text),
                insight.item.claim.as_ref(),
                peer.insight.item.processed_text.as_deref().unwrap_or(&peer.insight.item.raw_text),
                peer.insight.item.claim.as_ref(),
            ) else {
                continue;
            };
            // Strictly greater keeps the oldest peer on ties.
            if best_peer.as_ref().map_or(true, |(s, _, _)| score.value > s.value) {
                best_peer = Some((score, peer, reason));
            }
        }

        if let Some((score, peer, reason)) = best_peer {
            debug!(
                peer_id = %peer.id,
                similarity = score.value,
                "Insight pairs with logged peer"
            );
            return DetectionDecision::Open {
                peer_id: peer.id.clone(),
                similarity: score,
                reason,
            };
        }

        DetectionDecision::Independent
    }

    /// Classify a conflict's item set.
    pub fn classify(&self, items: &[ConflictItem], coverage: &[SourceCoverage]) -> ConflictType {
        classify(items, coverage, self.config.thresholds())
    }

    /// Title for a newly opened conflict
    pub fn title(&self, conflict_type: ConflictType, items: &[ConflictItem]) -> String {
        let entity = items
            .first()
            .map(|i| i.entity.to_string())
            .unwrap_or_default();
        let metric = items
            .iter()
            .find_map(|i| i.claim.as_ref().map(|c| c.metric.clone()));
        match metric {
            Some(metric) => format!("{} on {} for {}", capitalize(&conflict_type.to_string()), metric, entity),
            None => format!("{} between insights for {}", capitalize(&conflict_type.to_string()), entity),
        }
    }

    /// Summary for a newly opened conflict
    pub fn summary(&self, items: &[ConflictItem], reason: &Disagreement) -> String {
        let systems: BTreeSet<&str> = items.iter().map(|i| i.source_system.as_str()).collect();
        format!(
            "{} insights from {} disagree: {}",
            items.len(),
            systems.into_iter().collect::<Vec<_>>().join(", "),
            reason
        )
    }

    /// Check a tracked entity for a reporting gap as of `now`.
    ///
    /// A gap exists once two cadences have elapsed since registration and
    /// fewer than `min_sources` distinct sources reported in the last two
    /// cadences.
    pub fn check_reporting_gap(
        &self,
        tracked: &TrackedEntity,
        last_reports: Option<&BTreeMap<String, DateTime<Utc>>>,
        now: DateTime<Utc>,
    ) -> Option<ReportingGap> {
        if now - tracked.registered_at < tracked.window() {
            return None;
        }
        let coverage = tracked.coverage(last_reports, now);
        if !coverage.is_short() {
            return None;
        }

        let since = now - tracked.window();
        let reported: BTreeSet<&str> = last_reports
            .map(|r| {
                r.iter()
                    .filter(|(_, at)| **at > since)
                    .map(|(s, _)| s.as_str())
                    .collect()
            })
            .unwrap_or_default();
        let silent_systems: Vec<String> = tracked
            .systems
            .iter()
            .filter(|s| !reported.contains(s.as_str()))
            .cloned()
            .collect();
        let last_report = last_reports.and_then(|r| r.values().max().copied());
        let severity = initial_severity(ConflictType::MissingData, std::slice::from_ref(&coverage));

        let since_text = last_report
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "registration".to_string());
        let raw_text = format!(
            "{} of {} expected sources reported on {} in the last {}h; silent: {}; last report: {}",
            coverage.distinct_sources,
            tracked.min_sources,
            tracked.entity,
            tracked.window().num_hours(),
            if silent_systems.is_empty() {
                "none".to_string()
            } else {
                silent_systems.join(", ")
            },
            since_text
        );

        let item = CreateConflictItemInput {
            entity: tracked.entity.clone(),
            processed_text: Some(process_text(&raw_text)),
            raw_text,
            embedding: None,
            source_system: ENGINE_SOURCE.to_string(),
            source_timestamp: Some(now),
            confidence: 1.0,
            role: Some(ItemRole::Primary),
            claim: Some(Claim::new(
                "reporting_sources",
                ClaimValue::Numeric(coverage.distinct_sources as f64),
            )),
        };

        Some(ReportingGap {
            title: format!("Missing data for {}", tracked.entity),
            summary: format!(
                "Expected {} sources every {}h; {} reported",
                tracked.min_sources,
                tracked.cadence().num_hours(),
                coverage.distinct_sources
            ),
            coverage,
            severity,
            silent_systems,
            last_report,
            item,
        })
    }
}

fn insight_vector(item: &CreateConflictItemInput) -> InsightVector<'_> {
    InsightVector::new(item.processed_text.as_deref().unwrap_or(&item.raw_text))
        .with_optional_embedding(item.embedding.as_deref())
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect::<String>().replace('_', " "),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use concord_model::{ConflictStatus, EntityKind};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn acme() -> EntityRef {
        EntityRef::new(EntityKind::Brand, "acme")
    }

    fn insight(source: &str, sentiment: &str, embedding: Vec<f32>) -> NormalizedInsight {
        NormalizedInsight {
            organization_id: "org-1".into(),
            item: CreateConflictItemInput {
                entity: acme(),
                raw_text: format!("Acme sentiment is {}", sentiment),
                processed_text: None,
                embedding: Some(embedding),
                source_system: source.into(),
                source_timestamp: Some(t0()),
                confidence: 0.8,
                role: None,
                claim: Some(Claim::new(
                    "sentiment",
                    ClaimValue::Categorical(sentiment.into()),
                )),
            },
        }
    }

    fn open_conflict(primary: &NormalizedInsight) -> (Conflict, Vec<ConflictItem>) {
        let id = ConflictId::new("c-1");
        let item = ConflictItem::from_input(id.clone(), primary.item.clone(), ItemRole::Primary, t0());
        let conflict = Conflict {
            id,
            organization_id: "org-1".into(),
            conflict_type: ConflictType::Contradiction,
            severity: Severity::Medium,
            status: ConflictStatus::Detected,
            title: "t".into(),
            summary: String::new(),
            source_entities: vec![acme()],
            affected_systems: vec![primary.item.source_system.clone()],
            analysis: None,
            resolved_at: None,
            resolved_by: None,
            dismissed_reason: None,
            cluster_id: None,
            cluster_similarity: None,
            root_cause: None,
            reality_map_nodes: None,
            created_at: t0(),
            updated_at: t0(),
            version: 1,
        };
        (conflict, vec![item])
    }

    #[test]
    fn test_independent_then_paired() {
        let detector = ConflictDetector::with_defaults().unwrap();
        let mut log = InsightLog::new(10);

        let first = insight("media", "positive", vec![1.0, 0.1]);
        assert_eq!(detector.decide(&first, &[], &log, t0()), DetectionDecision::Independent);
        let peer_id = log.push(first, t0());

        let second = insight("risk", "negative", vec![1.0, 0.12]);
        match detector.decide(&second, &[], &log, t0()) {
            DetectionDecision::Open { peer_id: p, .. } => assert_eq!(p, peer_id),
            other => panic!("expected Open, got {:?}", other),
        }
    }

    #[test]
    fn test_agreeing_peer_is_not_paired() {
        let detector = ConflictDetector::with_defaults().unwrap();
        let mut log = InsightLog::new(10);
        log.push(insight("media", "positive", vec![1.0, 0.1]), t0());
        let same = insight("risk", "positive", vec![1.0, 0.1]);
        assert_eq!(detector.decide(&same, &[], &log, t0()), DetectionDecision::Independent);
    }

    #[test]
    fn test_peer_outside_window_is_ignored() {
        let detector = ConflictDetector::with_defaults().unwrap();
        let mut log = InsightLog::new(10);
        log.push(insight("media", "positive", vec![1.0, 0.1]), t0() - Duration::hours(30));
        let second = insight("risk", "negative", vec![1.0, 0.1]);
        assert_eq!(detector.decide(&second, &[], &log, t0()), DetectionDecision::Independent);
    }

    #[test]
    fn test_attach_to_open_conflict() {
        let detector = ConflictDetector::with_defaults().unwrap();
        let primary = insight("media", "positive", vec![1.0, 0.0]);
        let (conflict, items) = open_conflict(&primary);
        let views = [OpenConflictView {
            conflict: &conflict,
            items: &items,
        }];

        let newcomer = insight("risk", "negative", vec![1.0, 0.05]);
        match detector.decide(&newcomer, &views, &InsightLog::new(10), t0()) {
            DetectionDecision::Attach {
                conflict_id, role, ..
            } => {
                assert_eq!(conflict_id, conflict.id);
                assert_eq!(role, ItemRole::Secondary);
            }
            other => panic!("expected Attach, got {:?}", other),
        }
    }

    #[test]
    fn test_attach_near_threshold_is_context() {
        let detector = ConflictDetector::with_defaults().unwrap();
        let primary = insight("media", "positive", vec![1.0, 0.0]);
        let (conflict, items) = open_conflict(&primary);
        let views = [OpenConflictView {
            conflict: &conflict,
            items: &items,
        }];

        // rescaled similarity 0.74: above join, inside the band
        let theta = 0.48f64.acos();
        let newcomer = insight("risk", "negative", vec![theta.cos() as f32, theta.sin() as f32]);
        match detector.decide(&newcomer, &views, &InsightLog::new(10), t0()) {
            DetectionDecision::Attach { role, .. } => assert_eq!(role, ItemRole::Context),
            other => panic!("expected Attach, got {:?}", other),
        }
    }

    #[test]
    fn test_dismissed_conflict_is_not_candidate() {
        let detector = ConflictDetector::with_defaults().unwrap();
        let primary = insight("media", "positive", vec![1.0, 0.0]);
        let (mut conflict, items) = open_conflict(&primary);
        conflict.status = ConflictStatus::Dismissed;
        let views = [OpenConflictView {
            conflict: &conflict,
            items: &items,
        }];
        let newcomer = insight("risk", "negative", vec![1.0, 0.0]);
        assert_eq!(
            detector.decide(&newcomer, &views, &InsightLog::new(10), t0()),
            DetectionDecision::Independent
        );
    }

    #[test]
    fn test_insight_log_evicts_oldest() {
        let mut log = InsightLog::new(2);
        let a = log.push(insight("a", "positive", vec![1.0]), t0());
        log.push(insight("b", "positive", vec![1.0]), t0());
        log.push(insight("c", "positive", vec![1.0]), t0());
        assert_eq!(log.len("org-1"), 2);
        assert!(log.get("org-1", &a).is_none());
    }

    #[test]
    fn test_report_history_evicts_stalest_entity() {
        let mut log = InsightLog::new(2);
        let about = |id: &str| {
            let mut i = insight("media", "positive", vec![1.0]);
            i.item.entity = EntityRef::new(EntityKind::Brand, id);
            i
        };
        log.observe(&about("old"), t0());
        log.observe(&about("mid"), t0() + Duration::hours(1));
        // A fresh report keeps "old" from being the stalest
        log.observe(&about("old"), t0() + Duration::hours(2));
        log.observe(&about("new"), t0() + Duration::hours(3));

        let old = EntityRef::new(EntityKind::Brand, "old");
        let mid = EntityRef::new(EntityKind::Brand, "mid");
        let new = EntityRef::new(EntityKind::Brand, "new");
        assert!(log.last_reports("org-1", &mid).is_none());
        assert!(log.last_reports("org-1", &old).is_some());
        assert!(log.last_reports("org-1", &new).is_some());

        // Known entities never evict
        log.observe(&about("new"), t0() + Duration::hours(4));
        assert!(log.last_reports("org-1", &old).is_some());
    }

    #[test]
    fn test_reporting_gap_after_two_cadences() {
        let detector = ConflictDetector::with_defaults().unwrap();
        let tracked = TrackedEntity {
            organization_id: "org-1".into(),
            entity: acme(),
            cadence_secs: 24 * 3600,
            min_sources: 1,
            systems: vec!["media".into()],
            registered_at: t0(),
        };
        let mut log = InsightLog::new(10);
        log.observe(&insight("media", "positive", vec![1.0]), t0());

        // One day later the report is still inside the window
        let reports = log.last_reports("org-1", &acme());
        assert!(detector
            .check_reporting_gap(&tracked, reports, t0() + Duration::days(1))
            .is_none());

        let gap = detector
            .check_reporting_gap(&tracked, reports, t0() + Duration::days(4))
            .unwrap();
        assert_eq!(gap.severity, Severity::High);
        assert_eq!(gap.silent_systems, vec!["media".to_string()]);
        assert_eq!(gap.item.source_system, ENGINE_SOURCE);
        assert_eq!(gap.item.role, Some(ItemRole::Primary));
    }

    #[test]
    fn test_config_validation() {
        let config = DetectorConfig {
            join_threshold: 1.5,
            ..Default::default()
        };
        assert!(ConflictDetector::new(config).is_err());
    }
}
