// SPDX-License-Identifier: PMPL-1.0-or-later
//! Concord Engine
//!
//! Orchestrates detection, analysis, resolution, clustering and audit over
//! an in-memory conflict store.
//!
//! Every mutation of a conflict runs while holding that conflict's writer
//! slot, computes its result off to the side and then commits the entity
//! changes together with their audit entries. Audit is appended first; if it
//! fails nothing is written.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use concord_analyzer::ConflictAnalyzer;
use concord_audit::{AuditEntry, AuditEvent, AuditEventType, AuditStore, InMemoryAuditStore};
use concord_cluster::ClusterManager;
use concord_detector::{ConflictDetector, TrackedEntity};
use concord_graph::{
    ConflictSnapshot, EdgeStore, GraphBuilder, GraphData, GraphError, InMemoryEdgeStore,
};
use concord_model::{
    Actor, Conflict, ConflictGraphEdge, ConflictId, ConflictItem, CreateConflictInput, EntityRef,
    ErrorKind, InsightConflictResolution, ItemId, ItemRole, RelatedConflict,
};
use concord_resolver::{ConflictResolver, NarrativeGenerator};
use prometheus::Registry;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

mod clock;
mod clusters;
mod config;
mod detection;
mod error;
mod export;
mod lifecycle;
mod metrics;
mod query;
mod store;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{
    EngineConfig, ENV_CLUSTER_THRESHOLD, ENV_EMBEDDING_DIM, ENV_JOIN_THRESHOLD,
    ENV_OPERATION_TIMEOUT_MS,
};
pub use detection::{DetectionReport, DetectionRun, InsightFailure, PushSummary};
pub use error::EngineError;
pub use export::{ExportFormat, ExportHandle, ExportRecord, ExportRequest, StoredExport};
pub use lifecycle::{
    AnalyzeOptions, AnalyzeOutcome, BatchResult, ResolveOutcome, ResolveRequest, ReviewDecision,
    ReviewOutcome,
};
pub use metrics::EngineMetrics;
pub use query::{
    ConflictFilter, ConflictPage, ConflictStats, DateRange, ListQuery, SortField, SortOrder,
};

use store::{EngineState, LockTable};

/// A conflict with everything attached to it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictDetail {
    pub conflict: Conflict,
    pub items: Vec<ConflictItem>,
    pub resolutions: Vec<InsightConflictResolution>,
    /// Analyzer-derived relations plus persisted edges in either direction
    pub related_conflicts: Vec<RelatedConflict>,
}

/// Staged side effects of one operation
#[derive(Default)]
pub(crate) struct Commit {
    conflict: Option<Conflict>,
    items: Vec<ConflictItem>,
    resolutions: Vec<InsightConflictResolution>,
    events: Vec<AuditEvent>,
    /// Logged insights consumed by the operation
    paired: Vec<(String, ItemId)>,
}

impl Commit {
    fn conflict(conflict: Conflict) -> Self {
        Self {
            conflict: Some(conflict),
            ..Default::default()
        }
    }
}

/// Checked before each commit of a detection pass. Commits made before
/// expiry stand; nothing is committed after it.
pub(crate) struct Deadline {
    operation: &'static str,
    limit: Option<Duration>,
    started: Instant,
}

impl Deadline {
    pub(crate) fn check(&self) -> Result<(), EngineError> {
        match self.limit {
            Some(limit) if self.started.elapsed() >= limit => Err(EngineError::PassTimeout {
                operation: self.operation,
                timeout_ms: limit.as_millis() as u64,
            }),
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ConcordEngine {
    config: EngineConfig,
    detector: ConflictDetector,
    analyzer: ConflictAnalyzer,
    resolver: ConflictResolver,
    cluster_manager: ClusterManager,
    audit: Arc<dyn AuditStore>,
    edges: InMemoryEdgeStore,
    state: RwLock<EngineState>,
    locks: LockTable,
    /// Serializes detection passes
    detection: Mutex<()>,
    /// Single writer for cluster records: passes and deactivation
    cluster_writer: Mutex<()>,
    clock: Arc<dyn Clock>,
    metrics: Option<EngineMetrics>,
}

impl ConcordEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let detector = ConflictDetector::new(config.detector.clone())
            .map_err(|e| EngineError::validation(e.to_string()))?;
        let analyzer = ConflictAnalyzer::new(config.analyzer.clone())
            .map_err(|e| EngineError::validation(e.to_string()))?;
        let resolver = ConflictResolver::new(config.resolver.clone())
            .map_err(|e| EngineError::validation(e.to_string()))?;
        let cluster_manager = ClusterManager::new(config.cluster.clone())
            .map_err(|e| EngineError::validation(e.to_string()))?;

        info!(
            join_threshold = config.detector.join_threshold,
            cluster_threshold = config.cluster.cluster_threshold,
            embedding_dimension = ?config.embedding_dimension,
            "Concord engine initialized"
        );

        Ok(Self {
            state: RwLock::new(EngineState::new(config.detector.insight_log_capacity)),
            config,
            detector,
            analyzer,
            resolver,
            cluster_manager,
            audit: Arc::new(InMemoryAuditStore::new()),
            edges: InMemoryEdgeStore::new(),
            locks: LockTable::default(),
            detection: Mutex::new(()),
            cluster_writer: Mutex::new(()),
            clock: Arc::new(SystemClock),
            metrics: None,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Enable `ai_consensus` and `hybrid` resolution.
    pub fn with_generator(mut self, generator: Arc<dyn NarrativeGenerator>) -> Self {
        self.resolver = self.resolver.with_generator(generator);
        self
    }

    pub fn with_audit_store(mut self, audit: Arc<dyn AuditStore>) -> Self {
        self.audit = audit;
        self
    }

    /// Register engine metrics on `registry`.
    pub fn with_prometheus(mut self, registry: &Registry) -> Result<Self, EngineError> {
        self.metrics = Some(EngineMetrics::register(registry)?);
        Ok(self)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> Option<&EngineMetrics> {
        self.metrics.as_ref()
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    /// Append the staged audit events, then apply the staged writes.
    async fn commit(&self, commit: Commit) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        let conflict_id = commit.conflict.as_ref().map(|c| c.id.clone());
        self.audit
            .append_all(commit.events)
            .await
            .map_err(|source| EngineError::Audit {
                conflict_id,
                source,
            })?;

        if let Some(conflict) = commit.conflict {
            state.store_conflict(conflict);
        }
        for item in commit.items {
            state
                .items
                .entry(item.conflict_id.clone())
                .or_default()
                .push(item);
        }
        for resolution in commit.resolutions {
            state.upsert_resolution(resolution);
        }
        for (organization_id, id) in &commit.paired {
            state.insight_log.mark_paired(organization_id, id);
        }
        if let Some(metrics) = &self.metrics {
            metrics.open_conflicts.set(state.open_count() as i64);
        }
        Ok(())
    }

    /// Run `work` under the caller's deadline, or the configured default.
    ///
    /// On expiry only a `timeout` audit entry is written; `work` must not
    /// have committed anything. Work that finishes without yielding is
    /// still held to the deadline: its result is discarded when it overran.
    async fn time_boxed<T, F>(
        &self,
        conflict_id: &ConflictId,
        operation: &'static str,
        timeout: Option<Duration>,
        actor: &Actor,
        work: F,
    ) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        let Some(limit) = timeout.or_else(|| self.config.operation_timeout()) else {
            return work.await;
        };
        let started = Instant::now();
        match tokio::time::timeout(limit, work).await {
            Ok(result) if started.elapsed() < limit => result,
            _ => {
                let timeout_ms = limit.as_millis() as u64;
                warn!(conflict_id = %conflict_id, operation, timeout_ms, "Operation timed out");
                let event = AuditEvent::new(
                    conflict_id.clone(),
                    AuditEventType::Timeout,
                    actor.clone(),
                    self.clock.now(),
                )
                .with_details(json!({ "operation": operation, "timeout_ms": timeout_ms }));
                self.audit
                    .append(event)
                    .await
                    .map_err(|source| EngineError::Audit {
                        conflict_id: Some(conflict_id.clone()),
                        source,
                    })?;
                Err(EngineError::Timeout {
                    conflict_id: conflict_id.clone(),
                    operation,
                    timeout_ms,
                })
            }
        }
    }

    /// Deadline for a pass that commits conflict by conflict.
    fn deadline(&self, operation: &'static str, timeout: Option<Duration>) -> Deadline {
        Deadline {
            operation,
            limit: timeout.or_else(|| self.config.operation_timeout()),
            started: Instant::now(),
        }
    }

    /// Log and count a failed operation.
    fn tally<T>(&self, operation: &'static str, result: Result<T, EngineError>) -> Result<T, EngineError> {
        if let Err(e) = &result {
            let kind = e.kind();
            match kind {
                ErrorKind::Validation | ErrorKind::NotFound => {
                    debug!(operation, kind = %kind, error = %e, "Operation rejected")
                }
                _ => warn!(
                    operation,
                    kind = %kind,
                    conflict_id = ?e.conflict_id(),
                    error = %e,
                    "Operation failed"
                ),
            }
            self.count_failure(kind);
        }
        result
    }

    fn count_failure(&self, kind: ErrorKind) {
        if let Some(metrics) = &self.metrics {
            metrics.failure(kind);
        }
    }

    // -----------------------------------------------------------------------
    // Creation and reads
    // -----------------------------------------------------------------------

    /// Manual creation path; bypasses detection.
    pub async fn create_conflict(
        &self,
        input: CreateConflictInput,
        actor: Actor,
    ) -> Result<Conflict, EngineError> {
        let result = self.create_conflict_inner(input, actor).await;
        self.tally("create_conflict", result)
    }

    async fn create_conflict_inner(
        &self,
        input: CreateConflictInput,
        actor: Actor,
    ) -> Result<Conflict, EngineError> {
        input
            .validate(self.config.embedding_dimension)
            .map_err(|e| EngineError::validation(e.to_string()))?;

        let now = self.clock.now();
        let mut conflict = Conflict::detected(
            input.organization_id,
            input.conflict_type,
            input.severity,
            input.title,
            input.summary,
            now,
        );
        conflict.reality_map_nodes = input.reality_map_nodes;
        let items: Vec<ConflictItem> = input
            .items
            .into_iter()
            .map(|i| {
                let role = i.role.unwrap_or(ItemRole::Secondary);
                ConflictItem::from_input(conflict.id.clone(), i, role, now)
            })
            .collect();
        for item in &items {
            conflict.note_item(&item.entity, &item.source_system);
        }

        let events = creation_events(&conflict, &items, &actor, json!({ "origin": "manual" }))?;
        self.commit(Commit {
            conflict: Some(conflict.clone()),
            items,
            events,
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
            actor = %actor.id,
            "Conflict created"
        );
        Ok(conflict)
    }

    pub async fn get_conflict(&self, id: &ConflictId) -> Result<ConflictDetail, EngineError> {
        let result = self.get_conflict_inner(id).await;
        self.tally("get_conflict", result)
    }

    async fn get_conflict_inner(&self, id: &ConflictId) -> Result<ConflictDetail, EngineError> {
        let (conflict, items, resolutions) = {
            let state = self.state.read().await;
            (
                state.conflict(id)?.clone(),
                state.items_of(id).to_vec(),
                state.resolutions_of(id).to_vec(),
            )
        };

        let mut related_conflicts: Vec<RelatedConflict> = conflict
            .analysis
            .as_ref()
            .map(|a| a.related_conflicts.clone())
            .unwrap_or_default();
        for edge in self.conflict_edges_inner(id).await? {
            let target = if &edge.source == id {
                edge.target
            } else {
                edge.source
            };
            if related_conflicts
                .iter()
                .any(|r| r.target == target && r.edge_type == edge.edge_type)
            {
                continue;
            }
            related_conflicts.push(RelatedConflict {
                target,
                edge_type: edge.edge_type,
                similarity: edge.weight,
            });
        }

        Ok(ConflictDetail {
            conflict,
            items,
            resolutions,
            related_conflicts,
        })
    }

    pub async fn list_conflicts(&self, query: &ListQuery) -> ConflictPage {
        let state = self.state.read().await;
        query::list(
            &state,
            query,
            self.config.default_page_size,
            self.config.max_page_size,
        )
    }

    /// Counts for one organization, or for all when `None`.
    pub async fn get_conflict_stats(&self, organization_id: Option<&str>) -> ConflictStats {
        let state = self.state.read().await;
        query::stats(&state, organization_id)
    }

    /// Graph over `ids`, or over every open conflict when `None`.
    pub async fn get_conflict_graph(
        &self,
        ids: Option<&[ConflictId]>,
    ) -> Result<GraphData, EngineError> {
        let result = self.get_conflict_graph_inner(ids).await;
        self.tally("get_conflict_graph", result)
    }

    async fn get_conflict_graph_inner(
        &self,
        ids: Option<&[ConflictId]>,
    ) -> Result<GraphData, EngineError> {
        let persisted = self.edges.all().await.map_err(graph_error)?;
        let state = self.state.read().await;
        let selected: Vec<&Conflict> = match ids {
            Some(ids) => ids
                .iter()
                .map(|id| state.conflict(id))
                .collect::<Result<_, _>>()?,
            None => state
                .conflicts
                .values()
                .filter(|c| c.status.is_open())
                .collect(),
        };
        let snapshots: Vec<ConflictSnapshot<'_>> = selected
            .into_iter()
            .map(|conflict| ConflictSnapshot {
                conflict,
                items: state.items_of(&conflict.id),
                resolutions: state.resolutions_of(&conflict.id),
            })
            .collect();
        Ok(GraphBuilder::build(&snapshots, &persisted))
    }

    // -----------------------------------------------------------------------
    // Tracked entities
    // -----------------------------------------------------------------------

    /// Monitor an entity's reporting cadence. Re-registering replaces the
    /// previous expectation and restarts its grace period.
    pub async fn register_tracked_entity(
        &self,
        organization_id: &str,
        entity: EntityRef,
        cadence: chrono::Duration,
        min_sources: usize,
        systems: Vec<String>,
    ) -> Result<TrackedEntity, EngineError> {
        if organization_id.trim().is_empty() {
            return Err(EngineError::validation("organization_id must not be empty"));
        }
        if cadence <= chrono::Duration::zero() {
            return Err(EngineError::validation("cadence must be positive"));
        }
        if min_sources == 0 {
            return Err(EngineError::validation("min_sources must be at least 1"));
        }

        let tracked = TrackedEntity {
            organization_id: organization_id.to_string(),
            entity,
            cadence_secs: cadence.num_seconds(),
            min_sources,
            systems,
            registered_at: self.clock.now(),
        };
        let mut state = self.state.write().await;
        state
            .tracked
            .retain(|t| !(t.organization_id == tracked.organization_id && t.entity == tracked.entity));
        state.tracked.push(tracked.clone());
        info!(
            organization_id,
            entity = %tracked.entity,
            cadence_secs = tracked.cadence_secs,
            min_sources,
            "Tracking entity"
        );
        Ok(tracked)
    }

    pub async fn tracked_entities(&self) -> Vec<TrackedEntity> {
        self.state.read().await.tracked.clone()
    }

    // -----------------------------------------------------------------------
    // Persisted edges
    // -----------------------------------------------------------------------

    pub async fn add_conflict_edge(
        &self,
        edge: ConflictGraphEdge,
        actor: Actor,
    ) -> Result<ConflictGraphEdge, EngineError> {
        let result = self.add_conflict_edge_inner(edge, actor).await;
        self.tally("add_conflict_edge", result)
    }

    async fn add_conflict_edge_inner(
        &self,
        edge: ConflictGraphEdge,
        actor: Actor,
    ) -> Result<ConflictGraphEdge, EngineError> {
        // Edges are inserted under their source's writer slot, so the
        // duplicate check below cannot race another insert.
        let _guard = self
            .locks
            .acquire(&edge.source, self.config.lock_wait())
            .await?;
        {
            let state = self.state.read().await;
            state.conflict(&edge.source)?;
            state.conflict(&edge.target)?;
        }
        if edge.source == edge.target {
            return Err(graph_error(GraphError::SelfLoop(edge.source.clone())));
        }
        if !(0.0..=1.0).contains(&edge.weight) || edge.weight.is_nan() {
            return Err(graph_error(GraphError::InvalidWeight(edge.weight)));
        }
        if self
            .edges
            .exists(&edge.source, &edge.target, edge.edge_type)
            .await
            .map_err(graph_error)?
        {
            return Err(graph_error(GraphError::Duplicate {
                from: edge.source.clone(),
                to: edge.target.clone(),
                edge_type: edge.edge_type,
            }));
        }

        let event = edge_event(&edge, actor, self.clock.now());
        self.audit
            .append(event)
            .await
            .map_err(|source| EngineError::Audit {
                conflict_id: Some(edge.source.clone()),
                source,
            })?;
        let stored = self.edges.insert(edge).await.map_err(graph_error)?;
        debug!(
            source = %stored.source,
            target = %stored.target,
            edge_type = %stored.edge_type,
            "Conflict edge added"
        );
        Ok(stored)
    }

    /// Persisted edges touching `id`, outgoing first.
    pub async fn conflict_edges(&self, id: &ConflictId) -> Result<Vec<ConflictGraphEdge>, EngineError> {
        let known = self.state.read().await.conflict(id).map(|_| ());
        let result = match known {
            Ok(()) => self.conflict_edges_inner(id).await,
            Err(e) => Err(e),
        };
        self.tally("conflict_edges", result)
    }

    async fn conflict_edges_inner(&self, id: &ConflictId) -> Result<Vec<ConflictGraphEdge>, EngineError> {
        let mut edges = self.edges.outgoing(id).await.map_err(graph_error)?;
        edges.extend(self.edges.incoming(id).await.map_err(graph_error)?);
        Ok(edges)
    }

    /// Promote the analyzer's related conflicts of `id` to persisted edges.
    /// Relations that already exist or point at unknown conflicts are skipped.
    pub async fn persist_related_edges(
        &self,
        id: &ConflictId,
        actor: Actor,
    ) -> Result<Vec<ConflictGraphEdge>, EngineError> {
        let related = {
            let state = self.state.read().await;
            let conflict = state.conflict(id)?;
            let Some(analysis) = &conflict.analysis else {
                return self.tally(
                    "persist_related_edges",
                    Err(EngineError::invalid(id, "conflict has not been analyzed")),
                );
            };
            analysis
                .related_conflicts
                .iter()
                .filter(|r| state.conflicts.contains_key(&r.target) && &r.target != id)
                .cloned()
                .collect::<Vec<_>>()
        };

        let mut added = Vec::new();
        for relation in related {
            let exists = self
                .edges
                .exists(id, &relation.target, relation.edge_type)
                .await
                .map_err(graph_error)?;
            if exists {
                continue;
            }
            let edge = ConflictGraphEdge::new(
                id.clone(),
                relation.target,
                relation.edge_type,
                relation.similarity.clamp(0.0, 1.0),
                self.clock.now(),
            )
            .with_label("analysis");
            let result = self.add_conflict_edge(edge, actor.clone()).await;
            added.push(result?);
        }
        Ok(added)
    }

    // -----------------------------------------------------------------------
    // Audit
    // -----------------------------------------------------------------------

    pub async fn audit_log(&self, id: &ConflictId) -> Result<Vec<AuditEntry>, EngineError> {
        {
            let state = self.state.read().await;
            state.conflict(id)?;
        }
        self.audit
            .entries_for(id)
            .await
            .map_err(|source| EngineError::Audit {
                conflict_id: Some(id.clone()),
                source,
            })
    }

    pub async fn verify_audit_chain(&self, id: &ConflictId) -> Result<bool, EngineError> {
        {
            let state = self.state.read().await;
            state.conflict(id)?;
        }
        self.audit
            .verify_chain(id)
            .await
            .map_err(|source| EngineError::Audit {
                conflict_id: Some(id.clone()),
                source,
            })
    }

    /// Entries written by one actor across all conflicts
    pub async fn audit_by_actor(&self, actor_id: &str) -> Result<Vec<AuditEntry>, EngineError> {
        self.audit
            .search_by_actor(actor_id)
            .await
            .map_err(|source| EngineError::Audit {
                conflict_id: None,
                source,
            })
    }

    // -----------------------------------------------------------------------
    // Export
    // -----------------------------------------------------------------------

    pub async fn export(&self, request: ExportRequest) -> Result<ExportHandle, EngineError> {
        let result = self.export_inner(request).await;
        self.tally("export", result)
    }

    async fn export_inner(&self, request: ExportRequest) -> Result<ExportHandle, EngineError> {
        let now = self.clock.now();
        let mut records = {
            let state = self.state.read().await;
            let mut selected: Vec<&Conflict> = state
                .conflicts
                .values()
                .filter(|c| {
                    request
                        .organization_id
                        .as_ref()
                        .map_or(true, |org| &c.organization_id == org)
                        && request.date_range.contains(c.created_at)
                })
                .collect();
            selected.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
            selected
                .into_iter()
                .map(|c| ExportRecord {
                    conflict: c.clone(),
                    items: request.include_items.then(|| state.items_of(&c.id).to_vec()),
                    resolutions: request
                        .include_resolutions
                        .then(|| state.resolutions_of(&c.id).to_vec()),
                    audit_log: None,
                })
                .collect::<Vec<_>>()
        };
        if request.include_audit_log {
            for record in &mut records {
                let entries = self
                    .audit
                    .entries_for(&record.conflict.id)
                    .await
                    .map_err(|source| EngineError::Audit {
                        conflict_id: Some(record.conflict.id.clone()),
                        source,
                    })?;
                record.audit_log = Some(entries);
            }
        }

        let export_id = uuid::Uuid::new_v4().to_string();
        let body = export::render(request.format, &export_id, now, &records)?;
        let expires_at = now + self.config.export_ttl();
        let mut state = self.state.write().await;
        state.exports.retain(|_, e| !e.is_expired(now));
        state.exports.insert(
            export_id.clone(),
            StoredExport {
                format: request.format,
                body,
                created_at: now,
                expires_at,
            },
        );
        info!(
            export_id = %export_id,
            records = records.len(),
            format = ?request.format,
            "Export stored"
        );
        Ok(ExportHandle {
            export_id,
            url: None,
            expires_at,
            record_count: records.len(),
        })
    }

    /// A stored export; expired exports are not found.
    pub async fn fetch_export(&self, export_id: &str) -> Result<StoredExport, EngineError> {
        let now = self.clock.now();
        let state = self.state.read().await;
        let result = state
            .exports
            .get(export_id)
            .filter(|e| !e.is_expired(now))
            .cloned()
            .ok_or_else(|| EngineError::not_found("Export", export_id));
        self.tally("fetch_export", result)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Status-bearing snapshot stored in audit entries
pub(crate) fn snapshot(conflict: &Conflict) -> Value {
    json!({
        "status": conflict.status,
        "severity": conflict.severity,
        "conflict_type": conflict.conflict_type,
        "version": conflict.version,
    })
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Value, EngineError> {
    serde_json::to_value(value)
        .map_err(|e| EngineError::Internal(format!("audit serialization failed: {}", e)))
}

/// `created` plus one `item_attached` entry per item
pub(crate) fn creation_events(
    conflict: &Conflict,
    items: &[ConflictItem],
    actor: &Actor,
    details: Value,
) -> Result<Vec<AuditEvent>, EngineError> {
    let at = conflict.created_at;
    let mut events = vec![AuditEvent::new(
        conflict.id.clone(),
        AuditEventType::Created,
        actor.clone(),
        at,
    )
    .with_states(None, Some(snapshot(conflict)))
    .with_details(details)];
    for item in items {
        events.push(
            AuditEvent::new(conflict.id.clone(), AuditEventType::ItemAttached, actor.clone(), at)
                .with_states(None, Some(to_json(item)?))
                .with_details(json!({ "item_id": item.id, "role": item.role })),
        );
    }
    Ok(events)
}

fn edge_event(edge: &ConflictGraphEdge, actor: Actor, at: DateTime<Utc>) -> AuditEvent {
    AuditEvent::new(edge.source.clone(), AuditEventType::EdgeAdded, actor, at).with_details(json!({
        "edge_id": edge.id,
        "target": edge.target,
        "edge_type": edge.edge_type,
        "weight": edge.weight,
    }))
}

fn graph_error(e: GraphError) -> EngineError {
    match e {
        GraphError::LockPoisoned => EngineError::Internal(e.to_string()),
        other => EngineError::validation(other.to_string()),
    }
}
