// SPDX-License-Identifier: PMPL-1.0-or-later
//! Conflict aggregate and its insight items

use chrono::{DateTime, Utc};
use concord_similarity::InsightVector;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::{ClusterId, ConflictAnalysisResult, ConflictId, EntityRef, ItemId, RootCause};

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// How the items of a conflict disagree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Same entity and metric, opposite categorical or boolean values
    Contradiction,
    /// Same entity and metric, numeric values apart beyond the relative-delta threshold
    Divergence,
    /// Similarities sit on the decision boundary; roles cannot be assigned confidently
    Ambiguity,
    /// Fewer sources than expected reported within the entity's window
    MissingData,
    /// A structural invariant of the source systems is violated
    Inconsistency,
}

impl ConflictType {
    pub const ALL: [ConflictType; 5] = [
        ConflictType::Contradiction,
        ConflictType::Divergence,
        ConflictType::Ambiguity,
        ConflictType::MissingData,
        ConflictType::Inconsistency,
    ];
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictType::Contradiction => write!(f, "contradiction"),
            ConflictType::Divergence => write!(f, "divergence"),
            ConflictType::Ambiguity => write!(f, "ambiguity"),
            ConflictType::MissingData => write!(f, "missing_data"),
            ConflictType::Inconsistency => write!(f, "inconsistency"),
        }
    }
}

/// Four-level ordinal severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    /// Cut points on the 0-100 severity score.
    pub const CUT_POINTS: [f64; 3] = [25.0, 55.0, 80.0];

    /// Map a severity score in `[0, 100]` to a level.
    pub fn from_score(score: f64) -> Self {
        let [medium, high, critical] = Self::CUT_POINTS;
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

    /// 0 (low) to 3 (critical)
    pub fn ordinal(self) -> u8 {
        match self {
            Severity::Low => 0,
            Severity::Medium => 1,
            Severity::High => 2,
            Severity::Critical => 3,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Lifecycle status of a conflict.
///
/// ```text
/// detected ──> analyzing ──> resolved
///     │            │
///     └──> dismissed <──┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Detected,
    Analyzing,
    Resolved,
    Dismissed,
}

/// Attempted status change outside the state machine
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid status transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ConflictStatus,
    pub to: ConflictStatus,
}

impl ConflictStatus {
    pub const ALL: [ConflictStatus; 4] = [
        ConflictStatus::Detected,
        ConflictStatus::Analyzing,
        ConflictStatus::Resolved,
        ConflictStatus::Dismissed,
    ];

    /// Whether `self -> next` is an edge of the state machine
    pub fn can_transition_to(self, next: ConflictStatus) -> bool {
        use ConflictStatus::*;
        matches!(
            (self, next),
            (Detected, Analyzing) | (Analyzing, Resolved) | (Detected, Dismissed) | (Analyzing, Dismissed)
        )
    }

    /// Validate and perform a transition
    pub fn transition(self, next: ConflictStatus) -> Result<ConflictStatus, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Detected or analyzing
    pub fn is_open(self) -> bool {
        matches!(self, ConflictStatus::Detected | ConflictStatus::Analyzing)
    }

    /// Resolved or dismissed
    pub fn is_terminal(self) -> bool {
        !self.is_open()
    }
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictStatus::Detected => write!(f, "detected"),
            ConflictStatus::Analyzing => write!(f, "analyzing"),
            ConflictStatus::Resolved => write!(f, "resolved"),
            ConflictStatus::Dismissed => write!(f, "dismissed"),
        }
    }
}

/// Role of an item within its conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemRole {
    Primary,
    Secondary,
    Context,
}

impl fmt::Display for ItemRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemRole::Primary => write!(f, "primary"),
            ItemRole::Secondary => write!(f, "secondary"),
            ItemRole::Context => write!(f, "context"),
        }
    }
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

/// Structured assertion extracted from an insight by its source adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    /// Metric name, e.g. `sentiment`, `risk_score`, `share_of_voice`
    pub metric: String,
    pub value: ClaimValue,
}

impl Claim {
    pub fn new(metric: impl Into<String>, value: ClaimValue) -> Self {
        Self {
            metric: metric.into(),
            value,
        }
    }
}

/// Value of a claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ClaimValue {
    Numeric(f64),
    Categorical(String),
    Boolean(bool),
    /// Position in an ordered lifecycle reported by the source (e.g. campaign stage)
    Stage { name: String, ordinal: u32 },
}

impl ClaimValue {
    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            ClaimValue::Numeric(v) => Some(*v),
            _ => None,
        }
    }

    /// Key under which this value is counted in a categorical vote.
    ///
    /// Numeric values have no vote key.
    pub fn vote_key(&self) -> Option<String> {
        match self {
            ClaimValue::Numeric(_) => None,
            ClaimValue::Categorical(c) => Some(c.trim().to_lowercase()),
            ClaimValue::Boolean(b) => Some(b.to_string()),
            ClaimValue::Stage { name, .. } => Some(name.trim().to_lowercase()),
        }
    }

    pub fn is_categorical(&self) -> bool {
        matches!(self, ClaimValue::Categorical(_) | ClaimValue::Boolean(_))
    }
}

impl fmt::Display for ClaimValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimValue::Numeric(v) => write!(f, "{}", v),
            ClaimValue::Categorical(c) => write!(f, "{}", c),
            ClaimValue::Boolean(b) => write!(f, "{}", b),
            ClaimValue::Stage { name, ordinal } => write!(f, "{}#{}", name, ordinal),
        }
    }
}

// ---------------------------------------------------------------------------
// Conflict
// ---------------------------------------------------------------------------

/// Aggregate root: a set of insights believed to disagree or be jointly
/// incomplete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    /// Organization scope
    pub organization_id: String,
    pub conflict_type: ConflictType,
    pub severity: Severity,
    pub status: ConflictStatus,
    pub title: String,
    pub summary: String,
    /// Entities the items talk about (deduplicated, sorted)
    pub source_entities: Vec<EntityRef>,
    /// Subsystems that contributed items (deduplicated, sorted)
    pub affected_systems: Vec<String>,
    /// Latest analysis; replaced wholesale on re-analysis
    pub analysis: Option<ConflictAnalysisResult>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub dismissed_reason: Option<String>,
    pub cluster_id: Option<ClusterId>,
    /// Similarity to the assigned cluster's centroid
    pub cluster_similarity: Option<f64>,
    /// Top-ranked root cause of the latest analysis
    pub root_cause: Option<RootCause>,
    /// Link to an external reality-map node set
    pub reality_map_nodes: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Incremented on every committed mutation
    pub version: u64,
}

impl Conflict {
    /// A new `detected` conflict. Entities and systems are filled in by
    /// [`Conflict::note_item`].
    pub fn detected(
        organization_id: impl Into<String>,
        conflict_type: ConflictType,
        severity: Severity,
        title: impl Into<String>,
        summary: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ConflictId::generate(),
            organization_id: organization_id.into(),
            conflict_type,
            severity,
            status: ConflictStatus::Detected,
            title: title.into(),
            summary: summary.into(),
            source_entities: Vec::new(),
            affected_systems: Vec::new(),
            analysis: None,
            resolved_at: None,
            resolved_by: None,
            dismissed_reason: None,
            cluster_id: None,
            cluster_similarity: None,
            root_cause: None,
            reality_map_nodes: None,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Record an entity and a system contributed by a new item.
    pub fn note_item(&mut self, entity: &EntityRef, source_system: &str) {
        if !self.source_entities.contains(entity) {
            self.source_entities.push(entity.clone());
            self.source_entities.sort();
        }
        if !self.affected_systems.iter().any(|s| s == source_system) {
            self.affected_systems.push(source_system.to_string());
            self.affected_systems.sort();
        }
    }

    /// Move to `next`, validating the edge.
    pub fn transition(&mut self, next: ConflictStatus, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.status = self.status.transition(next)?;
        self.touch(now);
        Ok(())
    }

    /// Bump version and modification time.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.version += 1;
    }

    pub fn has_entity(&self, entity: &EntityRef) -> bool {
        self.source_entities.contains(entity)
    }

    pub fn has_system(&self, system: &str) -> bool {
        self.affected_systems.iter().any(|s| s == system)
    }
}

/// One normalized claim from one source subsystem about one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictItem {
    pub id: ItemId,
    /// Owning conflict
    pub conflict_id: ConflictId,
    pub entity: EntityRef,
    pub raw_text: String,
    pub processed_text: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub source_system: String,
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Source-declared confidence in `[0, 1]`
    pub confidence: f64,
    pub role: ItemRole,
    pub claim: Option<Claim>,
    pub created_at: DateTime<Utc>,
}

impl ConflictItem {
    /// Build an item owned by `conflict_id` from its creation input.
    pub fn from_input(
        conflict_id: ConflictId,
        input: CreateConflictItemInput,
        role: ItemRole,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ItemId::generate(),
            conflict_id,
            entity: input.entity,
            raw_text: input.raw_text,
            processed_text: input.processed_text,
            embedding: input.embedding,
            source_system: input.source_system,
            source_timestamp: input.source_timestamp,
            confidence: input.confidence,
            role,
            claim: input.claim,
            created_at: now,
        }
    }

    /// Processed text when present, raw text otherwise
    pub fn text(&self) -> &str {
        self.processed_text.as_deref().unwrap_or(&self.raw_text)
    }

    /// Source timestamp, or ingestion time when the source gave none
    pub fn observed_at(&self) -> DateTime<Utc> {
        self.source_timestamp.unwrap_or(self.created_at)
    }

    pub fn as_vector(&self) -> InsightVector<'_> {
        InsightVector::new(self.text()).with_optional_embedding(self.embedding.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Malformed input, reported before anything is applied
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Input for one item; also the shape of the audit entry written when an
/// item is attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConflictItemInput {
    pub entity: EntityRef,
    pub raw_text: String,
    #[serde(default)]
    pub processed_text: Option<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub source_system: String,
    #[serde(default)]
    pub source_timestamp: Option<DateTime<Utc>>,
    pub confidence: f64,
    /// Requested role (manual creation only; detection assigns roles itself)
    #[serde(default)]
    pub role: Option<ItemRole>,
    #[serde(default)]
    pub claim: Option<Claim>,
}

impl CreateConflictItemInput {
    /// Check text, confidence, source and embedding.
    pub fn validate(&self, embedding_dimension: Option<usize>) -> Result<(), ValidationError> {
        if self.raw_text.trim().is_empty() {
            return Err(ValidationError::new("raw_text", "must not be empty"));
        }
        if self.source_system.trim().is_empty() {
            return Err(ValidationError::new("source_system", "must not be empty"));
        }
        if self.entity.id.trim().is_empty() {
            return Err(ValidationError::new("entity.id", "must not be empty"));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(ValidationError::new(
                "confidence",
                format!("{} is outside [0, 1]", self.confidence),
            ));
        }
        if let Some(ref embedding) = self.embedding {
            concord_similarity::check_embedding(embedding, embedding_dimension)
                .map_err(|e| ValidationError::new("embedding", e.to_string()))?;
        }
        if let Some(Claim {
            value: ClaimValue::Numeric(v),
            ..
        }) = self.claim
        {
            if !v.is_finite() {
                return Err(ValidationError::new("claim.value", "numeric claim must be finite"));
            }
        }
        Ok(())
    }
}

/// Check that `incoming` has the embedding length already used by
/// `existing`. Items without an embedding always pass.
pub fn check_shared_dimension(
    existing: &[ConflictItem],
    incoming: &CreateConflictItemInput,
) -> Result<(), ValidationError> {
    let Some(embedding) = incoming.embedding.as_ref() else {
        return Ok(());
    };
    match existing
        .iter()
        .find_map(|i| i.embedding.as_ref().map(Vec::len))
    {
        Some(expected) if expected != embedding.len() => Err(ValidationError::new(
            "embedding",
            format!(
                "dimension {} does not match the conflict's dimension {}",
                embedding.len(),
                expected
            ),
        )),
        _ => Ok(()),
    }
}

/// Manual creation input (bypasses detection)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConflictInput {
    pub organization_id: String,
    pub conflict_type: ConflictType,
    pub severity: Severity,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    pub items: Vec<CreateConflictItemInput>,
    #[serde(default)]
    pub reality_map_nodes: Option<Vec<String>>,
}

impl CreateConflictInput {
    /// Validate the whole input, including the primary-item invariant.
    pub fn validate(&self, embedding_dimension: Option<usize>) -> Result<(), ValidationError> {
        if self.organization_id.trim().is_empty() {
            return Err(ValidationError::new("organization_id", "must not be empty"));
        }
        if self.title.trim().is_empty() {
            return Err(ValidationError::new("title", "must not be empty"));
        }
        if self.items.is_empty() {
            return Err(ValidationError::new("items", "a conflict needs at least one item"));
        }
        if !self
            .items
            .iter()
            .any(|i| i.role == Some(ItemRole::Primary))
        {
            return Err(ValidationError::new(
                "items",
                "at least one item must have role primary",
            ));
        }
        // Without a configured dimension the first embedding sets it.
        let dimension = embedding_dimension.or_else(|| {
            self.items
                .iter()
                .find_map(|i| i.embedding.as_ref().map(Vec::len))
        });
        for (idx, item) in self.items.iter().enumerate() {
            item.validate(dimension).map_err(|e| {
                ValidationError::new(format!("items[{}].{}", idx, e.field), e.message)
            })?;
        }
        Ok(())
    }
}
