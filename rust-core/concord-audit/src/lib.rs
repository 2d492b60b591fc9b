// SPDX-License-Identifier: PMPL-1.0-or-later
//! Concord Audit Logger
//!
//! Append-only log of every conflict state change. Entries for one conflict
//! form a hash chain: each entry's `parent_hash` is the `content_hash` of the
//! entry before it, and the first entry links to the SHA-256 of the empty
//! string. The store has no update or delete path.
//!
//! # Architecture
//!
//! - **AuditEvent**: what the orchestrator wants recorded (unhashed).
//! - **AuditEntry**: the sealed, hash-linked record.
//! - **AuditChain**: ordered entries of one conflict, with verification.
//! - **AuditStore** trait: async append/query interface.
//! - **InMemoryAuditStore**: reference implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concord_model::{Actor, ConflictId, ConflictStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Audit errors
#[derive(Error, Debug)]
pub enum AuditError {
    /// A `parent_hash` does not match the preceding entry
    #[error("Audit chain corrupted for conflict {conflict}: {reason}")]
    ChainCorrupted { conflict: ConflictId, reason: String },

    /// An entry's recomputed hash does not match its stored `content_hash`
    #[error("Hash mismatch at index {index} for conflict {conflict}")]
    HashMismatch { conflict: ConflictId, index: usize },

    #[error("Audit serialization error: {0}")]
    Serialization(String),
}

/// Classification of audit events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Conflict opened (detector or manual creation)
    Created,
    /// Insight item attached to an open conflict
    ItemAttached,
    /// Analysis result stored or replaced
    Analyzed,
    /// Status moved along the state machine
    StatusChanged,
    ResolutionCreated,
    ResolutionAccepted,
    ResolutionRejected,
    /// A previously accepted resolution lost acceptance
    ResolutionSuperseded,
    Dismissed,
    ClusterAssigned,
    ClusterUnassigned,
    EdgeAdded,
    /// An operation was aborted by its deadline; nothing else was written
    Timeout,
    Custom(String),
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditEventType::Created => write!(f, "created"),
            AuditEventType::ItemAttached => write!(f, "item_attached"),
            AuditEventType::Analyzed => write!(f, "analyzed"),
            AuditEventType::StatusChanged => write!(f, "status_changed"),
            AuditEventType::ResolutionCreated => write!(f, "resolution_created"),
            AuditEventType::ResolutionAccepted => write!(f, "resolution_accepted"),
            AuditEventType::ResolutionRejected => write!(f, "resolution_rejected"),
            AuditEventType::ResolutionSuperseded => write!(f, "resolution_superseded"),
            AuditEventType::Dismissed => write!(f, "dismissed"),
            AuditEventType::ClusterAssigned => write!(f, "cluster_assigned"),
            AuditEventType::ClusterUnassigned => write!(f, "cluster_unassigned"),
            AuditEventType::EdgeAdded => write!(f, "edge_added"),
            AuditEventType::Timeout => write!(f, "timeout"),
            AuditEventType::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

/// An event to be recorded, before it is sealed into the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub conflict_id: ConflictId,
    pub event_type: AuditEventType,
    pub actor: Actor,
    /// Snapshot before the change
    pub previous_state: Option<Value>,
    /// Snapshot after the change
    pub new_state: Option<Value>,
    /// Free-form details
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        conflict_id: ConflictId,
        event_type: AuditEventType,
        actor: Actor,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            conflict_id,
            event_type,
            actor,
            previous_state: None,
            new_state: None,
            details: Value::Null,
            timestamp,
        }
    }

    /// Attach before/after snapshots.
    pub fn with_states(mut self, previous: Option<Value>, new: Option<Value>) -> Self {
        self.previous_state = previous;
        self.new_state = new;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// A sealed audit entry. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the conflict's chain (0-based)
    pub sequence: u64,
    pub conflict_id: ConflictId,
    pub event_type: AuditEventType,
    pub actor: Actor,
    pub previous_state: Option<Value>,
    pub new_state: Option<Value>,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
    /// SHA-256 hex digest of the previous entry (or of "" for the first)
    pub parent_hash: String,
    /// SHA-256 hex digest of this entry's canonical serialization
    pub content_hash: String,
}

impl AuditEntry {
    /// SHA-256 of the canonical JSON of every field except `content_hash`.
    ///
    /// `serde_json` object keys are sorted, so the digest is stable.
    pub fn compute_hash(
        sequence: u64,
        event: &AuditEvent,
        parent_hash: &str,
    ) -> Result<String, AuditError> {
        let canonical = serde_json::json!({
            "sequence": sequence,
            "conflict_id": event.conflict_id,
            "event_type": event.event_type,
            "actor": event.actor,
            "previous_state": event.previous_state,
            "new_state": event.new_state,
            "details": event.details,
            "timestamp": event.timestamp.to_rfc3339(),
            "parent_hash": parent_hash,
        });
        let bytes = serde_json::to_vec(&canonical)
            .map_err(|e| AuditError::Serialization(e.to_string()))?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }

    /// Seal an event at `sequence` behind `parent_hash`.
    pub fn seal(
        sequence: u64,
        event: AuditEvent,
        parent_hash: impl Into<String>,
    ) -> Result<Self, AuditError> {
        let parent_hash = parent_hash.into();
        let content_hash = Self::compute_hash(sequence, &event, &parent_hash)?;
        Ok(Self {
            sequence,
            conflict_id: event.conflict_id,
            event_type: event.event_type,
            actor: event.actor,
            previous_state: event.previous_state,
            new_state: event.new_state,
            details: event.details,
            timestamp: event.timestamp,
            parent_hash,
            content_hash,
        })
    }

    /// Whether `content_hash` matches the recomputed hash.
    pub fn verify(&self) -> bool {
        let event = AuditEvent {
            conflict_id: self.conflict_id.clone(),
            event_type: self.event_type.clone(),
            actor: self.actor.clone(),
            previous_state: self.previous_state.clone(),
            new_state: self.new_state.clone(),
            details: self.details.clone(),
            timestamp: self.timestamp,
        };
        matches!(
            Self::compute_hash(self.sequence, &event, &self.parent_hash),
            Ok(ref h) if *h == self.content_hash
        )
    }

    /// The `(from, to)` status pair when the snapshots carry different
    /// `status` fields.
    pub fn status_change(&self) -> Option<(ConflictStatus, ConflictStatus)> {
        let from = status_of(self.previous_state.as_ref()?)?;
        let to = status_of(self.new_state.as_ref()?)?;
        (from != to).then_some((from, to))
    }
}

fn status_of(snapshot: &Value) -> Option<ConflictStatus> {
    serde_json::from_value(snapshot.get("status")?.clone()).ok()
}

/// Ordered entries of one conflict (oldest first).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditChain {
    pub conflict_id: ConflictId,
    pub entries: Vec<AuditEntry>,
}

impl AuditChain {
    pub fn new(conflict_id: ConflictId) -> Self {
        Self {
            conflict_id,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// SHA-256 of the empty string
    pub fn genesis_hash() -> String {
        format!("{:x}", Sha256::digest(b""))
    }

    fn head_hash(&self) -> String {
        self.entries
            .last()
            .map(|e| e.content_hash.clone())
            .unwrap_or_else(Self::genesis_hash)
    }

    /// Seal `event` onto the end of the chain.
    pub fn append(&mut self, event: AuditEvent) -> Result<&AuditEntry, AuditError> {
        let entry = AuditEntry::seal(self.entries.len() as u64, event, self.head_hash())?;
        self.entries.push(entry);
        let idx = self.entries.len() - 1;
        Ok(&self.entries[idx])
    }

    /// Check parent linkage and per-entry integrity.
    pub fn verify(&self) -> Result<(), AuditError> {
        let mut expected_parent = Self::genesis_hash();

        for (i, entry) in self.entries.iter().enumerate() {
            if entry.parent_hash != expected_parent {
                return Err(AuditError::ChainCorrupted {
                    conflict: self.conflict_id.clone(),
                    reason: format!(
                        "Entry {} parent_hash mismatch: expected {}, got {}",
                        i, expected_parent, entry.parent_hash
                    ),
                });
            }
            if !entry.verify() {
                return Err(AuditError::HashMismatch {
                    conflict: self.conflict_id.clone(),
                    index: i,
                });
            }
            expected_parent = entry.content_hash.clone();
        }

        Ok(())
    }
}

/// Async audit storage.
///
/// There is deliberately no update or delete operation; retention is an
/// external concern.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append one event.
    async fn append(&self, event: AuditEvent) -> Result<AuditEntry, AuditError>;

    /// Append several events as one unit: either all are sealed or none.
    async fn append_all(&self, events: Vec<AuditEvent>) -> Result<Vec<AuditEntry>, AuditError>;

    /// Entries for a conflict, oldest first (empty when none).
    async fn entries_for(&self, conflict_id: &ConflictId) -> Result<Vec<AuditEntry>, AuditError>;

    /// `Ok(true)` if the chain verifies, `Ok(false)` if there is no chain.
    async fn verify_chain(&self, conflict_id: &ConflictId) -> Result<bool, AuditError>;

    /// Entries written by an actor id, across all conflicts.
    async fn search_by_actor(&self, actor_id: &str) -> Result<Vec<AuditEntry>, AuditError>;

    /// Every entry with a timestamp in `[from, to]`, ordered by conflict then sequence.
    async fn entries_between(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEntry>, AuditError>;

    /// Total number of entries.
    async fn len(&self) -> usize;
}

/// In-memory [`AuditStore`]. All data is lost on process exit.
pub struct InMemoryAuditStore {
    chains: Arc<RwLock<HashMap<ConflictId, AuditChain>>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self {
            chains: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    #[instrument(skip(self, event), fields(conflict_id = %event.conflict_id, event = %event.event_type))]
    async fn append(&self, event: AuditEvent) -> Result<AuditEntry, AuditError> {
        let mut chains = self.chains.write().await;
        let chain = chains
            .entry(event.conflict_id.clone())
            .or_insert_with(|| AuditChain::new(event.conflict_id.clone()));

        let entry = chain.append(event)?.clone();
        debug!(
            actor = %entry.actor.id,
            chain_length = chain.len(),
            "Audit entry recorded"
        );
        Ok(entry)
    }

    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn append_all(&self, events: Vec<AuditEvent>) -> Result<Vec<AuditEntry>, AuditError> {
        let mut chains = self.chains.write().await;

        // Seal against scratch copies so a failure leaves the store untouched.
        let mut staged: HashMap<ConflictId, AuditChain> = HashMap::new();
        let mut sealed = Vec::with_capacity(events.len());
        for event in events {
            let chain = match staged.entry(event.conflict_id.clone()) {
                std::collections::hash_map::Entry::Occupied(o) => o.into_mut(),
                std::collections::hash_map::Entry::Vacant(v) => {
                    let existing = chains
                        .get(&event.conflict_id)
                        .cloned()
                        .unwrap_or_else(|| AuditChain::new(event.conflict_id.clone()));
                    v.insert(existing)
                }
            };
            sealed.push(chain.append(event)?.clone());
        }

        for (id, chain) in staged {
            chains.insert(id, chain);
        }
        debug!(sealed = sealed.len(), "Audit entries recorded");
        Ok(sealed)
    }

    async fn entries_for(&self, conflict_id: &ConflictId) -> Result<Vec<AuditEntry>, AuditError> {
        let chains = self.chains.read().await;
        Ok(chains
            .get(conflict_id)
            .map(|c| c.entries.clone())
            .unwrap_or_default())
    }

    async fn verify_chain(&self, conflict_id: &ConflictId) -> Result<bool, AuditError> {
        let chains = self.chains.read().await;
        match chains.get(conflict_id) {
            Some(chain) => {
                chain.verify()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn search_by_actor(&self, actor_id: &str) -> Result<Vec<AuditEntry>, AuditError> {
        let chains = self.chains.read().await;
        let mut results: Vec<AuditEntry> = chains
            .values()
            .flat_map(|c| c.entries.iter())
            .filter(|e| e.actor.id == actor_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.conflict_id.cmp(&b.conflict_id))
                .then_with(|| a.sequence.cmp(&b.sequence))
        });
        Ok(results)
    }

    async fn entries_between(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        let chains = self.chains.read().await;
        let mut ids: Vec<&ConflictId> = chains.keys().collect();
        ids.sort();
        Ok(ids
            .into_iter()
            .filter_map(|id| chains.get(id))
            .flat_map(|c| c.entries.iter())
            .filter(|e| from.map_or(true, |f| e.timestamp >= f))
            .filter(|e| to.map_or(true, |t| e.timestamp <= t))
            .cloned()
            .collect())
    }

    async fn len(&self) -> usize {
        self.chains.read().await.values().map(AuditChain::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, minute, 0).unwrap()
    }

    fn event(conflict: &str, event_type: AuditEventType, minute: u32) -> AuditEvent {
        AuditEvent::new(ConflictId::new(conflict), event_type, Actor::system(), ts(minute))
    }

    #[test]
    fn test_entry_hash_verification() {
        let entry = AuditEntry::seal(0, event("c1", AuditEventType::Created, 0), "00").unwrap();
        assert!(entry.verify());
    }

    #[test]
    fn test_tampered_entry_fails_verification() {
        let mut entry = AuditEntry::seal(
            0,
            event("c1", AuditEventType::Created, 0).with_details(json!({"title": "a"})),
            "00",
        )
        .unwrap();
        entry.details = json!({"title": "TAMPERED"});
        assert!(!entry.verify());
    }

    #[test]
    fn test_chain_integrity() {
        let mut chain = AuditChain::new(ConflictId::new("c1"));
        chain.append(event("c1", AuditEventType::Created, 0)).unwrap();
        chain.append(event("c1", AuditEventType::ItemAttached, 1)).unwrap();
        chain.append(event("c1", AuditEventType::Analyzed, 2)).unwrap();

        assert_eq!(chain.len(), 3);
        assert_eq!(chain.entries[0].parent_hash, AuditChain::genesis_hash());
        assert_eq!(chain.entries[2].sequence, 2);
        assert!(chain.verify().is_ok());
    }

    #[test]
    fn test_chain_corruption_detected() {
        let mut chain = AuditChain::new(ConflictId::new("c2"));
        chain.append(event("c2", AuditEventType::Created, 0)).unwrap();
        chain.append(event("c2", AuditEventType::Dismissed, 1)).unwrap();

        chain.entries[1].parent_hash = "corrupted_hash".to_string();

        match chain.verify() {
            Err(AuditError::ChainCorrupted { conflict, .. }) => {
                assert_eq!(conflict.as_str(), "c2");
            }
            other => panic!("Expected ChainCorrupted, got {:?}", other),
        }
    }

    #[test]
    fn test_status_change_extraction() {
        let entry = AuditEntry::seal(
            0,
            event("c1", AuditEventType::StatusChanged, 0).with_states(
                Some(json!({"status": "detected", "severity": "low"})),
                Some(json!({"status": "analyzing", "severity": "high"})),
            ),
            AuditChain::genesis_hash(),
        )
        .unwrap();
        assert_eq!(
            entry.status_change(),
            Some((ConflictStatus::Detected, ConflictStatus::Analyzing))
        );

        let unchanged = AuditEntry::seal(
            0,
            event("c1", AuditEventType::Analyzed, 0).with_states(
                Some(json!({"status": "analyzing"})),
                Some(json!({"status": "analyzing"})),
            ),
            AuditChain::genesis_hash(),
        )
        .unwrap();
        assert_eq!(unchanged.status_change(), None);
    }

    #[tokio::test]
    async fn test_in_memory_store_append_and_query() {
        let store = InMemoryAuditStore::new();
        let id = ConflictId::new("c1");

        store.append(event("c1", AuditEventType::Created, 0)).await.unwrap();
        store
            .append(
                AuditEvent::new(id.clone(), AuditEventType::ResolutionAccepted, Actor::user("alice"), ts(5)),
            )
            .await
            .unwrap();

        let entries = store.entries_for(&id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(store.verify_chain(&id).await.unwrap());
        assert!(!store.verify_chain(&ConflictId::new("none")).await.unwrap());

        let alice = store.search_by_actor("alice").await.unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].event_type, AuditEventType::ResolutionAccepted);
    }

    #[tokio::test]
    async fn test_append_all_spans_conflicts() {
        let store = InMemoryAuditStore::new();
        store.append(event("c1", AuditEventType::Created, 0)).await.unwrap();

        let sealed = store
            .append_all(vec![
                event("c1", AuditEventType::ResolutionSuperseded, 1),
                event("c1", AuditEventType::ResolutionAccepted, 1),
                event("c2", AuditEventType::Created, 1),
            ])
            .await
            .unwrap();

        assert_eq!(sealed.len(), 3);
        assert_eq!(sealed[0].sequence, 1);
        assert_eq!(sealed[1].sequence, 2);
        assert_eq!(sealed[2].sequence, 0);
        assert_eq!(store.len().await, 4);
        assert!(store.verify_chain(&ConflictId::new("c1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_entries_between() {
        let store = InMemoryAuditStore::new();
        for minute in [0, 10, 20] {
            store.append(event("c1", AuditEventType::Custom("tick".into()), minute)).await.unwrap();
        }
        let window = store.entries_between(Some(ts(5)), Some(ts(20))).await.unwrap();
        assert_eq!(window.len(), 2);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_any_append_sequence_verifies(minutes in proptest::collection::vec(0u32..60, 1..20)) {
                let mut chain = AuditChain::new(ConflictId::new("p"));
                for m in &minutes {
                    chain.append(event("p", AuditEventType::Custom(format!("m{}", m)), *m)).unwrap();
                }
                prop_assert_eq!(chain.len(), minutes.len());
                prop_assert!(chain.verify().is_ok());
            }
        }
    }
}
