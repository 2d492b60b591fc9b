// SPDX-License-Identifier: PMPL-1.0-or-later
//! In-memory conflict state and the per-conflict writer slots.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use concord_detector::{InsightLog, SourceCoverage, TrackedEntity};
use concord_model::{
    ClusterId, Conflict, ConflictId, ConflictItem, ConflictType, EntityRef,
    InsightConflictCluster, InsightConflictResolution, ResolutionId,
};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::export::StoredExport;
use crate::EngineError;

/// Everything the engine owns, guarded by one `RwLock` in the engine.
pub(crate) struct EngineState {
    pub conflicts: HashMap<ConflictId, Conflict>,
    pub items: HashMap<ConflictId, Vec<ConflictItem>>,
    pub resolutions: HashMap<ConflictId, Vec<InsightConflictResolution>>,
    pub resolution_index: HashMap<ResolutionId, ConflictId>,
    pub clusters: BTreeMap<ClusterId, InsightConflictCluster>,
    pub tracked: Vec<TrackedEntity>,
    pub insight_log: InsightLog,
    pub exports: HashMap<String, StoredExport>,
}

impl EngineState {
    pub fn new(insight_log_capacity: usize) -> Self {
        Self {
            conflicts: HashMap::new(),
            items: HashMap::new(),
            resolutions: HashMap::new(),
            resolution_index: HashMap::new(),
            clusters: BTreeMap::new(),
            tracked: Vec::new(),
            insight_log: InsightLog::new(insight_log_capacity),
            exports: HashMap::new(),
        }
    }

    pub fn conflict(&self, id: &ConflictId) -> Result<&Conflict, EngineError> {
        self.conflicts
            .get(id)
            .ok_or_else(|| EngineError::conflict_not_found(id))
    }

    pub fn items_of(&self, id: &ConflictId) -> &[ConflictItem] {
        self.items.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn resolutions_of(&self, id: &ConflictId) -> &[InsightConflictResolution] {
        self.resolutions.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Open conflicts of an organization, ordered by id
    pub fn open_conflicts<'a>(&'a self, organization_id: &'a str) -> Vec<&'a Conflict> {
        let mut open: Vec<&Conflict> = self
            .conflicts
            .values()
            .filter(|c| c.status.is_open() && c.organization_id == organization_id)
            .collect();
        open.sort_by(|a, b| a.id.cmp(&b.id));
        open
    }

    pub fn open_count(&self) -> usize {
        self.conflicts.values().filter(|c| c.status.is_open()).count()
    }

    /// Coverage of every tracked entity among `entities`, as of `now`
    pub fn coverage_for(
        &self,
        organization_id: &str,
        entities: &[EntityRef],
        now: DateTime<Utc>,
    ) -> Vec<SourceCoverage> {
        self.tracked
            .iter()
            .filter(|t| t.organization_id == organization_id && entities.contains(&t.entity))
            .map(|t| {
                t.coverage(
                    self.insight_log.last_reports(organization_id, &t.entity),
                    now,
                )
            })
            .collect()
    }

    /// Shortest tracked cadence among `entities`
    pub fn cadence_for(
        &self,
        organization_id: &str,
        entities: &[EntityRef],
    ) -> Option<chrono::Duration> {
        self.tracked
            .iter()
            .filter(|t| t.organization_id == organization_id && entities.contains(&t.entity))
            .map(TrackedEntity::cadence)
            .min()
    }

    /// Whether an open missing-data conflict already covers `entity`
    pub fn has_open_gap(&self, organization_id: &str, entity: &EntityRef) -> bool {
        self.conflicts.values().any(|c| {
            c.status.is_open()
                && c.organization_id == organization_id
                && c.conflict_type == ConflictType::MissingData
                && c.has_entity(entity)
        })
    }

    /// Insert or replace a resolution and index it.
    pub fn upsert_resolution(&mut self, resolution: InsightConflictResolution) {
        self.resolution_index
            .insert(resolution.id.clone(), resolution.conflict_id.clone());
        let list = self
            .resolutions
            .entry(resolution.conflict_id.clone())
            .or_default();
        match list.iter_mut().find(|r| r.id == resolution.id) {
            Some(slot) => *slot = resolution,
            None => list.push(resolution),
        }
    }

    /// Store a conflict. Cluster membership is owned by the cluster pass, so
    /// an existing record keeps its cluster fields.
    pub fn store_conflict(&mut self, mut conflict: Conflict) {
        if let Some(current) = self.conflicts.get(&conflict.id) {
            conflict.cluster_id = current.cluster_id.clone();
            conflict.cluster_similarity = current.cluster_similarity;
        }
        self.conflicts.insert(conflict.id.clone(), conflict);
    }
}

// ---------------------------------------------------------------------------
// Writer slots
// ---------------------------------------------------------------------------

/// One async mutex per conflict id. Holding the slot makes the caller the
/// conflict's only writer. A slot nobody holds or waits for is dropped from
/// the table on release.
#[derive(Debug, Default)]
pub(crate) struct LockTable {
    slots: Mutex<HashMap<ConflictId, Arc<tokio::sync::Mutex<()>>>>,
}

/// Writer slot held for one conflict
#[derive(Debug)]
pub(crate) struct WriterSlot<'a> {
    table: &'a LockTable,
    id: ConflictId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for WriterSlot<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the table's own reference left: no holder, no waiter.
        if let Ok(mut slots) = self.table.slots.lock() {
            if slots
                .get(&self.id)
                .is_some_and(|slot| Arc::strong_count(slot) == 1)
            {
                slots.remove(&self.id);
            }
        }
    }
}

impl LockTable {
    /// Wait up to `wait` for the conflict's writer slot.
    pub async fn acquire(
        &self,
        id: &ConflictId,
        wait: Duration,
    ) -> Result<WriterSlot<'_>, EngineError> {
        let slot = {
            let mut slots = self
                .slots
                .lock()
                .map_err(|_| EngineError::Internal("lock table poisoned".to_string()))?;
            slots.entry(id.clone()).or_default().clone()
        };
        match tokio::time::timeout(wait, slot.lock_owned()).await {
            Ok(guard) => Ok(WriterSlot {
                table: self,
                id: id.clone(),
                guard: Some(guard),
            }),
            Err(_) => {
                debug!(conflict_id = %id, waited_ms = wait.as_millis() as u64, "Writer slot busy");
                Err(EngineError::Concurrency {
                    conflict_id: id.clone(),
                    waited_ms: wait.as_millis() as u64,
                })
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }
}
