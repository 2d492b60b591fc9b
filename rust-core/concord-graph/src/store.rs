// SPDX-License-Identifier: PMPL-1.0-or-later
//! Persisted conflict edges

use async_trait::async_trait;
use concord_model::{ConflictGraphEdge, ConflictId, EdgeType};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use crate::GraphError;

/// Storage for persisted, directional conflict edges.
#[async_trait]
pub trait EdgeStore: Send + Sync {
    /// Insert an edge. Self-loops and duplicate `(source, target, type)`
    /// triples are rejected.
    async fn insert(&self, edge: ConflictGraphEdge) -> Result<ConflictGraphEdge, GraphError>;

    /// Edges leaving a conflict
    async fn outgoing(&self, conflict: &ConflictId) -> Result<Vec<ConflictGraphEdge>, GraphError>;

    /// Edges arriving at a conflict
    async fn incoming(&self, conflict: &ConflictId) -> Result<Vec<ConflictGraphEdge>, GraphError>;

    /// Whether the triple exists
    async fn exists(
        &self,
        source: &ConflictId,
        target: &ConflictId,
        edge_type: EdgeType,
    ) -> Result<bool, GraphError>;

    /// Every stored edge
    async fn all(&self) -> Result<Vec<ConflictGraphEdge>, GraphError>;

    /// Conflicts reachable within `hops` in either direction, including
    /// `start`. Cycles are expected and handled with a visited set.
    async fn neighborhood(
        &self,
        start: &ConflictId,
        hops: usize,
    ) -> Result<BTreeSet<ConflictId>, GraphError>;
}

type EdgeKey = (ConflictId, ConflictId, EdgeType);

/// In-memory edge store with source and target indices.
///
/// Thread-safe via `RwLock`: concurrent reads, exclusive writes.
pub struct InMemoryEdgeStore {
    edges: RwLock<HashMap<EdgeKey, ConflictGraphEdge>>,
    /// Source id → keys
    source_idx: RwLock<HashMap<ConflictId, HashSet<EdgeKey>>>,
    /// Target id → keys
    target_idx: RwLock<HashMap<ConflictId, HashSet<EdgeKey>>>,
}

impl InMemoryEdgeStore {
    pub fn new() -> Self {
        Self {
            edges: RwLock::new(HashMap::new()),
            source_idx: RwLock::new(HashMap::new()),
            target_idx: RwLock::new(HashMap::new()),
        }
    }

    fn collect(
        &self,
        idx: &RwLock<HashMap<ConflictId, HashSet<EdgeKey>>>,
        conflict: &ConflictId,
    ) -> Result<Vec<ConflictGraphEdge>, GraphError> {
        let idx = idx.read().map_err(|_| GraphError::LockPoisoned)?;
        let edges = self.edges.read().map_err(|_| GraphError::LockPoisoned)?;
        let mut result: Vec<ConflictGraphEdge> = match idx.get(conflict) {
            Some(keys) => keys.iter().filter_map(|k| edges.get(k).cloned()).collect(),
            None => Vec::new(),
        };
        result.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(result)
    }
}

impl Default for InMemoryEdgeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EdgeStore for InMemoryEdgeStore {
    async fn insert(&self, edge: ConflictGraphEdge) -> Result<ConflictGraphEdge, GraphError> {
        if edge.source == edge.target {
            return Err(GraphError::SelfLoop(edge.source));
        }
        if !edge.weight.is_finite() || !(0.0..=1.0).contains(&edge.weight) {
            return Err(GraphError::InvalidWeight(edge.weight));
        }

        let key = edge.key();
        {
            let mut edges = self.edges.write().map_err(|_| GraphError::LockPoisoned)?;
            if edges.contains_key(&key) {
                return Err(GraphError::Duplicate {
                    from: key.0,
                    to: key.1,
                    edge_type: key.2,
                });
            }
            edges.insert(key.clone(), edge.clone());
        }

        self.source_idx
            .write()
            .map_err(|_| GraphError::LockPoisoned)?
            .entry(edge.source.clone())
            .or_default()
            .insert(key.clone());
        self.target_idx
            .write()
            .map_err(|_| GraphError::LockPoisoned)?
            .entry(edge.target.clone())
            .or_default()
            .insert(key);

        Ok(edge)
    }

    async fn outgoing(&self, conflict: &ConflictId) -> Result<Vec<ConflictGraphEdge>, GraphError> {
        self.collect(&self.source_idx, conflict)
    }

    async fn incoming(&self, conflict: &ConflictId) -> Result<Vec<ConflictGraphEdge>, GraphError> {
        self.collect(&self.target_idx, conflict)
    }

    async fn exists(
        &self,
        source: &ConflictId,
        target: &ConflictId,
        edge_type: EdgeType,
    ) -> Result<bool, GraphError> {
        let edges = self.edges.read().map_err(|_| GraphError::LockPoisoned)?;
        Ok(edges.contains_key(&(source.clone(), target.clone(), edge_type)))
    }

    async fn all(&self) -> Result<Vec<ConflictGraphEdge>, GraphError> {
        let edges = self.edges.read().map_err(|_| GraphError::LockPoisoned)?;
        let mut all: Vec<ConflictGraphEdge> = edges.values().cloned().collect();
        all.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(all)
    }

    async fn neighborhood(
        &self,
        start: &ConflictId,
        hops: usize,
    ) -> Result<BTreeSet<ConflictId>, GraphError> {
        let mut visited = BTreeSet::new();
        visited.insert(start.clone());
        let mut frontier = vec![start.clone()];

        for _ in 0..hops {
            let mut next_frontier = Vec::new();
            for current in frontier {
                for edge in self.outgoing(&current).await? {
                    if visited.insert(edge.target.clone()) {
                        next_frontier.push(edge.target);
                    }
                }
                for edge in self.incoming(&current).await? {
                    if visited.insert(edge.source.clone()) {
                        next_frontier.push(edge.source);
                    }
                }
            }
            if next_frontier.is_empty() {
                break;
            }
            frontier = next_frontier;
        }

        Ok(visited)
    }
}
