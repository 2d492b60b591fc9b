// SPDX-License-Identifier: PMPL-1.0-or-later
//! Concord Graph Builder
//!
//! Two halves:
//!
//! - **`EdgeStore`**: persisted, directional conflict-to-conflict edges
//!   (`related`, `caused_by`, `contradicts`, `supersedes`).
//! - **`GraphBuilder`**: a pure, read-only projection over conflicts, their
//!   items, sources and accepted resolutions, plus persisted and
//!   analyzer-derived edges.
//!
//! Cycles among conflicts are normal. Every traversal helper here keeps a
//! visited set.

use concord_model::{
    Conflict, ConflictGraphEdge, ConflictId, ConflictItem, EdgeType, InsightConflictResolution,
};
use concord_similarity::{mean_embedding, similarity, InsightVector, SimilarityScore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use thiserror::Error;

mod store;
pub use store::{EdgeStore, InMemoryEdgeStore};

/// Graph errors
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Self-loop edge on conflict {0}")]
    SelfLoop(ConflictId),

    #[error("Duplicate edge {from} -[{edge_type}]-> {to}")]
    Duplicate {
        from: ConflictId,
        to: ConflictId,
        edge_type: EdgeType,
    },

    #[error("Edge weight {0} is outside [0, 1]")]
    InvalidWeight(f64),

    #[error("Lock poisoned")]
    LockPoisoned,
}

// ---------------------------------------------------------------------------
// Projection types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Conflict,
    Item,
    Source,
    Resolution,
}

/// A node of the projection. Ids are prefixed by kind (`conflict:…`,
/// `item:…`, `source:…`, `resolution:…`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub kind: NodeKind,
    pub label: String,
}

impl GraphNode {
    pub fn conflict_key(id: &ConflictId) -> String {
        format!("conflict:{}", id)
    }
}

/// Kind of projected edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectedEdgeKind {
    /// item → conflict
    Contains,
    /// resolution → conflict
    ResolvedBy,
    /// item → source
    ReportedBy,
    /// persisted conflict edge
    Persisted(EdgeType),
    /// analyzer-derived, not yet persisted
    Derived(EdgeType),
}

impl ProjectedEdgeKind {
    /// Conflict-to-conflict edge type, if any
    pub fn conflict_edge_type(self) -> Option<EdgeType> {
        match self {
            ProjectedEdgeKind::Persisted(t) | ProjectedEdgeKind::Derived(t) => Some(t),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedEdge {
    pub source: String,
    pub target: String,
    pub kind: ProjectedEdgeKind,
    pub weight: f64,
}

/// Node/edge view handed to consumers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphData {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<ProjectedEdge>,
}

impl GraphData {
    /// Nodes adjacent to `node` along any edge, in either direction
    pub fn neighbors(&self, node: &str) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        for e in &self.edges {
            if e.source == node {
                out.insert(e.target.as_str());
            } else if e.target == node {
                out.insert(e.source.as_str());
            }
        }
        out
    }

    /// Breadth-first order from `start`. Every node appears at most once.
    pub fn bfs(&self, start: &str) -> Vec<String> {
        let adjacency = self.adjacency();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::new();
        if !self.nodes.iter().any(|n| n.id == start) {
            return order;
        }
        visited.insert(start);
        queue.push_back(start);
        while let Some(current) = queue.pop_front() {
            order.push(current.to_string());
            if let Some(next) = adjacency.get(current) {
                for &n in next {
                    if visited.insert(n) {
                        queue.push_back(n);
                    }
                }
            }
        }
        order
    }

    /// Depth-first (pre-order) from `start`. Iterative, so deep chains do not
    /// grow the call stack.
    pub fn dfs(&self, start: &str) -> Vec<String> {
        let adjacency = self.adjacency();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut order = Vec::new();
        if !self.nodes.iter().any(|n| n.id == start) {
            return order;
        }
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            order.push(current.to_string());
            if let Some(next) = adjacency.get(current) {
                // Reverse so the smallest neighbour is visited first.
                for &n in next.iter().rev() {
                    if !visited.contains(n) {
                        stack.push(n);
                    }
                }
            }
        }
        order
    }

    fn adjacency(&self) -> BTreeMap<&str, BTreeSet<&str>> {
        let mut adjacency: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for e in &self.edges {
            adjacency
                .entry(e.source.as_str())
                .or_default()
                .insert(e.target.as_str());
            adjacency
                .entry(e.target.as_str())
                .or_default()
                .insert(e.source.as_str());
        }
        adjacency
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// One conflict with its children, borrowed from the caller's state
#[derive(Debug, Clone, Copy)]
pub struct ConflictSnapshot<'a> {
    pub conflict: &'a Conflict,
    pub items: &'a [ConflictItem],
    pub resolutions: &'a [InsightConflictResolution],
}

/// Pure projection builder
#[derive(Debug, Default)]
pub struct GraphBuilder;

impl GraphBuilder {
    /// Project `snapshots` and the conflict edges among them.
    ///
    /// Persisted edges are included when both ends are in the snapshot set.
    /// Analyzer-derived edges (from each conflict's latest analysis) are
    /// included unless an identical persisted edge exists.
    pub fn build(snapshots: &[ConflictSnapshot<'_>], persisted: &[ConflictGraphEdge]) -> GraphData {
        let mut snapshots: Vec<&ConflictSnapshot<'_>> = snapshots.iter().collect();
        snapshots.sort_by(|a, b| a.conflict.id.cmp(&b.conflict.id));

        let included: BTreeSet<&ConflictId> = snapshots.iter().map(|s| &s.conflict.id).collect();
        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        let mut sources: BTreeSet<&str> = BTreeSet::new();

        for snap in &snapshots {
            let conflict_key = GraphNode::conflict_key(&snap.conflict.id);
            nodes.push(GraphNode {
                id: conflict_key.clone(),
                kind: NodeKind::Conflict,
                label: snap.conflict.title.clone(),
            });

            for item in snap.items {
                let item_key = format!("item:{}", item.id);
                nodes.push(GraphNode {
                    id: item_key.clone(),
                    kind: NodeKind::Item,
                    label: truncate(&item.raw_text, 80),
                });
                edges.push(ProjectedEdge {
                    source: item_key.clone(),
                    target: conflict_key.clone(),
                    kind: ProjectedEdgeKind::Contains,
                    weight: 1.0,
                });
                edges.push(ProjectedEdge {
                    source: item_key,
                    target: format!("source:{}", item.source_system),
                    kind: ProjectedEdgeKind::ReportedBy,
                    weight: item.confidence,
                });
                sources.insert(item.source_system.as_str());
            }

            for resolution in snap.resolutions.iter().filter(|r| r.is_accepted()) {
                let key = format!("resolution:{}", resolution.id);
                nodes.push(GraphNode {
                    id: key.clone(),
                    kind: NodeKind::Resolution,
                    label: resolution.strategy.to_string(),
                });
                edges.push(ProjectedEdge {
                    source: key,
                    target: conflict_key.clone(),
                    kind: ProjectedEdgeKind::ResolvedBy,
                    weight: resolution.confidence,
                });
            }
        }

        for source in sources {
            nodes.push(GraphNode {
                id: format!("source:{}", source),
                kind: NodeKind::Source,
                label: source.to_string(),
            });
        }

        let mut persisted_keys = HashSet::new();
        let mut persisted: Vec<&ConflictGraphEdge> = persisted
            .iter()
            .filter(|e| included.contains(&e.source) && included.contains(&e.target))
            .collect();
        persisted.sort_by(|a, b| a.key().cmp(&b.key()));
        for e in persisted {
            persisted_keys.insert(e.key());
            edges.push(ProjectedEdge {
                source: GraphNode::conflict_key(&e.source),
                target: GraphNode::conflict_key(&e.target),
                kind: ProjectedEdgeKind::Persisted(e.edge_type),
                weight: e.weight,
            });
        }

        for snap in &snapshots {
            let Some(analysis) = &snap.conflict.analysis else {
                continue;
            };
            for related in &analysis.related_conflicts {
                let key = (snap.conflict.id.clone(), related.target.clone(), related.edge_type);
                if !included.contains(&related.target)
                    || related.target == snap.conflict.id
                    || persisted_keys.contains(&key)
                {
                    continue;
                }
                edges.push(ProjectedEdge {
                    source: GraphNode::conflict_key(&snap.conflict.id),
                    target: GraphNode::conflict_key(&related.target),
                    kind: ProjectedEdgeKind::Derived(related.edge_type),
                    weight: related.similarity,
                });
            }
        }

        GraphData { nodes, edges }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}

// ---------------------------------------------------------------------------
// Similar conflicts
// ---------------------------------------------------------------------------

/// What a conflict looks like for similarity purposes: the mean of its item
/// embeddings when every item has one of a common size, plus the
/// concatenated item text.
#[derive(Debug, Clone)]
pub struct ConflictSignature {
    pub id: ConflictId,
    pub organization_id: String,
    pub mean_embedding: Option<Vec<f32>>,
    pub text: String,
}

impl ConflictSignature {
    pub fn from_items(conflict: &Conflict, items: &[ConflictItem]) -> Self {
        let mean = if items.iter().all(|i| i.embedding.is_some()) {
            mean_embedding(items.iter().filter_map(|i| i.embedding.as_deref()))
        } else {
            None
        };
        let text = items.iter().map(ConflictItem::text).collect::<Vec<_>>().join(" ");
        Self {
            id: conflict.id.clone(),
            organization_id: conflict.organization_id.clone(),
            mean_embedding: mean,
            text,
        }
    }

    pub fn as_vector(&self) -> InsightVector<'_> {
        InsightVector::new(&self.text).with_optional_embedding(self.mean_embedding.as_deref())
    }
}

/// The `k` candidates most similar to `target` with similarity at least
/// `min_similarity`, best first, ties broken by id. `target` itself and
/// candidates from other organizations are skipped.
pub fn most_similar(
    target: &ConflictSignature,
    candidates: &[ConflictSignature],
    k: usize,
    min_similarity: f64,
) -> Vec<(ConflictId, SimilarityScore)> {
    let target_vector = target.as_vector();
    let mut scored: Vec<(ConflictId, SimilarityScore)> = candidates
        .iter()
        .filter(|c| c.id != target.id && c.organization_id == target.organization_id)
        .map(|c| (c.id.clone(), similarity(&target_vector, &c.as_vector())))
        .filter(|(_, s)| s.value >= min_similarity)
        .collect();
    scored.sort_by(|a, b| {
        b.1.value
            .total_cmp(&a.1.value)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.truncate(k);
    scored
}
