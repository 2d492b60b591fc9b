// SPDX-License-Identifier: PMPL-1.0-or-later
//! Persisted directional edges between conflicts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{ConflictId, EdgeId};

/// Relationship between two conflicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Related,
    CausedBy,
    Contradicts,
    Supersedes,
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeType::Related => write!(f, "related"),
            EdgeType::CausedBy => write!(f, "caused_by"),
            EdgeType::Contradicts => write!(f, "contradicts"),
            EdgeType::Supersedes => write!(f, "supersedes"),
        }
    }
}

/// Directional edge between two conflicts.
///
/// Self-loops and duplicate `(source, target, edge_type)` triples are
/// rejected by the edge store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictGraphEdge {
    pub id: EdgeId,
    pub source: ConflictId,
    pub target: ConflictId,
    pub edge_type: EdgeType,
    /// Weight in `[0, 1]`
    pub weight: f64,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl ConflictGraphEdge {
    pub fn new(
        source: ConflictId,
        target: ConflictId,
        edge_type: EdgeType,
        weight: f64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EdgeId::generate(),
            source,
            target,
            edge_type,
            weight,
            label: None,
            metadata: BTreeMap::new(),
            created_at,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Identity used for duplicate detection
    pub fn key(&self) -> (ConflictId, ConflictId, EdgeType) {
        (self.source.clone(), self.target.clone(), self.edge_type)
    }
}
