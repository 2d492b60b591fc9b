// SPDX-License-Identifier: PMPL-1.0-or-later

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ClusterId, ConflictType, Severity};

/// A group of semantically similar conflicts, tracked by a centroid vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightConflictCluster {
    pub id: ClusterId,
    pub organization_id: String,
    pub name: String,
    pub description: String,
    pub dominant_type: Option<ConflictType>,
    pub average_severity: Option<Severity>,
    pub member_count: usize,
    /// Mean of the member conflicts' mean embeddings
    pub centroid: Vec<f32>,
    pub is_auto_generated: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InsightConflictCluster {
    /// A fresh, empty, active cluster
    pub fn new(
        organization_id: impl Into<String>,
        name: impl Into<String>,
        centroid: Vec<f32>,
        is_auto_generated: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ClusterId::generate(),
            organization_id: organization_id.into(),
            name: name.into(),
            description: String::new(),
            dominant_type: None,
            average_severity: None,
            member_count: 0,
            centroid,
            is_auto_generated,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}
