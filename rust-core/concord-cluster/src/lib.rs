// SPDX-License-Identifier: PMPL-1.0-or-later
//! Concord Cluster Manager
//!
//! Groups conflicts by embedding similarity. One recomputation pass:
//!
//! 1. Members of inactive clusters are orphaned back to unclustered.
//! 2. Each unclustered, non-dismissed conflict joins the active cluster of
//!    its organization whose centroid is most similar, if that similarity
//!    reaches `cluster_threshold`.
//! 3. The conflicts still unclustered are grouped by single-link at the same
//!    threshold; every group of at least `min_cluster_size` becomes a new
//!    auto-generated cluster.
//! 4. Every touched cluster gets its centroid, member count, dominant type
//!    and average severity recomputed.
//!
//! The pass is pure: it reads member snapshots and returns the changes for
//! the engine to commit. Clusters are never deleted.

use chrono::{DateTime, Utc};
use concord_model::{
    ClusterId, ConflictId, ConflictStatus, ConflictType, InsightConflictCluster, Severity,
};
use concord_similarity::{cosine, mean_embedding, rescale};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Invalid cluster configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Minimum similarity for joining a cluster and for single-link grouping
    pub cluster_threshold: f64,
    /// Smallest group that becomes an auto-generated cluster
    pub min_cluster_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_threshold: 0.6,
            min_cluster_size: 3,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<(), ClusterError> {
        if !(0.0..=1.0).contains(&self.cluster_threshold) {
            return Err(ClusterError::InvalidConfig(format!(
                "cluster_threshold {} is outside [0, 1]",
                self.cluster_threshold
            )));
        }
        if self.min_cluster_size < 2 {
            return Err(ClusterError::InvalidConfig(
                "min_cluster_size must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of one conflict as the cluster pass sees it
#[derive(Debug, Clone)]
pub struct ClusterMember {
    pub conflict_id: ConflictId,
    pub organization_id: String,
    pub conflict_type: ConflictType,
    pub severity: Severity,
    pub status: ConflictStatus,
    pub cluster_id: Option<ClusterId>,
    /// Mean of the conflict's item embeddings
    pub mean_embedding: Option<Vec<f32>>,
}

/// Membership change for one conflict
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub conflict_id: ConflictId,
    /// `None` orphans the conflict
    pub cluster_id: Option<ClusterId>,
    pub similarity: Option<f64>,
}

/// Output of one recomputation pass
#[derive(Debug, Clone, Default)]
pub struct ClusterPass {
    pub assignments: Vec<Assignment>,
    /// Clusters created or changed in this pass, already recomputed
    pub clusters: Vec<InsightConflictCluster>,
    pub created: Vec<ClusterId>,
    pub orphaned: Vec<ConflictId>,
}

impl ClusterPass {
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty() && self.clusters.is_empty()
    }
}

/// Similarity between two embeddings in `[0, 1]`; `None` on mismatched or
/// zero vectors.
fn embedding_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    cosine(a, b).map(rescale)
}

/// Unclustered conflicts eligible for assignment or grouping
fn is_candidate(member: &ClusterMember) -> bool {
    member.status != ConflictStatus::Dismissed && member.mean_embedding.is_some()
}

pub struct ClusterManager {
    config: ClusterConfig,
}

impl ClusterManager {
    pub fn new(config: ClusterConfig) -> Result<Self, ClusterError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Run one pass over `members` and `clusters`.
    pub fn recompute(
        &self,
        members: &[ClusterMember],
        clusters: &[InsightConflictCluster],
        now: DateTime<Utc>,
    ) -> ClusterPass {
        let mut pass = ClusterPass::default();
        let by_id: BTreeMap<&ClusterId, &InsightConflictCluster> =
            clusters.iter().map(|c| (&c.id, c)).collect();

        let mut ordered: Vec<&ClusterMember> = members.iter().collect();
        ordered.sort_by(|a, b| a.conflict_id.cmp(&b.conflict_id));

        // Current membership after this pass, and every cluster it touched
        let mut membership: BTreeMap<ConflictId, Option<ClusterId>> = ordered
            .iter()
            .map(|m| (m.conflict_id.clone(), m.cluster_id.clone()))
            .collect();
        let mut touched: BTreeSet<ClusterId> = BTreeSet::new();

        for member in &ordered {
            if let Some(cluster_id) = &member.cluster_id {
                let active = by_id.get(cluster_id).map(|c| c.is_active).unwrap_or(false);
                if !active {
                    membership.insert(member.conflict_id.clone(), None);
                    touched.insert(cluster_id.clone());
                    pass.orphaned.push(member.conflict_id.clone());
                    pass.assignments.push(Assignment {
                        conflict_id: member.conflict_id.clone(),
                        cluster_id: None,
                        similarity: None,
                    });
                }
            }
        }

        for member in &ordered {
            let unclustered = matches!(membership.get(&member.conflict_id), Some(None));
            if !unclustered || !is_candidate(member) {
                continue;
            }
            let Some(embedding) = member.mean_embedding.as_deref() else {
                continue;
            };
            let best = clusters
                .iter()
                .filter(|c| c.is_active && c.organization_id == member.organization_id)
                .filter(|c| !c.centroid.is_empty())
                .filter_map(|c| Some((c, embedding_similarity(embedding, &c.centroid)?)))
                .filter(|(_, s)| *s >= self.config.cluster_threshold)
                .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.id.cmp(&a.0.id)));
            if let Some((cluster, similarity)) = best {
                debug!(
                    conflict_id = %member.conflict_id,
                    cluster_id = %cluster.id,
                    similarity,
                    "Conflict assigned to cluster"
                );
                membership.insert(member.conflict_id.clone(), Some(cluster.id.clone()));
                touched.insert(cluster.id.clone());
                pass.assignments.retain(|a| a.conflict_id != member.conflict_id);
                pass.assignments.push(Assignment {
                    conflict_id: member.conflict_id.clone(),
                    cluster_id: Some(cluster.id.clone()),
                    similarity: Some(similarity),
                });
            }
        }

        let leftovers: Vec<&ClusterMember> = ordered
            .iter()
            .copied()
            .filter(|m| matches!(membership.get(&m.conflict_id), Some(None)) && is_candidate(m))
            .collect();
        let mut new_clusters = Vec::new();
        for group in self.single_link_groups(&leftovers) {
            if group.len() < self.config.min_cluster_size {
                continue;
            }
            let organization_id = group[0].organization_id.clone();
            let mut cluster =
                InsightConflictCluster::new(organization_id, String::new(), Vec::new(), true, now);
            for member in &group {
                let similarity = group
                    .iter()
                    .filter(|o| o.conflict_id != member.conflict_id)
                    .filter_map(|o| {
                        embedding_similarity(
                            member.mean_embedding.as_deref()?,
                            o.mean_embedding.as_deref()?,
                        )
                    })
                    .fold(0.0, f64::max);
                membership.insert(member.conflict_id.clone(), Some(cluster.id.clone()));
                pass.assignments.retain(|a| a.conflict_id != member.conflict_id);
                pass.assignments.push(Assignment {
                    conflict_id: member.conflict_id.clone(),
                    cluster_id: Some(cluster.id.clone()),
                    similarity: Some(similarity),
                });
            }
            info!(
                cluster_id = %cluster.id,
                organization_id = %cluster.organization_id,
                members = group.len(),
                "Auto cluster created"
            );
            touched.insert(cluster.id.clone());
            pass.created.push(cluster.id.clone());
            cluster.description = format!(
                "Auto-generated from {} similar unclustered conflicts",
                group.len()
            );
            new_clusters.push(cluster);
        }

        let all: Vec<&InsightConflictCluster> =
            clusters.iter().chain(new_clusters.iter()).collect();
        for cluster in all {
            if !touched.contains(&cluster.id) {
                continue;
            }
            let cluster_members: Vec<&ClusterMember> = ordered
                .iter()
                .copied()
                .filter(|m| membership.get(&m.conflict_id) == Some(&Some(cluster.id.clone())))
                .collect();
            pass.clusters
                .push(recompute_cluster(cluster, &cluster_members, now));
        }

        debug!(
            assignments = pass.assignments.len(),
            created = pass.created.len(),
            orphaned = pass.orphaned.len(),
            "Cluster pass finished"
        );
        pass
    }

    /// Connected components over `similarity >= threshold`, per organization.
    fn single_link_groups<'a>(&self, members: &[&'a ClusterMember]) -> Vec<Vec<&'a ClusterMember>> {
        let n = members.len();
        let mut parent: Vec<usize> = (0..n).collect();

        fn find(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }

        for i in 0..n {
            for j in (i + 1)..n {
                if members[i].organization_id != members[j].organization_id {
                    continue;
                }
                let (Some(a), Some(b)) = (
                    members[i].mean_embedding.as_deref(),
                    members[j].mean_embedding.as_deref(),
                ) else {
                    continue;
                };
                if embedding_similarity(a, b).unwrap_or(0.0) >= self.config.cluster_threshold {
                    let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                    if ri != rj {
                        parent[rj.max(ri)] = ri.min(rj);
                    }
                }
            }
        }

        let mut groups: BTreeMap<usize, Vec<&'a ClusterMember>> = BTreeMap::new();
        for i in 0..n {
            let root = find(&mut parent, i);
            groups.entry(root).or_default().push(members[i]);
        }
        groups.into_values().collect()
    }
}

/// Recompute the derived fields of `cluster` from its current members.
pub fn recompute_cluster(
    cluster: &InsightConflictCluster,
    members: &[&ClusterMember],
    now: DateTime<Utc>,
) -> InsightConflictCluster {
    let mut updated = cluster.clone();
    updated.member_count = members.len();
    updated.updated_at = now;

    if let Some(centroid) = mean_embedding(members.iter().filter_map(|m| m.mean_embedding.as_deref()))
    {
        updated.centroid = centroid;
    }

    let mut type_counts: BTreeMap<ConflictType, usize> = BTreeMap::new();
    for m in members {
        *type_counts.entry(m.conflict_type).or_default() += 1;
    }
    // Earlier type wins a tie: max_by keeps the last maximum, so iterate reversed
    updated.dominant_type = type_counts
        .iter()
        .rev()
        .max_by_key(|(_, n)| **n)
        .map(|(t, _)| *t);

    updated.average_severity = if members.is_empty() {
        None
    } else {
        let mean = members
            .iter()
            .map(|m| m.severity.ordinal() as f64)
            .sum::<f64>()
            / members.len() as f64;
        Severity::ALL.get(mean.round() as usize).copied()
    };

    if updated.is_auto_generated && updated.name.is_empty() {
        updated.name = match updated.dominant_type {
            Some(t) => format!("Auto cluster: {} ({})", t, members.len()),
            None => format!("Auto cluster ({})", members.len()),
        };
    }
    updated
}
