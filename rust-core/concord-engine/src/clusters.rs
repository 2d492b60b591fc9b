// SPDX-License-Identifier: PMPL-1.0-or-later
//! Cluster administration.
//!
//! The recomputation pass reads a snapshot, computes assignments without
//! holding the state lock and then writes only cluster fields, so it can run
//! next to per-conflict mutations. Passes and deactivation take the cluster
//! writer slot for their whole run, so a pass never writes back a cluster
//! record that changed after its snapshot.

use concord_audit::{AuditEvent, AuditEventType};
use concord_cluster::{ClusterMember, ClusterPass};
use concord_graph::ConflictSignature;
use concord_model::{Actor, ClusterId, InsightConflictCluster};
use serde_json::json;
use tracing::info;

use crate::{ConcordEngine, EngineError};

impl ConcordEngine {
    /// Run one clustering pass and apply it.
    pub async fn recompute_clusters(&self) -> Result<ClusterPass, EngineError> {
        let result = self.recompute_clusters_inner().await;
        self.tally("recompute_clusters", result)
    }

    async fn recompute_clusters_inner(&self) -> Result<ClusterPass, EngineError> {
        let _writer = self.cluster_writer.lock().await;
        let now = self.clock.now();
        let (members, clusters) = {
            let state = self.state.read().await;
            let members: Vec<ClusterMember> = state
                .conflicts
                .values()
                .map(|c| ClusterMember {
                    conflict_id: c.id.clone(),
                    organization_id: c.organization_id.clone(),
                    conflict_type: c.conflict_type,
                    severity: c.severity,
                    status: c.status,
                    cluster_id: c.cluster_id.clone(),
                    mean_embedding: ConflictSignature::from_items(c, state.items_of(&c.id))
                        .mean_embedding,
                })
                .collect();
            let clusters: Vec<InsightConflictCluster> = state.clusters.values().cloned().collect();
            (members, clusters)
        };

        let pass = self.cluster_manager.recompute(&members, &clusters, now);
        if pass.is_empty() {
            return Ok(pass);
        }

        let actor = Actor::system();
        let events: Vec<AuditEvent> = pass
            .assignments
            .iter()
            .map(|a| {
                let event_type = if a.cluster_id.is_some() {
                    AuditEventType::ClusterAssigned
                } else {
                    AuditEventType::ClusterUnassigned
                };
                let previous = members
                    .iter()
                    .find(|m| m.conflict_id == a.conflict_id)
                    .and_then(|m| m.cluster_id.clone());
                AuditEvent::new(a.conflict_id.clone(), event_type, actor.clone(), now).with_details(
                    json!({
                        "cluster_id": a.cluster_id,
                        "previous_cluster_id": previous,
                        "similarity": a.similarity,
                    }),
                )
            })
            .collect();

        let mut state = self.state.write().await;
        self.audit
            .append_all(events)
            .await
            .map_err(|source| EngineError::Audit {
                conflict_id: None,
                source,
            })?;
        for assignment in &pass.assignments {
            if let Some(conflict) = state.conflicts.get_mut(&assignment.conflict_id) {
                conflict.cluster_id = assignment.cluster_id.clone();
                conflict.cluster_similarity = assignment.similarity;
            }
        }
        for cluster in &pass.clusters {
            state.clusters.insert(cluster.id.clone(), cluster.clone());
        }

        info!(
            assignments = pass.assignments.len(),
            created = pass.created.len(),
            orphaned = pass.orphaned.len(),
            "Cluster pass applied"
        );
        Ok(pass)
    }

    /// Deactivate a cluster. Its members are orphaned by the next pass.
    pub async fn deactivate_cluster(
        &self,
        id: &ClusterId,
    ) -> Result<InsightConflictCluster, EngineError> {
        let _writer = self.cluster_writer.lock().await;
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let result = match state.clusters.get_mut(id) {
            Some(cluster) => {
                cluster.is_active = false;
                cluster.updated_at = now;
                info!(cluster_id = %id, "Cluster deactivated");
                Ok(cluster.clone())
            }
            None => Err(EngineError::not_found("Cluster", id)),
        };
        self.tally("deactivate_cluster", result)
    }

    /// Clusters of one organization (or all), newest first.
    pub async fn list_clusters(
        &self,
        organization_id: Option<&str>,
        include_inactive: bool,
    ) -> Vec<InsightConflictCluster> {
        let state = self.state.read().await;
        let mut clusters: Vec<InsightConflictCluster> = state
            .clusters
            .values()
            .filter(|c| include_inactive || c.is_active)
            .filter(|c| organization_id.map_or(true, |org| c.organization_id == org))
            .cloned()
            .collect();
        clusters.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        clusters
    }
}
