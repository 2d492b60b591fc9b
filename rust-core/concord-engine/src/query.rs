// SPDX-License-Identifier: PMPL-1.0-or-later
//! Conflict listing and statistics.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use concord_model::{ClusterId, Conflict, ConflictStatus, ConflictType, Severity};
use serde::{Deserialize, Serialize};

use crate::store::EngineState;

/// Inclusive creation-time range; either end may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at <= to)
    }
}

/// Conjunctive filters. Empty lists match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictFilter {
    pub organization_id: Option<String>,
    pub conflict_types: Vec<ConflictType>,
    pub severities: Vec<Severity>,
    pub statuses: Vec<ConflictStatus>,
    pub affected_system: Option<String>,
    pub cluster_id: Option<ClusterId>,
    pub has_resolution: Option<bool>,
    pub created: DateRange,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    UpdatedAt,
    Severity,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListQuery {
    pub filter: ConflictFilter,
    pub sort: SortField,
    pub order: SortOrder,
    /// Zero-based offset
    pub offset: usize,
    /// Page size; the configured default when `None`, capped at the maximum
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictPage {
    pub conflicts: Vec<Conflict>,
    pub total: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictStats {
    pub total: usize,
    pub by_type: BTreeMap<ConflictType, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_status: BTreeMap<ConflictStatus, usize>,
    /// Active clusters in scope
    pub cluster_count: usize,
    /// Mean of `resolved_at - created_at` over resolved conflicts
    pub average_resolution_secs: Option<f64>,
}

fn matches(state: &EngineState, filter: &ConflictFilter, conflict: &Conflict) -> bool {
    if let Some(org) = &filter.organization_id {
        if &conflict.organization_id != org {
            return false;
        }
    }
    if !filter.conflict_types.is_empty() && !filter.conflict_types.contains(&conflict.conflict_type) {
        return false;
    }
    if !filter.severities.is_empty() && !filter.severities.contains(&conflict.severity) {
        return false;
    }
    if !filter.statuses.is_empty() && !filter.statuses.contains(&conflict.status) {
        return false;
    }
    if let Some(system) = &filter.affected_system {
        if !conflict.has_system(system) {
            return false;
        }
    }
    if let Some(cluster) = &filter.cluster_id {
        if conflict.cluster_id.as_ref() != Some(cluster) {
            return false;
        }
    }
    if let Some(wanted) = filter.has_resolution {
        if state.resolutions_of(&conflict.id).is_empty() == wanted {
            return false;
        }
    }
    filter.created.contains(conflict.created_at)
}

fn compare(sort: SortField, a: &Conflict, b: &Conflict) -> Ordering {
    match sort {
        SortField::CreatedAt => a.created_at.cmp(&b.created_at),
        SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        SortField::Severity => a.severity.cmp(&b.severity),
    }
}

/// Filter, sort and page. Ties order by id so pages are stable.
pub(crate) fn list(
    state: &EngineState,
    query: &ListQuery,
    default_limit: usize,
    max_limit: usize,
) -> ConflictPage {
    let mut selected: Vec<&Conflict> = state
        .conflicts
        .values()
        .filter(|c| matches(state, &query.filter, c))
        .collect();
    selected.sort_by(|a, b| {
        let primary = match query.order {
            SortOrder::Asc => compare(query.sort, a, b),
            SortOrder::Desc => compare(query.sort, b, a),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    });

    let total = selected.len();
    let limit = query.limit.unwrap_or(default_limit).clamp(1, max_limit);
    let conflicts: Vec<Conflict> = selected
        .into_iter()
        .skip(query.offset)
        .take(limit)
        .cloned()
        .collect();
    let has_more = query.offset.saturating_add(conflicts.len()) < total;
    ConflictPage {
        conflicts,
        total,
        has_more,
    }
}

pub(crate) fn stats(state: &EngineState, organization_id: Option<&str>) -> ConflictStats {
    let in_scope = |org: &str| organization_id.map_or(true, |wanted| wanted == org);
    let mut stats = ConflictStats::default();
    let mut resolution_secs = Vec::new();

    for conflict in state.conflicts.values().filter(|c| in_scope(&c.organization_id)) {
        stats.total += 1;
        *stats.by_type.entry(conflict.conflict_type).or_default() += 1;
        *stats.by_severity.entry(conflict.severity).or_default() += 1;
        *stats.by_status.entry(conflict.status).or_default() += 1;
        if let (ConflictStatus::Resolved, Some(at)) = (conflict.status, conflict.resolved_at) {
            resolution_secs.push((at - conflict.created_at).num_milliseconds() as f64 / 1000.0);
        }
    }
    stats.cluster_count = state
        .clusters
        .values()
        .filter(|c| c.is_active && in_scope(&c.organization_id))
        .count();
    if !resolution_secs.is_empty() {
        stats.average_resolution_secs =
            Some(resolution_secs.iter().sum::<f64>() / resolution_secs.len() as f64);
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use concord_model::ConflictId;

    fn conflict(id: &str, severity: Severity, minutes: i64) -> Conflict {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap() + Duration::minutes(minutes);
        let mut c = Conflict::detected("org", ConflictType::Divergence, severity, id, "", at);
        c.id = ConflictId::new(id);
        c
    }

    fn state_with(conflicts: Vec<Conflict>) -> EngineState {
        let mut state = EngineState::new(16);
        for c in conflicts {
            state.conflicts.insert(c.id.clone(), c);
        }
        state
    }

    #[test]
    fn test_sort_and_page() {
        let state = state_with(vec![
            conflict("a", Severity::Low, 0),
            conflict("b", Severity::High, 1),
            conflict("c", Severity::High, 2),
            conflict("d", Severity::Medium, 3),
        ]);
        let query = ListQuery {
            sort: SortField::Severity,
            order: SortOrder::Desc,
            limit: Some(2),
            ..Default::default()
        };
        let page = list(&state, &query, 20, 100);
        let ids: Vec<&str> = page.conflicts.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(page.total, 4);
        assert!(page.has_more);

        let last = list(&state, &ListQuery { offset: 2, ..query }, 20, 100);
        let ids: Vec<&str> = last.conflicts.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["d", "a"]);
        assert!(!last.has_more);
    }

    #[test]
    fn test_filters_combine() {
        let mut resolved = conflict("r", Severity::Medium, 5);
        resolved.status = ConflictStatus::Resolved;
        resolved.affected_systems = vec!["governance".into()];
        let state = state_with(vec![conflict("a", Severity::Medium, 0), resolved]);

        let query = ListQuery {
            filter: ConflictFilter {
                statuses: vec![ConflictStatus::Resolved],
                affected_system: Some("governance".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let page = list(&state, &query, 20, 100);
        assert_eq!(page.total, 1);
        assert_eq!(page.conflicts[0].id.as_str(), "r");

        let none = ListQuery {
            filter: ConflictFilter {
                has_resolution: Some(true),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(list(&state, &none, 20, 100).total, 0);
    }

    #[test]
    fn test_limit_capped() {
        let state = state_with((0..5).map(|i| conflict(&format!("c{}", i), Severity::Low, i)).collect());
        let page = list(
            &state,
            &ListQuery {
                limit: Some(1000),
                ..Default::default()
            },
            2,
            3,
        );
        assert_eq!(page.conflicts.len(), 3);
    }

    #[test]
    fn test_stats_average_resolution() {
        let mut a = conflict("a", Severity::High, 0);
        a.status = ConflictStatus::Resolved;
        a.resolved_at = Some(a.created_at + Duration::seconds(60));
        let mut b = conflict("b", Severity::Low, 0);
        b.status = ConflictStatus::Resolved;
        b.resolved_at = Some(b.created_at + Duration::seconds(180));
        let state = state_with(vec![a, b, conflict("c", Severity::Low, 0)]);

        let stats = stats(&state, Some("org"));
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status[&ConflictStatus::Resolved], 2);
        assert_eq!(stats.by_severity[&Severity::Low], 2);
        assert_eq!(stats.average_resolution_secs, Some(120.0));
        assert_eq!(stats.cluster_count, 0);
    }
}
