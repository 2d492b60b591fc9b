// SPDX-License-Identifier: PMPL-1.0-or-later
//! Source trust policy

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::EntityKind;

/// Which sources are trusted for which entity kinds, and how reliable each
/// source has historically been.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcePolicy {
    /// Source explicitly marked authoritative for an entity kind
    pub authoritative: BTreeMap<EntityKind, String>,
    /// Static fallback priority order per entity kind
    pub default_priority: BTreeMap<EntityKind, Vec<String>>,
    /// Historical reliability weight per source system, in `[0, 1]`
    pub reliability: BTreeMap<String, f64>,
}

impl Default for SourcePolicy {
    fn default() -> Self {
        let order = |sources: &[&str]| sources.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let mut default_priority = BTreeMap::new();
        default_priority.insert(
            EntityKind::Brand,
            order(&["media_monitoring", "competitive_intelligence", "risk_forecasting", "governance"]),
        );
        default_priority.insert(
            EntityKind::Campaign,
            order(&["governance", "media_monitoring", "risk_forecasting"]),
        );
        default_priority.insert(EntityKind::Journalist, order(&["media_monitoring"]));
        default_priority.insert(
            EntityKind::Competitor,
            order(&["competitive_intelligence", "media_monitoring"]),
        );
        Self {
            authoritative: BTreeMap::new(),
            default_priority,
            reliability: BTreeMap::new(),
        }
    }
}

impl SourcePolicy {
    /// Priority order for an entity kind: the authoritative source first,
    /// then the static defaults.
    pub fn priority_for(&self, kind: EntityKind) -> Vec<String> {
        let mut order = Vec::new();
        if let Some(source) = self.authoritative.get(&kind) {
            order.push(source.clone());
        }
        for source in self.default_priority.get(&kind).into_iter().flatten() {
            if !order.contains(source) {
                order.push(source.clone());
            }
        }
        order
    }

    pub fn authoritative_for(&self, kind: EntityKind) -> Option<&str> {
        self.authoritative.get(&kind).map(String::as_str)
    }

    pub fn reliability_of(&self, source: &str) -> Option<f64> {
        self.reliability.get(source).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_puts_authoritative_first() {
        let mut policy = SourcePolicy::default();
        policy
            .authoritative
            .insert(EntityKind::Brand, "risk_forecasting".to_string());
        let order = policy.priority_for(EntityKind::Brand);
        assert_eq!(order[0], "risk_forecasting");
        assert_eq!(order.iter().filter(|s| *s == "risk_forecasting").count(), 1);
        assert!(policy.priority_for(EntityKind::Other).is_empty());
    }
}
