// SPDX-License-Identifier: PMPL-1.0-or-later
//! Rule strategies: source priority and weighted truth

use concord_model::{
    ActionPriority, ClaimValue, Conflict, ConflictItem, ItemRole, RecommendedAction,
    SourcePolicy,
};
use std::collections::{BTreeMap, BTreeSet};

use crate::ResolverError;

/// Reliability assumed for a source the policy has no history for
pub const DEFAULT_RELIABILITY: f64 = 0.5;

/// Result of a rule strategy, before it becomes a resolution record
#[derive(Debug, Clone, PartialEq)]
pub struct RuleResult {
    pub summary: String,
    pub narrative: String,
    pub actions: Vec<RecommendedAction>,
    pub confidence: f64,
    pub rationale: Vec<String>,
    /// Consensus value per metric
    pub values: BTreeMap<String, Consensus>,
    pub source_weights: Option<BTreeMap<String, f64>>,
    pub priority_order: Option<Vec<String>>,
}

/// Consensus reached for one metric
#[derive(Debug, Clone, PartialEq)]
pub enum Consensus {
    Numeric(f64),
    Categorical(String),
}

impl std::fmt::Display for Consensus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Consensus::Numeric(v) => write!(f, "{:.2}", v),
            Consensus::Categorical(s) => write!(f, "{}", s),
        }
    }
}

/// Metric key of an item: its claim metric, or `text` for claimless items
fn metric_of(item: &ConflictItem) -> String {
    item.claim
        .as_ref()
        .map(|c| c.metric.clone())
        .unwrap_or_else(|| "text".to_string())
}

fn role_rank(role: ItemRole) -> u8 {
    match role {
        ItemRole::Primary => 0,
        ItemRole::Secondary => 1,
        ItemRole::Context => 2,
    }
}

/// Best item of a source: highest confidence, then primary role, then latest
/// observation, then id.
fn best_of<'a>(items: impl Iterator<Item = &'a ConflictItem>) -> Option<&'a ConflictItem> {
    items.min_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| role_rank(a.role).cmp(&role_rank(b.role)))
            .then_with(|| b.observed_at().cmp(&a.observed_at()))
            .then_with(|| a.id.cmp(&b.id))
    })
}

// ---------------------------------------------------------------------------
// source_priority
// ---------------------------------------------------------------------------

/// Priority order for a conflict: the explicit order when given, else the
/// policy order for each entity kind in the conflict, concatenated.
pub fn priority_order(
    conflict: &Conflict,
    explicit: Option<&[String]>,
    policy: &SourcePolicy,
) -> Vec<String> {
    if let Some(order) = explicit.filter(|o| !o.is_empty()) {
        return order.to_vec();
    }
    let mut order: Vec<String> = Vec::new();
    for entity in &conflict.source_entities {
        for source in policy.priority_for(entity.kind) {
            if !order.contains(&source) {
                order.push(source);
            }
        }
    }
    order
}

/// Take the item from the highest-priority source present.
///
/// Falls back to the highest-confidence item when no source in the order
/// reported. Confidence is the winning item's declared confidence.
pub fn source_priority(
    conflict: &Conflict,
    items: &[ConflictItem],
    order: Vec<String>,
) -> Result<RuleResult, ResolverError> {
    if items.is_empty() {
        return Err(ResolverError::NoItems);
    }

    let mut rationale = Vec::new();
    let ranked = order.iter().enumerate().find_map(|(rank, source)| {
        best_of(items.iter().filter(|i| &i.source_system == source)).map(|item| (rank, item))
    });
    let winner = match ranked {
        Some((rank, item)) => {
            rationale.push(format!(
                "{} is priority #{} among [{}]",
                item.source_system,
                rank + 1,
                order.join(", ")
            ));
            item
        }
        None => {
            // best_of only returns None on an empty iterator
            let item = best_of(items.iter()).ok_or(ResolverError::NoItems)?;
            rationale.push(format!(
                "no reporting source appears in [{}]; took highest-confidence item from {}",
                order.join(", "),
                item.source_system
            ));
            item
        }
    };

    let mut values = BTreeMap::new();
    if let Some(claim) = &winner.claim {
        values.insert(claim.metric.clone(), consensus_of(&claim.value));
    }

    let others: BTreeSet<&str> = items
        .iter()
        .filter(|i| i.source_system != winner.source_system)
        .map(|i| i.source_system.as_str())
        .collect();
    let actions = others
        .into_iter()
        .map(|system| {
            RecommendedAction::new(
                format!(
                    "Align {} with the {} report on {}",
                    system, winner.source_system, conflict.title
                ),
                ActionPriority::Medium,
            )
            .for_system(system)
        })
        .collect();

    Ok(RuleResult {
        summary: winner.text().to_string(),
        narrative: format!(
            "{} ranks highest for this conflict; its report is taken as authoritative: {}",
            winner.source_system,
            winner.text()
        ),
        actions,
        confidence: winner.confidence.clamp(0.0, 1.0),
        rationale,
        values,
        source_weights: None,
        priority_order: Some(order),
    })
}

fn consensus_of(value: &ClaimValue) -> Consensus {
    match value {
        ClaimValue::Numeric(v) => Consensus::Numeric(*v),
        other => Consensus::Categorical(other.vote_key().unwrap_or_else(|| other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// weighted_truth
// ---------------------------------------------------------------------------

/// Normalized weights over the systems present in `items`.
///
/// Explicit weights must be finite and non-negative with a positive sum over
/// the present systems; they are rescaled to sum to 1. Without explicit
/// weights the policy's reliability (or [`DEFAULT_RELIABILITY`]) is used.
pub fn normalize_weights(
    items: &[ConflictItem],
    explicit: Option<&BTreeMap<String, f64>>,
    policy: &SourcePolicy,
) -> Result<BTreeMap<String, f64>, ResolverError> {
    let systems: BTreeSet<&str> = items.iter().map(|i| i.source_system.as_str()).collect();

    let raw: BTreeMap<String, f64> = match explicit {
        Some(weights) => {
            if let Some((source, w)) = weights.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
                return Err(ResolverError::InvalidWeights(format!(
                    "weight for {} is {}, expected a finite non-negative number",
                    source, w
                )));
            }
            systems
                .iter()
                .map(|s| (s.to_string(), weights.get(*s).copied().unwrap_or(0.0)))
                .collect()
        }
        None => systems
            .iter()
            .map(|s| {
                (
                    s.to_string(),
                    policy.reliability_of(s).unwrap_or(DEFAULT_RELIABILITY).max(0.0),
                )
            })
            .collect(),
    };

    let sum: f64 = raw.values().sum();
    if !sum.is_finite() || sum <= 0.0 {
        return Err(ResolverError::InvalidWeights(
            "weights of the reporting sources sum to zero".to_string(),
        ));
    }
    Ok(raw.into_iter().map(|(s, w)| (s, w / sum)).collect())
}

/// Numeric dispersion: weighted mean and weighted variance, the variance
/// clamped to `[0, 1]`. The variance does not depend on where the mean sits.
pub fn numeric_dispersion(values: &[(f64, f64)]) -> (f64, f64) {
    let total: f64 = values.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        return (0.0, 0.0);
    }
    let mean = values.iter().map(|(v, w)| v * w).sum::<f64>() / total;
    let variance = values
        .iter()
        .map(|(v, w)| w * (v - mean).powi(2))
        .sum::<f64>()
        / total;
    if variance.is_nan() {
        return (mean, 1.0);
    }
    (mean, variance.clamp(0.0, 1.0))
}

/// Categorical dispersion: Gini impurity of the weighted vote shares.
pub fn categorical_dispersion(shares: &BTreeMap<String, f64>) -> f64 {
    let total: f64 = shares.values().sum();
    if total <= 0.0 {
        return 0.0;
    }
    (1.0 - shares.values().map(|w| (w / total).powi(2)).sum::<f64>()).clamp(0.0, 1.0)
}

/// Weighted mean for numeric metrics, weighted vote for everything else.
///
/// Each source's weight is split evenly over its items. Votes within
/// `tie_tolerance` of the top weight tie; ties go to the value backed by the
/// most confident source, then to the lexicographically smallest value.
/// Confidence is `1 - mean dispersion` over metrics.
pub fn weighted_truth(
    items: &[ConflictItem],
    weights: BTreeMap<String, f64>,
    tie_tolerance: f64,
) -> Result<RuleResult, ResolverError> {
    if items.is_empty() {
        return Err(ResolverError::NoItems);
    }

    let mut per_source: BTreeMap<&str, usize> = BTreeMap::new();
    for item in items {
        *per_source.entry(&item.source_system).or_default() += 1;
    }
    let item_weight = |item: &ConflictItem| {
        let n = per_source.get(item.source_system.as_str()).copied().unwrap_or(1);
        weights.get(&item.source_system).copied().unwrap_or(0.0) / n as f64
    };

    let mut by_metric: BTreeMap<String, Vec<&ConflictItem>> = BTreeMap::new();
    for item in items {
        by_metric.entry(metric_of(item)).or_default().push(item);
    }

    let mut values = BTreeMap::new();
    let mut dispersions = Vec::new();
    let mut rationale = Vec::new();
    let mut actions = Vec::new();

    for (metric, group) in &by_metric {
        let numeric: Option<Vec<(f64, f64)>> = group
            .iter()
            .map(|i| Some((i.claim.as_ref()?.value.as_numeric()?, item_weight(*i))))
            .collect();

        match numeric {
            Some(points) => {
                let (mean, dispersion) = numeric_dispersion(&points);
                rationale.push(format!(
                    "{}: weighted mean {:.2} over {} value(s), weighted variance {:.3}",
                    metric,
                    mean,
                    points.len(),
                    dispersion
                ));
                dispersions.push(dispersion);
                values.insert(metric.clone(), Consensus::Numeric(mean));
            }
            None => {
                let vote = vote(group, &item_weight, tie_tolerance);
                rationale.push(format!(
                    "{}: weighted vote [{}]",
                    metric,
                    vote.shares
                        .iter()
                        .map(|(k, w)| format!("{} {:.2}", k, w))
                        .collect::<Vec<_>>()
                        .join(", ")
                ));
                if let Some(note) = &vote.tie_note {
                    rationale.push(format!("{}: {}", metric, note));
                }
                dispersions.push(categorical_dispersion(&vote.shares));
                for item in group {
                    if vote_key(item) != vote.winner {
                        actions.push(
                            RecommendedAction::new(
                                format!(
                                    "Reconcile {} reported by {} with consensus {}",
                                    metric, item.source_system, vote.winner
                                ),
                                ActionPriority::Medium,
                            )
                            .for_system(item.source_system.clone()),
                        );
                    }
                }
                values.insert(metric.clone(), Consensus::Categorical(vote.winner));
            }
        }
    }

    let mean_dispersion = dispersions.iter().sum::<f64>() / dispersions.len().max(1) as f64;
    let confidence = (1.0 - mean_dispersion).clamp(0.0, 1.0);
    actions.dedup_by(|a, b| a.action == b.action);

    let summary = values
        .iter()
        .map(|(m, v)| format!("{} = {}", m, v))
        .collect::<Vec<_>>()
        .join("; ");
    Ok(RuleResult {
        narrative: format!(
            "Weighted consensus across {} source(s): {}",
            weights.len(),
            summary
        ),
        summary,
        actions,
        confidence,
        rationale,
        values,
        source_weights: Some(weights),
        priority_order: None,
    })
}

fn vote_key(item: &ConflictItem) -> String {
    match &item.claim {
        Some(claim) => claim
            .value
            .vote_key()
            .unwrap_or_else(|| claim.value.to_string()),
        None => item.text().trim().to_lowercase(),
    }
}

struct Vote {
    winner: String,
    shares: BTreeMap<String, f64>,
    tie_note: Option<String>,
}

fn vote(
    group: &[&ConflictItem],
    item_weight: &dyn Fn(&ConflictItem) -> f64,
    tie_tolerance: f64,
) -> Vote {
    let mut shares: BTreeMap<String, f64> = BTreeMap::new();
    let mut best_confidence: BTreeMap<String, (f64, String)> = BTreeMap::new();
    for item in group {
        let key = vote_key(item);
        *shares.entry(key.clone()).or_default() += item_weight(*item);
        let entry = best_confidence
            .entry(key)
            .or_insert((f64::MIN, item.source_system.clone()));
        if item.confidence > entry.0 {
            *entry = (item.confidence, item.source_system.clone());
        }
    }

    let top = shares.values().cloned().fold(f64::MIN, f64::max);
    let tied: Vec<&String> = shares
        .iter()
        .filter(|(_, w)| top - **w <= tie_tolerance)
        .map(|(k, _)| k)
        .collect();

    if tied.len() == 1 {
        return Vote {
            winner: tied[0].clone(),
            shares,
            tie_note: None,
        };
    }

    // `tied` is in lexicographic order and reduce keeps the earlier key on
    // equal confidence.
    let winner = tied
        .iter()
        .copied()
        .reduce(|a, b| {
            let ca = best_confidence.get(a).map(|c| c.0).unwrap_or(0.0);
            let cb = best_confidence.get(b).map(|c| c.0).unwrap_or(0.0);
            if cb > ca {
                b
            } else {
                a
            }
        })
        .cloned()
        .unwrap_or_default();
    let (confidence, source) = best_confidence
        .get(&winner)
        .cloned()
        .unwrap_or((0.0, String::new()));
    let tie_note = Some(format!(
        "tie between [{}] within {:.2}; broken by source confidence ({} {:.2})",
        tied.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "),
        tie_tolerance,
        source,
        confidence
    ));
    Vote {
        winner,
        shares,
        tie_note,
    }
}
