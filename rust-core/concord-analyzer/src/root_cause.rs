// SPDX-License-Identifier: PMPL-1.0-or-later
//! Rule-template root causes, one table per conflict type

use chrono::Duration;
use concord_detector::has_stage_regression;
use concord_model::{ClaimValue, ConflictItem, ConflictType, RootCause};
use std::collections::{BTreeMap, BTreeSet};

/// Signals the templates look at
pub struct CauseContext<'a> {
    pub items: &'a [ConflictItem],
    /// Shortest expected reporting cadence among the item sources
    pub cadence: Duration,
    pub join_threshold: f64,
    pub max_similarity: f64,
}

impl CauseContext<'_> {
    fn systems(&self) -> BTreeSet<&str> {
        self.items.iter().map(|i| i.source_system.as_str()).collect()
    }

    fn time_spread(&self) -> Option<Duration> {
        let times = self.items.iter().map(ConflictItem::observed_at);
        let min = times.clone().min()?;
        let max = times.max()?;
        Some(max - min)
    }

    fn values_by_system(&self) -> String {
        let mut by_system: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for item in self.items {
            if let Some(claim) = &item.claim {
                by_system
                    .entry(item.source_system.as_str())
                    .or_default()
                    .push(format!("{}={}", claim.metric, claim.value));
            }
        }
        by_system
            .into_iter()
            .map(|(system, values)| format!("{}: {}", system, values.join(", ")))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

fn cause(text: &str, confidence: f64, evidence: Option<String>) -> RootCause {
    RootCause {
        cause: text.to_string(),
        confidence,
        evidence: evidence.filter(|e| !e.is_empty()),
    }
}

/// Ranked root causes: confidence descending, then cause text.
pub fn root_causes(conflict_type: ConflictType, ctx: &CauseContext<'_>) -> Vec<RootCause> {
    let systems = ctx.systems();
    let spread = ctx.time_spread().unwrap_or_else(Duration::zero);
    let stale = spread > ctx.cadence;
    let spread_evidence = Some(format!(
        "items span {}m; expected cadence {}m",
        spread.num_minutes(),
        ctx.cadence.num_minutes()
    ));

    let mut causes = Vec::new();
    match conflict_type {
        ConflictType::Contradiction => {
            if systems.len() > 1 {
                causes.push(cause(
                    "Sources apply different classification models",
                    0.6,
                    Some(ctx.values_by_system()),
                ));
            }
            if stale {
                causes.push(cause("One source reports a stale assessment", 0.5, spread_evidence));
            }
            if ctx.max_similarity < ctx.join_threshold {
                causes.push(cause(
                    "Insights may describe different aspects of the entity",
                    0.3,
                    Some(format!("max item similarity {:.2}", ctx.max_similarity)),
                ));
            }
        }
        ConflictType::Divergence => {
            if stale {
                causes.push(cause("Different measurement windows", 0.7, spread_evidence));
            }
            if systems.len() > 1 {
                causes.push(cause(
                    "Different measurement methodology across sources",
                    0.5,
                    Some(ctx.values_by_system()),
                ));
            }
            if let Some(outlier) = numeric_outlier(ctx.items) {
                causes.push(cause(
                    "Outlier value from a single source",
                    0.4,
                    Some(format!("{} reported {}", outlier.source_system, outlier_value(outlier))),
                ));
            }
        }
        ConflictType::MissingData => {
            causes.push(cause(
                "Expected sources stopped reporting",
                0.7,
                ctx.items.first().map(|i| i.raw_text.clone()),
            ));
            causes.push(cause(
                "Entity no longer covered by monitoring configuration",
                0.4,
                None,
            ));
        }
        ConflictType::Ambiguity => {
            causes.push(cause(
                "Insights are borderline similar and may describe different events",
                0.6,
                Some(format!(
                    "max item similarity {:.2} against join threshold {:.2}",
                    ctx.max_similarity, ctx.join_threshold
                )),
            ));
            let missing = ctx.items.iter().filter(|i| i.embedding.is_none()).count();
            if missing > 0 {
                causes.push(cause(
                    "Insufficient detail to compare insights reliably",
                    0.4,
                    Some(format!("{} item(s) without embeddings", missing)),
                ));
            }
        }
        ConflictType::Inconsistency => {
            if has_stage_regression(ctx.items) {
                causes.push(cause(
                    "Lifecycle stage reported out of order",
                    0.8,
                    Some(ctx.values_by_system()),
                ));
            }
            causes.push(cause(
                "Source systems disagree on the structural state of the entity",
                0.5,
                Some(ctx.values_by_system()),
            ));
        }
    }

    if causes.is_empty() {
        causes.push(cause("Insufficient evidence to determine a cause", 0.1, None));
    }

    causes.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.cause.cmp(&b.cause))
    });
    causes
}

/// Item whose numeric claim is furthest from the mean, when there are at
/// least three numeric claims.
fn numeric_outlier(items: &[ConflictItem]) -> Option<&ConflictItem> {
    let numeric: Vec<(&ConflictItem, f64)> = items
        .iter()
        .filter_map(|i| Some((i, i.claim.as_ref()?.value.as_numeric()?)))
        .collect();
    if numeric.len() < 3 {
        return None;
    }
    let mean = numeric.iter().map(|(_, v)| v).sum::<f64>() / numeric.len() as f64;
    numeric
        .into_iter()
        .max_by(|a, b| {
            (a.1 - mean)
                .abs()
                .total_cmp(&(b.1 - mean).abs())
                .then_with(|| b.0.id.cmp(&a.0.id))
        })
        .map(|(item, _)| item)
}

fn outlier_value(item: &ConflictItem) -> String {
    match item.claim.as_ref().map(|c| &c.value) {
        Some(ClaimValue::Numeric(v)) => v.to_string(),
        _ => "?".to_string(),
    }
}
