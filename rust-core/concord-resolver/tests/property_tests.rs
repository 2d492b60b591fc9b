// SPDX-License-Identifier: PMPL-1.0-or-later
//! Property tests for weighted-truth confidence

use chrono::{TimeZone, Utc};
use concord_model::{
    Claim, ClaimValue, ConflictId, ConflictItem, CreateConflictItemInput, EntityKind, EntityRef,
    ItemRole,
};
use concord_resolver::{weighted_truth, ResolverError};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn numeric(source: &str, value: f64) -> ConflictItem {
    let at = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
    ConflictItem::from_input(
        ConflictId::new("c"),
        CreateConflictItemInput {
            entity: EntityRef::new(EntityKind::Brand, "acme"),
            raw_text: format!("score {}", value),
            processed_text: None,
            embedding: None,
            source_system: source.into(),
            source_timestamp: Some(at),
            confidence: 0.5,
            role: None,
            claim: Some(Claim::new("score", ClaimValue::Numeric(value))),
        },
        ItemRole::Secondary,
        at,
    )
}

fn categorical(source: &str, value: &str) -> ConflictItem {
    let mut item = numeric(source, 0.0);
    item.claim = Some(Claim::new("stance", ClaimValue::Categorical(value.into())));
    item
}

fn confidence_for_spread(mean: f64, spread: f64, w: f64) -> Result<f64, ResolverError> {
    let items = vec![numeric("a", mean - spread), numeric("b", mean + spread)];
    let weights: BTreeMap<String, f64> =
        [("a".to_string(), w), ("b".to_string(), 1.0 - w)].into_iter().collect();
    Ok(weighted_truth(&items, weights, 0.02)?.confidence)
}

proptest! {
    /// Holding the weights (summing to 1) and the mean fixed, widening the
    /// spread of values never raises confidence.
    #[test]
    fn test_numeric_confidence_non_increasing_in_variance(
        mean in 10.0f64..1000.0,
        s1 in 0.0f64..50.0,
        extra in 0.0f64..50.0,
    ) {
        let narrow = confidence_for_spread(mean, s1, 0.5).unwrap();
        let wide = confidence_for_spread(mean, s1 + extra, 0.5).unwrap();
        prop_assert!(wide <= narrow + 1e-12);
        prop_assert!((0.0..=1.0).contains(&wide));
    }

    /// Confidence tracks the weighted variance alone: a wider spread never
    /// scores higher, wherever either mean sits.
    #[test]
    fn test_numeric_confidence_non_increasing_across_means(
        mean_a in -1000.0f64..1000.0,
        mean_b in -1000.0f64..1000.0,
        s1 in 0.0f64..2.0,
        extra in 0.0f64..2.0,
        w in 0.05f64..0.95,
    ) {
        let narrow = confidence_for_spread(mean_a, s1, w).unwrap();
        let wide = confidence_for_spread(mean_b, s1 + extra, w).unwrap();
        prop_assert!(wide <= narrow + 1e-9, "narrow {} wide {}", narrow, wide);
        prop_assert!((0.0..=1.0).contains(&narrow));
    }

    #[test]
    fn test_numeric_confidence_is_one_minus_weighted_variance(
        mean in -50.0f64..50.0,
        spread in 0.0f64..0.5,
        w in 0.05f64..0.95,
    ) {
        // values mean ± spread with weights w, 1-w
        let weighted_mean = w * (mean - spread) + (1.0 - w) * (mean + spread);
        let variance = w * (mean - spread - weighted_mean).powi(2)
            + (1.0 - w) * (mean + spread - weighted_mean).powi(2);
        let confidence = confidence_for_spread(mean, spread, w).unwrap();
        prop_assert!((confidence - (1.0 - variance).clamp(0.0, 1.0)).abs() < 1e-9);
    }

    /// For a two-way vote, moving the split toward 50/50 raises the weighted
    /// variance and never raises confidence.
    #[test]
    fn test_categorical_confidence_non_increasing_in_variance(
        p in 0.5f64..1.0,
        q in 0.5f64..1.0,
    ) {
        let (balanced, skewed) = if p <= q { (p, q) } else { (q, p) };
        let items = vec![categorical("a", "support"), categorical("b", "oppose")];
        let conf = |w: f64| {
            let weights: BTreeMap<String, f64> =
                [("a".to_string(), w), ("b".to_string(), 1.0 - w)].into_iter().collect();
            weighted_truth(&items, weights, 0.0).map(|r| r.confidence)
        };
        prop_assert!(conf(balanced).unwrap() <= conf(skewed).unwrap() + 1e-12);
    }
}
