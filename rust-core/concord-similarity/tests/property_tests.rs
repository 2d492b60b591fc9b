// SPDX-License-Identifier: PMPL-1.0-or-later
//! Property-based tests for the similarity engine

use concord_similarity::{similarity, InsightVector};
use proptest::prelude::*;

/// Non-degenerate embeddings (at least one component away from zero)
fn arb_embedding(dim: usize) -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-10.0f32..10.0, dim).prop_filter("non-zero norm", |v| {
        v.iter().any(|x| x.abs() > 1e-3)
    })
}

fn arb_text() -> impl Strategy<Value = String> {
    "[A-Za-z0-9 ,.!]{0,60}"
}

proptest! {
    #[test]
    fn test_identical_embeddings_score_exactly_one(e in arb_embedding(8), text in arb_text()) {
        let v = InsightVector::new(&text).with_embedding(&e);
        prop_assert_eq!(similarity(&v, &v).value, 1.0);
    }

    #[test]
    fn test_score_is_bounded_and_symmetric(
        a in arb_embedding(6),
        b in arb_embedding(6),
        ta in arb_text(),
        tb in arb_text()
    ) {
        let va = InsightVector::new(&ta).with_embedding(&a);
        let vb = InsightVector::new(&tb).with_embedding(&b);
        let ab = similarity(&va, &vb);
        let ba = similarity(&vb, &va);
        prop_assert!((0.0..=1.0).contains(&ab.value));
        prop_assert!((ab.value - ba.value).abs() < 1e-12);
    }

    #[test]
    fn test_scores_are_bit_identical_across_calls(
        a in arb_embedding(5),
        ta in arb_text(),
        tb in arb_text()
    ) {
        let va = InsightVector::new(&ta).with_embedding(&a);
        let vb = InsightVector::new(&tb);
        let first = similarity(&va, &vb);
        let second = similarity(&va, &vb);
        prop_assert_eq!(first.value.to_bits(), second.value.to_bits());
        prop_assert!(first.approximate);
    }

    #[test]
    fn test_orthogonal_axes_score_half(dim in 2usize..16, i in 0usize..16, j in 0usize..16, scale in 0.1f32..100.0) {
        let i = i % dim;
        let j = j % dim;
        prop_assume!(i != j);
        let mut a = vec![0.0f32; dim];
        let mut b = vec![0.0f32; dim];
        a[i] = scale;
        b[j] = 1.0;
        let score = similarity(
            &InsightVector::new("a").with_embedding(&a),
            &InsightVector::new("b").with_embedding(&b),
        );
        prop_assert!((score.value - 0.5).abs() < 1e-9);
    }
}
