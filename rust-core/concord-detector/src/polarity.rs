// SPDX-License-Identifier: PMPL-1.0-or-later
//! Polarity heuristics
//!
//! Decides whether two similar insights actually disagree. Structured claims
//! are checked first; the textual heuristics (sentiment markers, numeric
//! deltas, negation) only run when the claims say nothing about each other.

use concord_model::{Claim, ClaimValue};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::DetectorError;

const POSITIVE_MARKERS: &[&str] = &[
    "positive", "praised", "praise", "favorable", "favourable", "strong", "growth", "growing",
    "improved", "improving", "success", "successful", "optimistic", "gain", "gains", "up",
    "increase", "increased", "compliant", "approve", "approved", "low",
];

const NEGATIVE_MARKERS: &[&str] = &[
    "negative", "criticized", "criticised", "criticism", "unfavorable", "unfavourable", "weak",
    "decline", "declining", "worsened", "worsening", "failure", "failed", "pessimistic", "loss",
    "losses", "down", "decrease", "decreased", "non-compliant", "noncompliant", "violation",
    "backlash", "high",
];

/// Why two insights were judged to disagree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Disagreement {
    /// Same metric, different categorical, boolean or stage value
    ClaimValue {
        metric: String,
        left: String,
        right: String,
    },
    /// Numeric values apart by more than the tolerance
    NumericDelta { relative_delta: f64 },
    /// One text carries positive markers, the other negative ones
    OppositeSentiment,
    /// Exactly one of the texts is negated
    Negation,
}

impl fmt::Display for Disagreement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disagreement::ClaimValue {
                metric,
                left,
                right,
            } => write!(f, "{} reported as {} and {}", metric, left, right),
            Disagreement::NumericDelta { relative_delta } => {
                write!(f, "values differ by {:.0}%", relative_delta * 100.0)
            }
            Disagreement::OppositeSentiment => write!(f, "opposite sentiment markers"),
            Disagreement::Negation => write!(f, "one insight negates the other"),
        }
    }
}

/// Relative delta `|a - b| / max(|a|, |b|)`; 0 when both are 0.
pub fn relative_delta(a: f64, b: f64) -> f64 {
    let scale = a.abs().max(b.abs());
    if scale == 0.0 {
        0.0
    } else {
        (a - b).abs() / scale
    }
}

/// Compiled text heuristics
#[derive(Debug, Clone)]
pub struct PolarityHeuristics {
    numeric_tolerance: f64,
    number: Regex,
    negation: Regex,
}

impl PolarityHeuristics {
    pub fn new(numeric_tolerance: f64) -> Result<Self, DetectorError> {
        let number = Regex::new(r"(-?\d+(?:\.\d+)?)\s*(%?)")
            .map_err(|e| DetectorError::InvalidPattern(e.to_string()))?;
        let negation = Regex::new(
            r"\b(not|no|never|none|neither|nor|cannot|isn'?t|aren'?t|wasn'?t|weren'?t|doesn'?t|don'?t|didn'?t|won'?t|denied|denies|false)\b",
        )
        .map_err(|e| DetectorError::InvalidPattern(e.to_string()))?;
        Ok(Self {
            numeric_tolerance,
            number,
            negation,
        })
    }

    /// Return the first reason the two insights disagree, if any.
    pub fn disagreement(
        &self,
        left_text: &str,
        left_claim: Option<&Claim>,
        right_text: &str,
        right_claim: Option<&Claim>,
    ) -> Option<Disagreement> {
        if let (Some(l), Some(r)) = (left_claim, right_claim) {
            if l.metric == r.metric {
                // Claims on the same metric are authoritative either way.
                return self.claim_disagreement(l, r);
            }
        }

        let left = left_text.to_lowercase();
        let right = right_text.to_lowercase();

        let (lp, rp) = (sentiment_sign(&left), sentiment_sign(&right));
        if lp * rp < 0 {
            return Some(Disagreement::OppositeSentiment);
        }

        if let Some(delta) = self.text_numeric_delta(&left, &right) {
            if delta > self.numeric_tolerance {
                return Some(Disagreement::NumericDelta {
                    relative_delta: delta,
                });
            }
        }

        if self.negation.is_match(&left) != self.negation.is_match(&right) {
            return Some(Disagreement::Negation);
        }

        None
    }

    fn claim_disagreement(&self, l: &Claim, r: &Claim) -> Option<Disagreement> {
        match (&l.value, &r.value) {
            (ClaimValue::Numeric(a), ClaimValue::Numeric(b)) => {
                let delta = relative_delta(*a, *b);
                (delta > self.numeric_tolerance).then_some(Disagreement::NumericDelta {
                    relative_delta: delta,
                })
            }
            (a, b) => {
                let (ka, kb) = (a.vote_key(), b.vote_key());
                (ka != kb).then(|| Disagreement::ClaimValue {
                    metric: l.metric.clone(),
                    left: a.to_string(),
                    right: b.to_string(),
                })
            }
        }
    }

    /// Delta between the first numbers of each text, compared only when
    /// both carry the same unit suffix.
    fn text_numeric_delta(&self, left: &str, right: &str) -> Option<f64> {
        let first = |text: &str| -> Option<(f64, bool)> {
            let caps = self.number.captures(text)?;
            let value = caps.get(1)?.as_str().parse::<f64>().ok()?;
            let percent = caps.get(2).is_some_and(|m| !m.as_str().is_empty());
            Some((value, percent))
        };
        let (a, pa) = first(left)?;
        let (b, pb) = first(right)?;
        (pa == pb).then(|| relative_delta(a, b))
    }
}

/// +1 when positive markers dominate, -1 when negative ones do, else 0.
fn sentiment_sign(text: &str) -> i32 {
    let mut score = 0i32;
    for token in text.split(|c: char| !(c.is_alphanumeric() || c == '-')) {
        if token.is_empty() {
            continue;
        }
        if POSITIVE_MARKERS.contains(&token) {
            score += 1;
        } else if NEGATIVE_MARKERS.contains(&token) {
            score -= 1;
        }
    }
    score.signum()
}
