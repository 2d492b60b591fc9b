// SPDX-License-Identifier: PMPL-1.0-or-later
//! Source normalizer
//!
//! Each analysis subsystem pushes its own payload shape. A stateless adapter
//! per source maps it onto the canonical [`NormalizedInsight`]; everything
//! downstream of this module sees one shape only.

use chrono::{DateTime, Utc};
use concord_model::{Claim, ClaimValue, CreateConflictItemInput, EntityRef, ValidationError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MEDIA_MONITORING: &str = "media_monitoring";
pub const GOVERNANCE: &str = "governance";
pub const RISK_FORECASTING: &str = "risk_forecasting";
pub const COMPETITIVE_INTELLIGENCE: &str = "competitive_intelligence";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("Unknown sentiment label: {0}")]
    UnknownSentiment(String),
}

/// Media monitoring mention with a sentiment label
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaMention {
    pub organization_id: String,
    pub entity: EntityRef,
    pub headline: String,
    #[serde(default)]
    pub excerpt: Option<String>,
    /// `positive`, `neutral`, `negative` or `mixed`
    pub sentiment: String,
    #[serde(default)]
    pub outlet: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    pub confidence: f64,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

/// Result of evaluating one governance rule against an entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceFinding {
    pub organization_id: String,
    pub entity: EntityRef,
    pub rule_id: String,
    pub rule_name: String,
    pub compliant: bool,
    pub finding: String,
    #[serde(default)]
    pub evaluated_at: Option<DateTime<Utc>>,
    pub confidence: f64,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

/// Numeric risk forecast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskForecast {
    pub organization_id: String,
    pub entity: EntityRef,
    /// e.g. `risk_score`
    pub metric: String,
    pub value: f64,
    #[serde(default)]
    pub horizon_days: Option<u32>,
    pub narrative: String,
    #[serde(default)]
    pub forecast_at: Option<DateTime<Utc>>,
    pub confidence: f64,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

/// Competitive intelligence signal: a measured metric, optionally with the
/// lifecycle stage the competitor is believed to be in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompetitiveSignal {
    pub organization_id: String,
    pub entity: EntityRef,
    pub summary: String,
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub stage_ordinal: Option<u32>,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
    pub confidence: f64,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

/// Pass-through for subsystems that already emit canonical fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericInsight {
    pub organization_id: String,
    pub source_system: String,
    pub entity: EntityRef,
    pub text: String,
    #[serde(default)]
    pub processed_text: Option<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub confidence: f64,
    #[serde(default)]
    pub claim: Option<Claim>,
}

/// Raw subsystem output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SourcePayload {
    MediaMonitoring(MediaMention),
    Governance(GovernanceFinding),
    RiskForecast(RiskForecast),
    CompetitiveIntelligence(CompetitiveSignal),
    Generic(GenericInsight),
}

impl SourcePayload {
    pub fn organization_id(&self) -> &str {
        match self {
            SourcePayload::MediaMonitoring(p) => &p.organization_id,
            SourcePayload::Governance(p) => &p.organization_id,
            SourcePayload::RiskForecast(p) => &p.organization_id,
            SourcePayload::CompetitiveIntelligence(p) => &p.organization_id,
            SourcePayload::Generic(p) => &p.organization_id,
        }
    }
}

/// Canonical insight: the organization scope plus an item input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedInsight {
    pub organization_id: String,
    pub item: CreateConflictItemInput,
}

impl NormalizedInsight {
    /// Source timestamp, or `fallback` when the source gave none
    pub fn observed_at(&self, fallback: DateTime<Utc>) -> DateTime<Utc> {
        self.item.source_timestamp.unwrap_or(fallback)
    }
}

/// Lower-case and collapse whitespace.
pub fn process_text(raw: &str) -> String {
    raw.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Map a payload onto a validated canonical insight.
pub fn normalize(
    payload: SourcePayload,
    embedding_dimension: Option<usize>,
) -> Result<NormalizedInsight, NormalizeError> {
    let insight = match payload {
        SourcePayload::MediaMonitoring(p) => from_media(p)?,
        SourcePayload::Governance(p) => from_governance(p),
        SourcePayload::RiskForecast(p) => from_risk(p),
        SourcePayload::CompetitiveIntelligence(p) => from_competitive(p),
        SourcePayload::Generic(p) => from_generic(p),
    };

    if insight.organization_id.trim().is_empty() {
        return Err(ValidationError::new("organization_id", "must not be empty").into());
    }
    insight.item.validate(embedding_dimension)?;
    Ok(insight)
}

fn item(
    entity: EntityRef,
    source_system: &str,
    raw_text: String,
    embedding: Option<Vec<f32>>,
    source_timestamp: Option<DateTime<Utc>>,
    confidence: f64,
    claim: Option<Claim>,
) -> CreateConflictItemInput {
    CreateConflictItemInput {
        processed_text: Some(process_text(&raw_text)),
        entity,
        raw_text,
        embedding,
        source_system: source_system.to_string(),
        source_timestamp,
        confidence,
        role: None,
        claim,
    }
}

fn from_media(p: MediaMention) -> Result<NormalizedInsight, NormalizeError> {
    let sentiment = p.sentiment.trim().to_lowercase();
    if !matches!(sentiment.as_str(), "positive" | "neutral" | "negative" | "mixed") {
        return Err(NormalizeError::UnknownSentiment(p.sentiment));
    }

    let mut raw = p.headline.trim().to_string();
    if let Some(excerpt) = p.excerpt.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
        raw.push_str(". ");
        raw.push_str(excerpt);
    }
    if let Some(outlet) = p.outlet.as_deref().filter(|o| !o.is_empty()) {
        raw.push_str(&format!(" ({})", outlet));
    }

    Ok(NormalizedInsight {
        organization_id: p.organization_id,
        item: item(
            p.entity,
            MEDIA_MONITORING,
            raw,
            p.embedding,
            p.published_at,
            p.confidence,
            Some(Claim::new("sentiment", ClaimValue::Categorical(sentiment))),
        ),
    })
}

fn from_governance(p: GovernanceFinding) -> NormalizedInsight {
    let verdict = if p.compliant { "compliant" } else { "non-compliant" };
    let raw = format!("{} ({}): {}. {}", p.rule_name, p.rule_id, verdict, p.finding.trim());
    NormalizedInsight {
        organization_id: p.organization_id,
        item: item(
            p.entity,
            GOVERNANCE,
            raw,
            p.embedding,
            p.evaluated_at,
            p.confidence,
            Some(Claim::new(
                format!("compliance.{}", p.rule_id),
                ClaimValue::Boolean(p.compliant),
            )),
        ),
    }
}

fn from_risk(p: RiskForecast) -> NormalizedInsight {
    let mut raw = format!("{} forecast {}: {}", p.metric, p.value, p.narrative.trim());
    if let Some(days) = p.horizon_days {
        raw.push_str(&format!(" (horizon {} days)", days));
    }
    NormalizedInsight {
        organization_id: p.organization_id,
        item: item(
            p.entity,
            RISK_FORECASTING,
            raw,
            p.embedding,
            p.forecast_at,
            p.confidence,
            Some(Claim::new(p.metric, ClaimValue::Numeric(p.value))),
        ),
    }
}

fn from_competitive(p: CompetitiveSignal) -> NormalizedInsight {
    // A reported stage wins over the metric: stage order is what the
    // structural checks look at.
    let claim = match (&p.stage, p.stage_ordinal, &p.metric, p.value) {
        (Some(stage), Some(ordinal), _, _) => Some(Claim::new(
            "stage",
            ClaimValue::Stage {
                name: stage.trim().to_lowercase(),
                ordinal,
            },
        )),
        (_, _, Some(metric), Some(value)) => {
            Some(Claim::new(metric.clone(), ClaimValue::Numeric(value)))
        }
        _ => None,
    };
    NormalizedInsight {
        organization_id: p.organization_id,
        item: item(
            p.entity,
            COMPETITIVE_INTELLIGENCE,
            p.summary.trim().to_string(),
            p.embedding,
            p.observed_at,
            p.confidence,
            claim,
        ),
    }
}

fn from_generic(p: GenericInsight) -> NormalizedInsight {
    let processed = p
        .processed_text
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| process_text(&p.text));
    NormalizedInsight {
        organization_id: p.organization_id,
        item: CreateConflictItemInput {
            entity: p.entity,
            raw_text: p.text,
            processed_text: Some(processed),
            embedding: p.embedding,
            source_system: p.source_system.trim().to_string(),
            source_timestamp: p.timestamp,
            confidence: p.confidence,
            role: None,
            claim: p.claim,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_model::EntityKind;

    fn acme() -> EntityRef {
        EntityRef::new(EntityKind::Brand, "acme")
    }

    #[test]
    fn test_media_adapter() {
        let insight = normalize(
            SourcePayload::MediaMonitoring(MediaMention {
                organization_id: "org-1".into(),
                entity: acme(),
                headline: "Acme  Launch   Praised".into(),
                excerpt: Some("Reviewers loved it".into()),
                sentiment: "Positive".into(),
                outlet: None,
                published_at: None,
                confidence: 0.9,
                embedding: None,
            }),
            None,
        )
        .unwrap();
        assert_eq!(insight.item.source_system, MEDIA_MONITORING);
        assert_eq!(
            insight.item.processed_text.as_deref(),
            Some("acme launch praised. reviewers loved it")
        );
        assert_eq!(
            insight.item.claim,
            Some(Claim::new("sentiment", ClaimValue::Categorical("positive".into())))
        );
    }

    #[test]
    fn test_media_adapter_rejects_unknown_sentiment() {
        let err = normalize(
            SourcePayload::MediaMonitoring(MediaMention {
                organization_id: "org-1".into(),
                entity: acme(),
                headline: "Acme".into(),
                excerpt: None,
                sentiment: "ecstatic".into(),
                outlet: None,
                published_at: None,
                confidence: 0.9,
                embedding: None,
            }),
            None,
        )
        .unwrap_err();
        assert_eq!(err, NormalizeError::UnknownSentiment("ecstatic".into()));
    }

    #[test]
    fn test_governance_adapter_boolean_claim() {
        let insight = normalize(
            SourcePayload::Governance(GovernanceFinding {
                organization_id: "org-1".into(),
                entity: acme(),
                rule_id: "R12".into(),
                rule_name: "Disclosure".into(),
                compliant: false,
                finding: "Missing sponsor tag".into(),
                evaluated_at: None,
                confidence: 0.7,
                embedding: None,
            }),
            None,
        )
        .unwrap();
        let claim = insight.item.claim.unwrap();
        assert_eq!(claim.metric, "compliance.R12");
        assert_eq!(claim.value, ClaimValue::Boolean(false));
    }

    #[test]
    fn test_competitive_adapter_prefers_stage() {
        let insight = normalize(
            SourcePayload::CompetitiveIntelligence(CompetitiveSignal {
                organization_id: "org-1".into(),
                entity: EntityRef::new(EntityKind::Competitor, "globex"),
                summary: "Globex entered beta".into(),
                metric: Some("share_of_voice".into()),
                value: Some(0.3),
                stage: Some("Beta".into()),
                stage_ordinal: Some(2),
                observed_at: None,
                confidence: 0.6,
                embedding: None,
            }),
            None,
        )
        .unwrap();
        assert!(matches!(
            insight.item.claim.unwrap().value,
            ClaimValue::Stage { ordinal: 2, .. }
        ));
    }

    #[test]
    fn test_validation_runs_after_adapter() {
        let err = normalize(
            SourcePayload::Generic(GenericInsight {
                organization_id: "org-1".into(),
                source_system: "custom".into(),
                entity: acme(),
                text: "something".into(),
                processed_text: None,
                embedding: Some(vec![0.1, 0.2]),
                timestamp: None,
                confidence: 0.5,
                claim: None,
            }),
            Some(4),
        )
        .unwrap_err();
        assert!(matches!(err, NormalizeError::Invalid(ref v) if v.field == "embedding"));
    }

    #[test]
    fn test_payload_tagging() {
        let json = serde_json::json!({
            "source": "risk_forecast",
            "organization_id": "org-1",
            "entity": {"kind": "brand", "id": "acme"},
            "metric": "risk_score",
            "value": 0.42,
            "narrative": "Elevated",
            "confidence": 0.8
        });
        let payload: SourcePayload = serde_json::from_value(json).unwrap();
        let insight = normalize(payload, None).unwrap();
        assert_eq!(insight.item.source_system, RISK_FORECASTING);
        assert_eq!(insight.item.claim.unwrap().value, ClaimValue::Numeric(0.42));
    }
}
