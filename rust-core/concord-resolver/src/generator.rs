// SPDX-License-Identifier: PMPL-1.0-or-later
//! External generative capability
//!
//! The resolver never talks to a model directly. It hands a
//! [`NarrativeRequest`] to a [`NarrativeGenerator`] and validates whatever
//! comes back. Errors are classified so the retry loop can tell transient
//! failures (timeouts, rate limits) from unusable output.

use async_trait::async_trait;
use concord_model::{
    Claim, ConflictAnalysisResult, ConflictId, ConflictType, RecommendedAction, ResolutionStrategy,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;

/// Failure reported by the generative capability
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("Generation timed out: {0}")]
    Timeout(String),

    #[error("Generation rate limited: {0}")]
    RateLimited(String),

    #[error("Malformed generation output: {0}")]
    Malformed(String),

    #[error("Generator unavailable: {0}")]
    Unavailable(String),
}

impl GenerationError {
    /// Timeouts and rate limits are worth retrying; nothing else is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GenerationError::Timeout(_) | GenerationError::RateLimited(_)
        )
    }

    pub fn class(&self) -> &'static str {
        match self {
            GenerationError::Timeout(_) => "timeout",
            GenerationError::RateLimited(_) => "rate_limited",
            GenerationError::Malformed(_) => "malformed",
            GenerationError::Unavailable(_) => "unavailable",
        }
    }
}

/// One item as presented to the generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemContext {
    pub source_system: String,
    pub text: String,
    pub confidence: f64,
    pub claim: Option<Claim>,
}

/// Output of a rule strategy passed along as extra context (hybrid only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub strategy: ResolutionStrategy,
    pub summary: String,
    pub confidence: f64,
}

/// Everything the generator sees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeRequest {
    pub conflict_id: ConflictId,
    pub conflict_type: ConflictType,
    pub title: String,
    pub items: Vec<ItemContext>,
    pub analysis: Option<ConflictAnalysisResult>,
    pub rule_outcomes: Vec<RuleOutcome>,
}

/// Raw generator output, validated by the resolver before use
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedNarrative {
    /// Optional one-line summary; the narrative's first line is used otherwise
    pub summary: Option<String>,
    pub narrative: String,
    pub recommended_actions: Vec<RecommendedAction>,
    /// Self-reported confidence, clamped by the resolver
    pub confidence: f64,
    pub model: String,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

#[async_trait]
pub trait NarrativeGenerator: Send + Sync {
    async fn generate(&self, request: &NarrativeRequest)
        -> Result<GeneratedNarrative, GenerationError>;
}

// ---------------------------------------------------------------------------
// ScriptedGenerator
// ---------------------------------------------------------------------------

/// Generator that replays a fixed script of responses, one per call.
///
/// When the script runs out the last response is repeated. Used by tests
/// and by the replay binary when no real capability is wired in.
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<GeneratedNarrative, GenerationError>>>,
    last: Mutex<Option<Result<GeneratedNarrative, GenerationError>>>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new(script: Vec<Result<GeneratedNarrative, GenerationError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always answer with `narrative` at `confidence`.
    pub fn always(narrative: impl Into<String>, confidence: f64) -> Self {
        Self::new(vec![Ok(GeneratedNarrative {
            summary: None,
            narrative: narrative.into(),
            recommended_actions: Vec::new(),
            confidence,
            model: "scripted".to_string(),
            prompt_tokens: None,
            completion_tokens: None,
        })])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NarrativeGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        _request: &NarrativeRequest,
    ) -> Result<GeneratedNarrative, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().await.pop_front();
        let mut last = self.last.lock().await;
        match next {
            Some(response) => {
                *last = Some(response.clone());
                response
            }
            None => last.clone().unwrap_or_else(|| {
                Err(GenerationError::Unavailable("script exhausted".to_string()))
            }),
        }
    }
}
