// SPDX-License-Identifier: PMPL-1.0-or-later
//! Engine configuration.
//!
//! Every component config carries its own defaults; `EngineConfig` bundles
//! them with the source policy and the orchestration limits. Values can be
//! loaded from JSON and overridden from `CONCORD_*` environment variables.

use std::time::Duration;

use concord_analyzer::AnalyzerConfig;
use concord_cluster::ClusterConfig;
use concord_detector::DetectorConfig;
use concord_model::SourcePolicy;
use concord_resolver::ResolverConfig;
use serde::{Deserialize, Serialize};

use crate::EngineError;

pub const ENV_JOIN_THRESHOLD: &str = "CONCORD_JOIN_THRESHOLD";
pub const ENV_CLUSTER_THRESHOLD: &str = "CONCORD_CLUSTER_THRESHOLD";
pub const ENV_EMBEDDING_DIM: &str = "CONCORD_EMBEDDING_DIM";
pub const ENV_OPERATION_TIMEOUT_MS: &str = "CONCORD_OPERATION_TIMEOUT_MS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub detector: DetectorConfig,
    pub analyzer: AnalyzerConfig,
    pub resolver: ResolverConfig,
    pub cluster: ClusterConfig,
    pub policy: SourcePolicy,
    /// Required embedding dimensionality; unchecked when `None`
    pub embedding_dimension: Option<usize>,
    /// How long an operation waits for a conflict's writer slot
    pub lock_wait_ms: u64,
    /// Deadline applied when the caller supplies none; `None` disables it
    pub operation_timeout_ms: Option<u64>,
    /// Lifetime of a stored export
    pub export_ttl_secs: i64,
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            analyzer: AnalyzerConfig::default(),
            resolver: ResolverConfig::default(),
            cluster: ClusterConfig::default(),
            policy: SourcePolicy::default(),
            embedding_dimension: None,
            lock_wait_ms: 5_000,
            operation_timeout_ms: Some(30_000),
            export_ttl_secs: 24 * 3600,
            default_page_size: 20,
            max_page_size: 100,
        }
    }
}

impl EngineConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::validation(format!("invalid engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden from the process environment.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `CONCORD_*` overrides read through `lookup`.
    ///
    /// A variable that is set but does not parse is an error.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, EngineError> {
        if let Some(v) = parsed::<f64>(&lookup, ENV_JOIN_THRESHOLD)? {
            self.detector.join_threshold = v;
            self.analyzer.join_threshold = v;
        }
        if let Some(v) = parsed::<f64>(&lookup, ENV_CLUSTER_THRESHOLD)? {
            self.cluster.cluster_threshold = v;
        }
        if let Some(v) = parsed::<usize>(&lookup, ENV_EMBEDDING_DIM)? {
            self.embedding_dimension = Some(v);
        }
        if let Some(v) = parsed::<u64>(&lookup, ENV_OPERATION_TIMEOUT_MS)? {
            self.operation_timeout_ms = (v > 0).then_some(v);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.detector
            .validate()
            .map_err(|e| EngineError::validation(e.to_string()))?;
        self.analyzer
            .validate()
            .map_err(|e| EngineError::validation(e.to_string()))?;
        self.resolver
            .validate()
            .map_err(|e| EngineError::validation(e.to_string()))?;
        self.cluster
            .validate()
            .map_err(|e| EngineError::validation(e.to_string()))?;
        if self.embedding_dimension == Some(0) {
            return Err(EngineError::validation("embedding_dimension must be positive"));
        }
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            return Err(EngineError::validation(
                "default_page_size must be in [1, max_page_size]",
            ));
        }
        if self.export_ttl_secs <= 0 {
            return Err(EngineError::validation("export_ttl_secs must be positive"));
        }
        if (self.detector.join_threshold - self.analyzer.join_threshold).abs() > f64::EPSILON {
            return Err(EngineError::validation(
                "detector and analyzer join thresholds differ",
            ));
        }
        Ok(())
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }

    pub fn export_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.export_ttl_secs)
    }
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, EngineError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| EngineError::validation(format!("{}={:?}: {}", key, raw, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.detector.join_threshold, 0.72);
        assert_eq!(config.cluster.cluster_threshold, 0.6);
        assert_eq!(config.lock_wait(), Duration::from_secs(5));
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::default()
            .with_overrides(env(&[
                (ENV_JOIN_THRESHOLD, "0.8"),
                (ENV_CLUSTER_THRESHOLD, "0.7"),
                (ENV_EMBEDDING_DIM, "384"),
                (ENV_OPERATION_TIMEOUT_MS, "0"),
            ]))
            .unwrap();
        assert_eq!(config.detector.join_threshold, 0.8);
        assert_eq!(config.analyzer.join_threshold, 0.8);
        assert_eq!(config.cluster.cluster_threshold, 0.7);
        assert_eq!(config.embedding_dimension, Some(384));
        assert_eq!(config.operation_timeout(), None);
    }

    #[test]
    fn test_invalid_env_value_is_an_error() {
        let err = EngineConfig::default()
            .with_overrides(env(&[(ENV_EMBEDDING_DIM, "many")]))
            .unwrap_err();
        assert_eq!(err.kind(), concord_model::ErrorKind::Validation);

        let err = EngineConfig::default()
            .with_overrides(env(&[(ENV_JOIN_THRESHOLD, "1.5")]))
            .unwrap_err();
        assert_eq!(err.kind(), concord_model::ErrorKind::Validation);
    }

    #[test]
    fn test_json_partial_config() {
        let config = EngineConfig::from_json_str(
            r#"{ "embedding_dimension": 3, "cluster": { "min_cluster_size": 4 } }"#,
        )
        .unwrap();
        assert_eq!(config.embedding_dimension, Some(3));
        assert_eq!(config.cluster.min_cluster_size, 4);
        assert_eq!(config.cluster.cluster_threshold, 0.6);
        assert!(EngineConfig::from_json_str("{ not json").is_err());
    }
}
