// SPDX-License-Identifier: PMPL-1.0-or-later
//! Prometheus instrumentation. Optional: the engine runs without a registry.

use concord_model::ErrorKind;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

use crate::EngineError;

#[derive(Clone)]
pub struct EngineMetrics {
    pub conflicts_created: IntCounter,
    pub items_attached: IntCounter,
    pub resolutions_created: IntCounter,
    pub operation_failures: IntCounterVec,
    pub open_conflicts: IntGauge,
}

impl EngineMetrics {
    /// Create and register every metric on `registry`.
    pub fn register(registry: &Registry) -> Result<Self, EngineError> {
        let metrics = Self {
            conflicts_created: IntCounter::new(
                "concord_conflicts_created_total",
                "Conflicts opened by detection, backfill or manual creation",
            )
            .map_err(internal)?,
            items_attached: IntCounter::new(
                "concord_items_attached_total",
                "Insight items attached to existing conflicts",
            )
            .map_err(internal)?,
            resolutions_created: IntCounter::new(
                "concord_resolutions_created_total",
                "Resolutions produced by any strategy",
            )
            .map_err(internal)?,
            operation_failures: IntCounterVec::new(
                Opts::new(
                    "concord_operation_failures_total",
                    "Failed engine operations by error kind",
                ),
                &["kind"],
            )
            .map_err(internal)?,
            open_conflicts: IntGauge::new(
                "concord_open_conflicts",
                "Conflicts currently detected or analyzing",
            )
            .map_err(internal)?,
        };

        registry
            .register(Box::new(metrics.conflicts_created.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(metrics.items_attached.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(metrics.resolutions_created.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(metrics.operation_failures.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(metrics.open_conflicts.clone()))
            .map_err(internal)?;
        Ok(metrics)
    }

    pub fn failure(&self, kind: ErrorKind) {
        self.operation_failures
            .with_label_values(&[&kind.to_string()])
            .inc();
    }
}

fn internal(e: prometheus::Error) -> EngineError {
    EngineError::Internal(format!("metrics registration failed: {}", e))
}
