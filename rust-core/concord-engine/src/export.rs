// SPDX-License-Identifier: PMPL-1.0-or-later
//! Export bundles.
//!
//! An export is rendered once, kept in memory until it expires and fetched
//! by id. The engine has no blob store, so `url` is always `None`.

use chrono::{DateTime, Utc};
use concord_audit::AuditEntry;
use concord_model::{Conflict, ConflictItem, InsightConflictResolution};
use serde::{Deserialize, Serialize};

use crate::query::DateRange;
use crate::EngineError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    /// One pretty-printed document
    #[default]
    Json,
    /// One record per line
    Ndjson,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportRequest {
    pub format: ExportFormat,
    pub include_items: bool,
    pub include_resolutions: bool,
    pub include_audit_log: bool,
    /// Restricts by conflict creation time
    pub date_range: DateRange,
    pub organization_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportHandle {
    pub export_id: String,
    pub url: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub record_count: usize,
}

/// A rendered export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredExport {
    pub format: ExportFormat,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl StoredExport {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// One conflict with the optional sections the request asked for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRecord {
    pub conflict: Conflict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<ConflictItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolutions: Option<Vec<InsightConflictResolution>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_log: Option<Vec<AuditEntry>>,
}

#[derive(Serialize)]
struct Bundle<'a> {
    export_id: &'a str,
    generated_at: DateTime<Utc>,
    records: &'a [ExportRecord],
}

/// Serialize `records` in the requested format.
pub(crate) fn render(
    format: ExportFormat,
    export_id: &str,
    generated_at: DateTime<Utc>,
    records: &[ExportRecord],
) -> Result<String, EngineError> {
    let encode = |e: serde_json::Error| EngineError::Internal(format!("export encoding failed: {}", e));
    match format {
        ExportFormat::Json => serde_json::to_string_pretty(&Bundle {
            export_id,
            generated_at,
            records,
        })
        .map_err(encode),
        ExportFormat::Ndjson => {
            let mut out = String::new();
            for record in records {
                out.push_str(&serde_json::to_string(record).map_err(encode)?);
                out.push('\n');
            }
            Ok(out)
        }
    }
}
