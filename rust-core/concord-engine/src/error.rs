// SPDX-License-Identifier: PMPL-1.0-or-later
//! Engine error taxonomy.
//!
//! Every variant maps to one stable [`ErrorKind`] and carries the conflict
//! id when the failure concerns a single conflict.

use concord_audit::AuditError;
use concord_model::{ConflictId, ConflictStatus, ErrorKind};
use concord_resolver::ResolverError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation failed{}: {message}", on(.conflict_id))]
    Validation {
        conflict_id: Option<ConflictId>,
        message: String,
    },

    #[error("{entity} {id} not found")]
    NotFound {
        entity: &'static str,
        id: String,
        conflict_id: Option<ConflictId>,
    },

    #[error("Conflict {conflict_id} is {status}: {message}")]
    StateConflict {
        conflict_id: ConflictId,
        status: ConflictStatus,
        message: String,
    },

    #[error("Resolution failed for conflict {conflict_id}: {source}")]
    Resolver {
        conflict_id: ConflictId,
        #[source]
        source: ResolverError,
    },

    #[error("Conflict {conflict_id} is locked by another writer (waited {waited_ms}ms)")]
    Concurrency {
        conflict_id: ConflictId,
        waited_ms: u64,
    },

    #[error("{operation} on conflict {conflict_id} timed out after {timeout_ms}ms")]
    Timeout {
        conflict_id: ConflictId,
        operation: &'static str,
        timeout_ms: u64,
    },

    /// A multi-conflict pass (detection, replay) ran past its deadline
    #[error("{operation} timed out after {timeout_ms}ms")]
    PassTimeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("Audit failure{}: {source}", on(.conflict_id))]
    Audit {
        conflict_id: Option<ConflictId>,
        #[source]
        source: AuditError,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

fn on(conflict_id: &Option<ConflictId>) -> String {
    conflict_id
        .as_ref()
        .map(|id| format!(" for conflict {}", id))
        .unwrap_or_default()
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation {
            conflict_id: None,
            message: message.into(),
        }
    }

    pub fn invalid(conflict_id: &ConflictId, message: impl Into<String>) -> Self {
        EngineError::Validation {
            conflict_id: Some(conflict_id.clone()),
            message: message.into(),
        }
    }

    pub fn conflict_not_found(id: &ConflictId) -> Self {
        EngineError::NotFound {
            entity: "Conflict",
            id: id.to_string(),
            conflict_id: Some(id.clone()),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
            conflict_id: None,
        }
    }

    pub fn state(conflict_id: &ConflictId, status: ConflictStatus, message: impl Into<String>) -> Self {
        EngineError::StateConflict {
            conflict_id: conflict_id.clone(),
            status,
            message: message.into(),
        }
    }

    /// Stable classification for callers
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation { .. } => ErrorKind::Validation,
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::StateConflict { .. } => ErrorKind::StateConflict,
            EngineError::Resolver { source, .. } => match source {
                ResolverError::Generation { .. } => ErrorKind::Generation,
                ResolverError::NoItems | ResolverError::InvalidWeights(_) => ErrorKind::Validation,
                ResolverError::InvalidConfig(_) => ErrorKind::Validation,
            },
            EngineError::Concurrency { .. } => ErrorKind::Concurrency,
            EngineError::Timeout { .. } | EngineError::PassTimeout { .. } => ErrorKind::Timeout,
            EngineError::Audit { .. } | EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Conflict the failure concerns, if any
    pub fn conflict_id(&self) -> Option<&ConflictId> {
        match self {
            EngineError::Validation { conflict_id, .. }
            | EngineError::NotFound { conflict_id, .. }
            | EngineError::Audit { conflict_id, .. } => conflict_id.as_ref(),
            EngineError::StateConflict { conflict_id, .. }
            | EngineError::Resolver { conflict_id, .. }
            | EngineError::Concurrency { conflict_id, .. }
            | EngineError::Timeout { conflict_id, .. } => Some(conflict_id),
            EngineError::PassTimeout { .. } | EngineError::Internal(_) => None,
        }
    }

    /// Current status for state conflicts, so callers can refresh and retry
    pub fn current_status(&self) -> Option<ConflictStatus> {
        match self {
            EngineError::StateConflict { status, .. } => Some(*status),
            _ => None,
        }
    }
}
