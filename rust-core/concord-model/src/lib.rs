// SPDX-License-Identifier: PMPL-1.0-or-later
//! Concord Conflict Model
//!
//! The conflict is the aggregate root: it owns its insight items, its
//! (replaceable) analysis and its resolutions. Clusters and graph edges
//! reference conflicts by id only.
//!
//! This crate is pure data plus the status state machine. Mutation rules
//! (who may change what, and when) are enforced by the engine.

use serde::{Deserialize, Serialize};
use std::fmt;

mod analysis;
mod cluster;
mod conflict;
mod edge;
mod policy;
mod resolution;

pub use analysis::{
    ConflictAnalysisResult, Difficulty, ItemSimilarity, RelatedConflict, RootCause, SystemImpact,
};
pub use cluster::InsightConflictCluster;
pub use conflict::{
    check_shared_dimension, Claim, ClaimValue, Conflict, ConflictItem, ConflictStatus, ConflictType,
    CreateConflictInput, CreateConflictItemInput, InvalidTransition, ItemRole, Severity,
    ValidationError,
};
pub use edge::{ConflictGraphEdge, EdgeType};
pub use policy::SourcePolicy;
pub use resolution::{
    ActionPriority, GeneratedBy, GenerationProvenance, InsightConflictResolution,
    RecommendedAction, ResolutionStrategy, ReviewState,
};

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Wrap an existing identifier
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new UUID-based identifier
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// Get the ID as a string reference
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

entity_id!(
    /// Identifier of a conflict aggregate
    ConflictId
);
entity_id!(
    /// Identifier of an insight item inside a conflict
    ItemId
);
entity_id!(
    /// Identifier of a resolution
    ResolutionId
);
entity_id!(
    /// Identifier of a conflict cluster
    ClusterId
);
entity_id!(
    /// Identifier of a persisted graph edge
    EdgeId
);

/// Stable error classification surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input; nothing was applied
    Validation,
    /// Unknown conflict, resolution, cluster or export id
    NotFound,
    /// Operation invalid for the conflict's current status
    StateConflict,
    /// External generative capability failed or returned unusable output
    Generation,
    /// Lost the single-writer race for a conflict id
    Concurrency,
    /// Caller-supplied deadline elapsed before commit
    Timeout,
    /// Audit or storage failure; nothing was committed
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation_error"),
            ErrorKind::NotFound => write!(f, "not_found_error"),
            ErrorKind::StateConflict => write!(f, "state_conflict_error"),
            ErrorKind::Generation => write!(f, "generation_error"),
            ErrorKind::Concurrency => write!(f, "concurrency_error"),
            ErrorKind::Timeout => write!(f, "timeout_error"),
            ErrorKind::Internal => write!(f, "internal_error"),
        }
    }
}

/// Kind of entity an insight is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Brand,
    Campaign,
    Journalist,
    Competitor,
    Other,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Brand => write!(f, "brand"),
            EntityKind::Campaign => write!(f, "campaign"),
            EntityKind::Journalist => write!(f, "journalist"),
            EntityKind::Competitor => write!(f, "competitor"),
            EntityKind::Other => write!(f, "other"),
        }
    }
}

/// Reference to the shared entity an insight talks about
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Who performed a state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    System,
    Ai,
}

impl fmt::Display for ActorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::System => write!(f, "system"),
            ActorType::Ai => write!(f, "ai"),
        }
    }
}

/// Actor identity recorded with every audit entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub actor_type: ActorType,
}

impl Actor {
    /// The engine itself
    pub fn system() -> Self {
        Self {
            id: "concord-engine".to_string(),
            actor_type: ActorType::System,
        }
    }

    /// A human user
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            actor_type: ActorType::User,
        }
    }

    /// A generative model acting on the engine's behalf
    pub fn ai(model: impl Into<String>) -> Self {
        Self {
            id: model.into(),
            actor_type: ActorType::Ai,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids() {
        let id = ConflictId::new("c-1");
        assert_eq!(id.as_str(), "c-1");
        assert_eq!(id.to_string(), "c-1");
        assert_ne!(ConflictId::generate(), ConflictId::generate());
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"c-1\"");
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::StateConflict.to_string(), "state_conflict_error");
        assert_eq!(
            serde_json::to_string(&ErrorKind::NotFound).unwrap(),
            "\"not_found\""
        );
    }

    #[test]
    fn test_entity_ref_display() {
        let e = EntityRef::new(EntityKind::Brand, "acme");
        assert_eq!(e.to_string(), "brand:acme");
    }
}
