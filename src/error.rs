//! Error taxonomy for the control plane
//!
//! - `ValidationError`: malformed operator input. Surfaced, never retried.
//! - `ControlError::Conflict`: a delete blocked by a live reference.
//! - `ControlError::NotFound`: unknown entity id.
//! - `ControlError::Apply`: the proxy engine rejected the document or timed out.
//!   The orchestrator compensates the mutation before surfacing it.
//! - `ControlError::Rollback`: compensation itself failed. The entity store and
//!   the live proxy now disagree; this is never absorbed.

use thiserror::Error;

/// Malformed input detected before anything is persisted or applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Address is not an IPv4 or IPv6 literal
    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    /// CIDR rule does not parse
    #[error("invalid CIDR '{cidr}': {reason}")]
    InvalidCidr { cidr: String, reason: String },

    /// Host advanced-configuration fragment is not a JSON object
    #[error("invalid advanced config for host {host}: {reason}")]
    InvalidAdvancedConfig { host: String, reason: String },

    /// Two locations of the same host share a path prefix
    #[error("host {host} already has a location for path '{path}'")]
    DuplicateLocation { host: String, path: String },

    /// Host references an entity that does not exist
    #[error("host {host} references missing {entity} {id}")]
    MissingReference {
        host: String,
        entity: &'static str,
        id: String,
    },

    /// Generic field-level validation failure
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ValidationError {
    pub(crate) fn field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Why the proxy engine did not accept a document.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Engine answered with a non-2xx status; body carried verbatim
    #[error("proxy engine rejected config (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    /// No definitive answer within the configured timeout
    #[error("proxy engine did not answer within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Connection-level failure
    #[error("proxy engine unreachable: {0}")]
    Transport(String),
}

/// A failed apply, tied to the document hash that was attempted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("apply of config {hash} failed: {source}")]
pub struct ApplyError {
    pub hash: String,
    #[source]
    pub source: EngineError,
}

/// Top-level error returned by every control-plane operation.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{entity} {id} is still referenced by {} host(s)", .referenced_by.len())]
    Conflict {
        entity: &'static str,
        id: String,
        referenced_by: Vec<String>,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error(transparent)]
    Apply(#[from] ApplyError),

    /// Compensation failed after an apply failure: store and live proxy diverged
    #[error("rollback of {mutation} failed after {cause}: {reason}")]
    Rollback {
        mutation: String,
        cause: Box<ControlError>,
        reason: String,
    },

    #[error("backup failed: {0}")]
    Backup(String),

    #[error("store error: {0}")]
    Store(String),
}

impl ControlError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Stable machine-readable code for API responses and audit records
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Conflict { .. } => "conflict",
            Self::NotFound { .. } => "not_found",
            Self::Apply(_) => "apply_failed",
            Self::Rollback { .. } => "rollback_failed",
            Self::Backup(_) => "backup_failed",
            Self::Store(_) => "store_error",
        }
    }
}

pub type Result<T, E = ControlError> = std::result::Result<T, E>;
