//! Shared error taxonomy used across every crate in the workspace.
//!
//! Every crate defines its own `thiserror` enum for its internal failure
//! modes, but converts into [`CoreError`] at its public boundary so callers
//! (and, ultimately, the collaborator that owns the HTTP response) only ever
//! have to match on one set of kinds — see spec.md §7.

use thiserror::Error;

/// The error kinds described in spec.md §7.
///
/// Propagation policy: `InvalidConfig` and `Conflict` escape immediately
/// with no rollback. `Transient` during `setup`/`Start` unwinds whatever
/// revert stack has been built so far and is surfaced to the caller — it is
/// never retried implicitly inside the core. `Fatal` means a revert already
/// happened.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Validation failure; surfaced verbatim to the API caller.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Duplicate name or in-use resource; surfaced as a 409-equivalent.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Resource unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// Authentication failed or secret unknown.
    #[error("unauthorized")]
    Unauthorized,

    /// Authenticated but not permitted.
    #[error("forbidden")]
    Forbidden,

    /// Network error to OVN, IdP, or a peer cluster member. Callers may
    /// retry with bounded back-off; the core never does so implicitly.
    #[error("transient error: {0}")]
    Transient(String),

    /// A projection revert already happened; do not retry implicitly.
    #[error("fatal error after rollback: {0}")]
    Fatal(String),

    /// Escape hatch for collaborator errors (cluster DB, OVN client) that
    /// don't map cleanly onto the kinds above.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        CoreError::InvalidConfig(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CoreError::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        CoreError::NotFound(msg.into())
    }

    /// Every authentication failure reduces to this single opaque kind —
    /// spec.md §4.2/§7 insist internal detail is never exposed to the
    /// caller, so call sites should map specific failures here rather than
    /// threading the original cause through.
    pub fn invalid_token() -> Self {
        CoreError::Unauthorized
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Transient(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
