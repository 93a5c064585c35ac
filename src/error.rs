//! Error types for graft.
//!
//! All errors are strongly typed using thiserror. Structural invariants of
//! the matching network are *not* represented here: per the engine contract
//! they are programming errors, guarded by `debug_assert!` and the injected
//! validator, never by user-facing `Result`s.

use thiserror::Error;

use crate::engine::ActionId;

/// Errors raised while compiling a rule specification into network nodes.
///
/// Build errors are detected before any node is created, so a failed build
/// never leaves a partial graph behind.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Rule '{name}' has no conditions")]
    EmptyRule {
        name: String,
    },

    #[error("Rule name cannot be empty")]
    EmptyRuleName,

    #[error("A rule named '{name}' already exists")]
    DuplicateRuleName {
        name: String,
    },

    #[error("The first condition of rule '{name}' must be a fact pattern")]
    LeadingNonPattern {
        name: String,
    },

    #[error("Variable '{variable}' is used before any pattern binds it")]
    UnboundVariable {
        variable: String,
    },

    #[error("Fact slots must be ground symbols, found variable '{variable}'")]
    VariableInFact {
        variable: String,
    },

    #[error("Variable '{variable}' repeats inside a leading quantified pattern")]
    QuantifiedDuplicateVariable {
        variable: String,
    },
}

/// Errors raised by a refinement request against the value tree.
///
/// A failed refinement leaves the leaf exactly as it was.
#[derive(Debug, Error)]
pub enum RefineError {
    #[error("Refinement target is not an unsplit leaf")]
    LeafNotUnsplit,

    #[error("Registration parent must be a split node")]
    ParentNotSplit,

    #[error("Value node is gone or was excised")]
    NodeGone,

    #[error("No feature available for the requested refinement")]
    MissingFeature,

    #[error("Remapped variable '{variable}' conflicts with an existing binding")]
    AmbiguousRefinement {
        variable: String,
    },

    #[error("Source chain ends in a node kind that cannot seed a fringe")]
    UnrefinableAncestor,
}

/// Execution errors surfaced while draining the agenda or dispatching
/// handlers.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Unknown action: {id}")]
    UnknownAction {
        id: ActionId,
    },

    #[error("Unknown value node handle")]
    UnknownValueNode,

    #[error("Handler for action {id} failed: {message}")]
    HandlerFailed {
        id: ActionId,
        message: String,
    },

    #[error("Snapshot fingerprint mismatch: expected {expected}, found {actual}")]
    SnapshotCorrupt {
        expected: String,
        actual: String,
    },

    #[error("Snapshot codec error: {message}")]
    SnapshotCodec {
        message: String,
    },
}

/// Top-level error type for graft.
#[derive(Debug, Error)]
pub enum GraftError {
    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Refine error: {0}")]
    Refine(#[from] RefineError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl GraftError {
    /// Creates an internal error with the given message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Convenient result alias used throughout the crate.
pub type GraftResult<T> = Result<T, GraftError>;
