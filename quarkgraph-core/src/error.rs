//! Error types for graph operations.
//!
//! Every fallible operation in the crate returns [`GraphError`]. Failures that
//! happen during propagation abort the whole transaction: the checkout stays
//! at its prior revision.

use std::sync::Arc;

use thiserror::Error;

/// Errors produced by checkouts, transactions and the propagation engine.
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    /// The identifier is not part of the checkout (never added, or removed).
    #[error("unknown identifier {identifier}")]
    UnknownIdentifier {
        /// Label of the identifier (`name#id`).
        identifier: String,
    },

    /// A value was written to a shadow quark that was never acquired.
    #[error("can not set value to the shadow quark of {identifier}")]
    ShadowMutation {
        /// Label of the identifier owning the shadow.
        identifier: String,
    },

    /// The calculation of an identifier that must never be recalculated was invoked.
    #[error(
        "abstract calculation of {identifier} invoked: variables are never recalculated, \
         their value is set directly"
    )]
    AbstractCalculation {
        /// Label of the offending identifier.
        identifier: String,
    },

    /// Propagation revisited a node that was still being calculated.
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle {
        /// Labels of the identifiers forming the cycle, first and last are the same node.
        path: Vec<String>,
    },

    /// A user supplied calculation failed.
    #[error("calculation of {identifier} failed: {error}")]
    Calculation {
        /// Label of the identifier whose calculation failed.
        identifier: String,
        /// The error returned by the calculation.
        error: Arc<anyhow::Error>,
    },

    /// A value was requested from a cell that has neither a proposed nor a committed value.
    #[error("identifier {identifier} has no value")]
    Uninitialized {
        /// Label of the identifier.
        identifier: String,
    },

    /// A stored value did not have the type the typed handle expects.
    #[error("value of {identifier} is not a {expected}")]
    TypeMismatch {
        /// Label of the identifier.
        identifier: String,
        /// Name of the expected Rust type.
        expected: &'static str,
    },

    /// Invalid graph configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl GraphError {
    /// Returns true if this error reports a dependency cycle.
    pub fn is_cycle(&self) -> bool {
        matches!(self, GraphError::Cycle { .. })
    }

    /// Returns the user error if this is a failed calculation.
    pub fn user_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            GraphError::Calculation { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Attempts to downcast a failed calculation's error to a concrete type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.user_error().and_then(|e| e.downcast_ref::<E>())
    }
}
