use thiserror::Error;
use uuid::Uuid;

/// Engine-level error taxonomy.
///
/// Structural faults and invariant violations are fatal to the case they
/// occur in (the case is parked in a fault state); item failures leave the
/// case running pending an external decision; persistence failures trigger
/// a rollback of the in-flight transition unit.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An unresolvable routing decision in the net itself (e.g. an
    /// XOR-split where no predicate matched and no default flow exists).
    #[error("[{rule}] {message}")]
    Structural { rule: &'static str, message: String },

    /// An external executor reported failure for a work item.
    #[error("work item {item} failed: {reason}")]
    ItemFailure { item: Uuid, reason: String },

    /// The snapshot write at the end of a transition unit did not succeed.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Programming error, not a domain error: double-fire, negative token
    /// count, illegal work item transition. Never coerced into a valid state.
    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("unknown net '{0}'")]
    UnknownNet(String),

    #[error("unknown case {0}")]
    UnknownCase(Uuid),

    #[error("unknown work item {0}")]
    UnknownWorkItem(Uuid),

    /// The case is terminal (or otherwise not accepting this event).
    #[error("case {0} is not accepting events")]
    CaseNotActive(Uuid),
}

impl EngineError {
    pub fn structural(rule: &'static str, message: impl Into<String>) -> Self {
        EngineError::Structural {
            rule,
            message: message.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        EngineError::Invariant(message.into())
    }

    /// True for errors that park the case in `SuspendedFault`.
    pub fn is_fatal_to_case(&self) -> bool {
        matches!(
            self,
            EngineError::Structural { .. } | EngineError::Invariant(_)
        )
    }
}
