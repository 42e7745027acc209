use thiserror::Error;

/// Failure kinds surfaced by graph, operator, and allocator operations.
///
/// Every variant is fatal to the operation that raised it but never to the
/// process; callers decide whether to rebuild the graph or give up.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A structural invariant of the graph does not hold. Indicates a bug in
    /// whatever mutated the graph last (usually a rewrite).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Topological sorting made a full pass without emitting an operator.
    #[error("cycle detected: topological sort cannot make progress")]
    CycleDetected,

    /// Shape inference could not reconcile the input shapes of an operator.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The planner has no free block large enough for the request.
    #[error("out of budget: no free block can hold {requested} bytes")]
    OutOfBudget { requested: usize },

    /// An operation arrived after a one-shot state transition already
    /// happened (planning after materialization, re-binding a blob, ...).
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// An operator attribute is malformed (non-permutation permute, axis out
    /// of range, ...).
    #[error("bad attribute: {0}")]
    BadAttribute(String),
}

/// Convenience alias for results returned by the graph core.
pub type Result<T> = std::result::Result<T, GraphError>;
