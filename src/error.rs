use std::fmt;

/// Engine-wide error taxonomy (see the error handling design notes).
///
/// Component boundaries return `Result<_, EngineError>`; `?` propagates.
/// Every variant carries enough context to render the human-readable
/// reason stored in `PredicateStatus::Interrupted`.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// RPC/HTTP failure expected to resolve with retry.
    Transient { detail: String },
    /// Malformed block, or a parent that could not be fetched.
    AdapterProtocol { detail: String },
    /// Pool invariant broken (e.g. rollback exceeds the reorg window).
    PoolInvariant { detail: String },
    /// Predicate JSON rejected at registration (bad regex, bad shape).
    PredicateAuthoring { detail: String },
    /// Dispatch exhausted retries or the sink itself failed.
    Dispatch { detail: String },
    /// Scan coordinator hit a missing/corrupt block index.
    Scan { detail: String },
}

impl EngineError {
    pub fn transient(detail: impl Into<String>) -> Self {
        Self::Transient { detail: detail.into() }
    }

    pub fn adapter_protocol(detail: impl Into<String>) -> Self {
        Self::AdapterProtocol { detail: detail.into() }
    }

    pub fn pool_invariant(detail: impl Into<String>) -> Self {
        Self::PoolInvariant { detail: detail.into() }
    }

    pub fn predicate_authoring(detail: impl Into<String>) -> Self {
        Self::PredicateAuthoring { detail: detail.into() }
    }

    pub fn dispatch(detail: impl Into<String>) -> Self {
        Self::Dispatch { detail: detail.into() }
    }

    pub fn scan(detail: impl Into<String>) -> Self {
        Self::Scan { detail: detail.into() }
    }

    /// Whether this error, left unhandled, should move a predicate to
    /// `Interrupted`. Transient errors are retried by their caller and
    /// never reach here directly; everything else is structural.
    pub fn is_interrupting(&self) -> bool {
        !matches!(self, EngineError::Transient { .. })
    }

    /// Render the reason string stored on `PredicateStatus::Interrupted`.
    pub fn interrupt_reason(&self) -> String {
        format!("{}", self)
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Transient { detail } => write!(f, "transient error: {}", detail),
            EngineError::AdapterProtocol { detail } => write!(f, "adapter protocol error: {}", detail),
            EngineError::PoolInvariant { detail } => write!(f, "pool invariant violation: {}", detail),
            EngineError::PredicateAuthoring { detail } => write!(f, "predicate authoring error: {}", detail),
            EngineError::Dispatch { detail } => write!(f, "dispatch failure: {}", detail),
            EngineError::Scan { detail } => write!(f, "scan failure: {}", detail),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<rocksdb::Error> for EngineError {
    fn from(e: rocksdb::Error) -> Self {
        EngineError::Transient { detail: e.to_string() }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::PredicateAuthoring { detail: e.to_string() }
    }
}

impl From<regex::Error> for EngineError {
    fn from(e: regex::Error) -> Self {
        EngineError::PredicateAuthoring { detail: format!("invalid regex: {}", e) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_does_not_interrupt() {
        let e = EngineError::transient("connection reset");
        assert!(!e.is_interrupting());
    }

    #[test]
    fn pool_invariant_interrupts() {
        let e = EngineError::pool_invariant("rollback exceeds window");
        assert!(e.is_interrupting());
        assert_eq!(e.interrupt_reason(), "pool invariant violation: rollback exceeds window");
    }
}
