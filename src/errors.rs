use thiserror::Error;

/// Malformed or contradictory command-line input. Raised before any
/// process is spawned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct CommandError(pub String);

impl CommandError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("invalid term: {0}")]
    InvalidTerm(String),
    #[error("unknown predicate: {0}")]
    UnknownPredicate(String),
}
