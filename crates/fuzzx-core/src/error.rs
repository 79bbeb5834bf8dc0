use std::fmt;

use fuzzx_dsa::TreeError;

/// Failures the engine cannot absorb by resetting a target.
#[derive(Debug)]
pub enum EngineError {
    Tree(TreeError),
    InvariantViolation(String),
    Config(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Tree(e) => write!(f, "tree failure: {e}"),
            EngineError::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
            EngineError::Config(msg) => write!(f, "configuration error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<TreeError> for EngineError {
    fn from(e: TreeError) -> Self {
        EngineError::Tree(e)
    }
}
