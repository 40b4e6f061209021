//! Error types for parsing and configuration validation.
//!
//! Engine operations never fail: unknown ids and violated preconditions
//! degrade to no-ops. Only text parsing and config validation return these.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("unknown agent type: {0}")]
    UnknownAgent(String),

    #[error("unknown split direction: {0}")]
    UnknownDirection(String),

    #[error("invalid id {value:?}: expected {expected}")]
    InvalidId { value: String, expected: &'static str },

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}
