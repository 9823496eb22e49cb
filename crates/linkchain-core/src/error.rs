//! Error taxonomy for chain orchestration.
//!
//! Only structural misuse is an error here. Link failures are never thrown;
//! they are aggregated into a [`FailureReport`](crate::FailureReport) and
//! handed to the chain's failure callback.

/// Errors produced by chain and link operations.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("cannot call {op}() on a locked chain")]
    Locked { op: &'static str },

    #[error("link reported {op}() to a chain that is not running")]
    NotRunning { op: &'static str },

    #[error("link {link} is already a member of this chain")]
    AlreadyMember { link: String },

    #[error("current owner refused to release link {link}")]
    AdoptionRefused { link: String },

    #[error("chain run ended without a terminal outcome")]
    Abandoned,

    #[error("invalid plan: {0}")]
    Plan(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for chain operations.
pub type ChainResult<T> = std::result::Result<T, ChainError>;
