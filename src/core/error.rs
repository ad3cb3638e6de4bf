use crate::core::phase::InvalidTransition;
use thiserror::Error;

/// Errors surfaced to whoever asked for an illustration.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Insufficient balance: {balance} available, {cost} required")]
    InsufficientBalance { balance: u64, cost: u64 },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Upstream generation error: {0}")]
    Upstream(String),

    #[error("Generation timed out after {attempts} poll attempts")]
    Timeout { attempts: u32 },

    #[error("Missing prerequisite: {0}")]
    MissingPrerequisite(&'static str),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GenerationError {
    /// Stable code for clients, e.g. to offer a "top up" action.
    pub fn code(&self) -> &'static str {
        match self {
            GenerationError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            GenerationError::Unauthorized(_) => "UNAUTHORIZED",
            GenerationError::Upstream(_) => "UPSTREAM_ERROR",
            GenerationError::Timeout { .. } => "GENERATION_TIMEOUT",
            GenerationError::MissingPrerequisite(_) => "MISSING_PREREQUISITE",
            GenerationError::InvalidTransition(_) => "INVALID_TRANSITION",
            GenerationError::Other(_) => "INTERNAL",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenerationError::Upstream(_) | GenerationError::Timeout { .. } | GenerationError::Other(_)
        )
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        GenerationError::Upstream(err.to_string())
    }
}

pub type GenResult<T> = std::result::Result<T, GenerationError>;
