//! Error taxonomy for the engine, per the container/codec/operator/cache/
//! prefetch/engine error contract. Every fallible surface in this crate
//! returns `Result<T, EngineError>` rather than `Box<dyn Error>`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("format error: {0}")]
    Format(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("buffer too small: need {needed} bytes, have {have}")]
    BufferTooSmall { needed: usize, have: usize },

    #[error("numeric error: {0}")]
    Numeric(String),

    #[error("precondition violated: {0}")]
    Precondition(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn format(msg: impl Into<String>) -> Self {
        EngineError::Format(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        EngineError::NotFound(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        EngineError::Precondition(msg.into())
    }
}
