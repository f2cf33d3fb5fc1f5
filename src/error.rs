// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-steer.

/// Errors that can occur while building, attaching, or running a steered
/// generation request.
#[derive(Debug, thiserror::Error)]
pub enum SteerError {
    /// Model loading or forward pass error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Model or steering configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Steering rule validation or application error.
    #[error("steering error: {0}")]
    Steering(String),

    /// Chat template rendering error.
    #[error("template error: {0}")]
    Template(String),

    /// Generation loop error (sampling, session state).
    #[error("generation error: {0}")]
    Generation(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON parse error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type alias for candle-steer operations.
pub type Result<T> = std::result::Result<T, SteerError>;
