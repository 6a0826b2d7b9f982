/// Crate-wide error type.
///
/// Library code returns `EngineError` so callers can match on the failure
/// category described in the error-handling design (input validation,
/// transient vendor error, vendor protocol error, cache error, fatal).
/// Binaries propagate with `anyhow` the way `backfill.rs` already does.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("vendor request failed after {attempts} attempt(s): {message}")]
    VendorTransient { attempts: u32, message: String },

    #[error("vendor protocol error: {0}")]
    VendorProtocol(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Cache(e.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::VendorTransient {
            attempts: 1,
            message: e.to_string(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for EngineError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        EngineError::VendorTransient {
            attempts: 1,
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Validation(e.to_string())
    }
}

impl From<chrono::ParseError> for EngineError {
    fn from(e: chrono::ParseError) -> Self {
        EngineError::Validation(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
