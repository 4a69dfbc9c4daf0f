//! Error types shared across Tix crates

use thiserror::Error;

/// Result type alias for shared operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },
}

impl Error {
    pub fn invalid_env(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidEnv {
            name: name.into(),
            value: value.into(),
        }
    }
}
