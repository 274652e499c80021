//! Shared error type

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Subscriber could not be installed (bad filter or already set)
    #[error("Logging setup failed: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, Error>;
