//! Error handling - one hierarchy across the execution core.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// The named venue is not in the registry.
    #[error("venue not registered: {0}")]
    VenueNotFound(String),

    /// The risk authority could not be queried.
    #[error("risk authority error: {0}")]
    Risk(String),

    /// Market price lookup failed.
    #[error("market data error: {0}")]
    MarketData(String),

    /// Persistence failure. Carried as text so the store can be faked.
    #[error("store error: {0}")]
    Store(String),

    /// Network/IO errors.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Order failed domain validation.
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    /// The pipeline intake is gone.
    #[error("order pipeline closed")]
    PipelineClosed,
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Store(err.to_string())
    }
}
