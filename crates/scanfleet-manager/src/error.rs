//! Fleet manager error types.

use std::time::Duration;

use thiserror::Error;

use scanfleet_pool::PoolError;

/// Result type alias for cloud driver calls.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors reported by a cloud driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("launch of {engine} failed: {reason}")]
    Launch { engine: String, reason: String },

    #[error("terminate of {engine} failed: {reason}")]
    Terminate { engine: String, reason: String },

    #[error("cloud provider unavailable: {0}")]
    Unavailable(String),

    #[error("cloud provider {op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },
}

/// Result type alias for fleet manager operations.
pub type FleetResult<T> = Result<T, FleetError>;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Driver(#[from] DriverError),
}
