//! Engine pool error types.

use thiserror::Error;

use scanfleet_core::ConfigError;

use crate::engine::{EngineOp, EngineState};

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur during pool operations.
///
/// `IllegalState` and `InvalidTransition` indicate a caller bug; they are
/// never expected in a correct fleet.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("engine {engine}: cannot {op} while {state}")]
    IllegalState {
        engine: String,
        state: EngineState,
        op: EngineOp,
    },

    #[error("tier {tier}: {from} -> {to} is not an allocation")]
    InvalidTransition {
        tier: String,
        from: EngineState,
        to: EngineState,
    },

    #[error("unknown engine: {0}")]
    UnknownEngine(String),

    #[error("engine {engine} belongs to tier {expected}, not {found}")]
    TierMismatch {
        engine: String,
        expected: String,
        found: String,
    },

    #[error("invalid pool specification: {0}")]
    Config(#[from] ConfigError),
}
