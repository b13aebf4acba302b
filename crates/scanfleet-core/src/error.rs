//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for configuration loading and validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating a fleet configuration.
///
/// All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("pool specification is empty")]
    EmptyPool,

    #[error("duplicate tier: {0}")]
    DuplicateTier(String),

    #[error("tier {tier}: min_metric {min} is greater than max_metric {max}")]
    InvertedRange { tier: String, min: u64, max: u64 },

    #[error("tier {tier} overlaps tier {previous}")]
    OverlappingTiers { tier: String, previous: String },

    #[error("gap between tier {previous} (max {previous_max}) and tier {tier} (min {min})")]
    TierGap {
        tier: String,
        min: u64,
        previous: String,
        previous_max: u64,
    },

    #[error("tier {0}: total must be at least 1")]
    EmptyTier(String),

    #[error("tier {tier}: min_idle {min_idle} exceeds total {total}")]
    MinIdleExceedsTotal {
        tier: String,
        min_idle: u32,
        total: u32,
    },

    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("name_prefix must not be empty")]
    EmptyPrefix,
}
