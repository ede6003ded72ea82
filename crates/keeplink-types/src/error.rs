//! Configuration error types.

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Read {
        /// Path that was being read.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration document is not valid TOML for the expected schema.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field holds a value the protocol cannot run with.
    #[error("Invalid config value for '{field}': {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// Neither a passive socket nor a dial address was supplied.
    #[error("Endpoint needs either an accepted socket or a dial address")]
    MissingTarget,
}
