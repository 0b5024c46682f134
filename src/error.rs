//! Configuration errors

/// Invalid cache configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed
    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },

    /// A field holds a value the cache cannot run with
    #[error("invalid configuration for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
