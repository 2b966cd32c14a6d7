//! Configuration types for wayfinder channels.
//!
//! Channel configuration is plain data: it can be deserialized from JSON or
//! TOML, built with a validating builder, or assembled from externally
//! supplied dotted keys through [`OptionTree`]. Service configuration arrives
//! from resolvers at runtime and is parsed by [`ServiceConfig::parse`].
//! Post-deserialization validation is available via `validate()`.

// The schemars `JsonSchema` derive expands to code using `.unwrap()`.
#![allow(clippy::disallowed_methods)]

mod channel;
mod load_balancing;
mod options;
mod service;

pub use channel::*;
pub use load_balancing::*;
pub use options::*;
pub use service::*;
use snafu::Snafu;

/// Configuration validation error.
///
/// Returned when a configuration value is outside its valid range or
/// violates a cross-field constraint.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// A configuration value is invalid.
    #[snafu(display("invalid config: {message}"))]
    Validation {
        /// Description of the validation failure.
        message: String,
    },

    /// A dotted option key contained a forbidden or empty segment.
    #[snafu(display("rejected option key '{key}': {reason}"))]
    RejectedKey {
        /// The offending key.
        key: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Duration serialization using humantime format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
