//! Client error types.
//!
//! Two error surfaces exist:
//! - **Construction errors** ([`ClientError`]): a malformed target, an
//!   unregistered scheme or an invalid configuration, returned synchronously
//!   when a channel or resolver is built.
//! - **Call errors** ([`Status`]): every runtime failure of an RPC, including
//!   cancellation and deadline expiry.
//!
//! A [`ClientError`] that surfaces during a call is converted to a [`Status`].

use snafu::{Location, Snafu};
use wayfinder_types::{
    AddressError, Code, Status, TargetError,
    config::{ConfigError, ServiceConfigError},
};

/// Result type alias for client construction operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Construction-boundary errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ClientError {
    /// The target string could not be parsed.
    #[snafu(display("Invalid target at {location}: {source}"))]
    InvalidTarget {
        /// Underlying parse error.
        source: TargetError,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// An address inside the target could not be parsed.
    #[snafu(display("Invalid address in target '{target}': {source}"))]
    InvalidAddress {
        /// The offending target.
        target: String,
        /// Underlying parse error.
        source: AddressError,
    },

    /// No resolver is registered for the scheme and no default applies.
    #[snafu(display("No resolver registered for scheme '{scheme}'"))]
    UnknownScheme {
        /// The unmatched scheme.
        scheme: String,
    },

    /// Channel configuration failed validation.
    #[snafu(display("Configuration error: {source}"))]
    Config {
        /// Underlying validation error.
        source: ConfigError,
    },

    /// A service config could not be parsed.
    #[snafu(display("Service config error: {source}"))]
    ServiceConfig {
        /// Underlying parse error.
        source: ServiceConfigError,
    },

    /// No load balancer is registered under the policy name.
    #[snafu(display("No load balancer registered for policy '{name}'"))]
    UnknownPolicy {
        /// The unmatched policy name.
        name: String,
    },

    /// The channel has been closed.
    #[snafu(display("Channel closed"))]
    ChannelClosed,
}

impl ClientError {
    /// Returns the status code a call observing this error finishes with.
    #[must_use]
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidTarget { .. } | Self::InvalidAddress { .. } => Code::InvalidArgument,
            Self::UnknownScheme { .. } | Self::UnknownPolicy { .. } => Code::Unimplemented,
            Self::Config { .. } | Self::ServiceConfig { .. } => Code::InvalidArgument,
            Self::ChannelClosed => Code::Unavailable,
        }
    }
}

impl From<ConfigError> for ClientError {
    fn from(source: ConfigError) -> Self {
        Self::Config { source }
    }
}

impl From<ServiceConfigError> for ClientError {
    fn from(source: ServiceConfigError) -> Self {
        Self::ServiceConfig { source }
    }
}

impl From<ClientError> for Status {
    fn from(err: ClientError) -> Self {
        Status::new(err.code(), err.to_string())
    }
}
