//! Construction-boundary errors for the wayfinder value types.
//!
//! These errors signal programmer error (a malformed target, address or
//! metadata key) and are returned synchronously from parsing functions. They
//! are distinct from [`Status`](crate::Status), which carries runtime RPC
//! failures.

use snafu::{Location, Snafu};

/// Errors produced while parsing a target URI.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TargetError {
    /// The target string was empty.
    #[snafu(display("Target is empty at {location}"))]
    Empty {
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// The target has a scheme but nothing after it.
    #[snafu(display("Target '{target}' has no path"))]
    MissingPath {
        /// The offending target.
        target: String,
    },
}

/// Errors produced while parsing an address.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AddressError {
    /// A `host:port` string could not be split.
    #[snafu(display("Invalid address '{input}': {message}"))]
    Malformed {
        /// The offending input.
        input: String,
        /// Description of the problem.
        message: String,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// The port component was not a valid `u16`.
    #[snafu(display("Invalid port in '{input}'"))]
    InvalidPort {
        /// The offending input.
        input: String,
    },

    /// An IP-literal list entry was not an IP address of the expected family.
    #[snafu(display("'{input}' is not a valid {family} address"))]
    NotAnIpLiteral {
        /// The offending input.
        input: String,
        /// Expected address family (`ipv4` or `ipv6`).
        family: &'static str,
    },
}

/// Errors produced while building [`Metadata`](crate::Metadata).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetadataError {
    /// The key contains characters outside `[0-9a-z_.-]`.
    #[snafu(display("Metadata key '{key}' contains illegal characters"))]
    InvalidKey {
        /// The offending key.
        key: String,
    },

    /// A non-binary key was given a value with non-printable characters.
    #[snafu(display("Metadata value for '{key}' is not printable ASCII"))]
    InvalidValue {
        /// The key the value was destined for.
        key: String,
    },

    /// A binary value was inserted under a key without the `-bin` suffix, or vice versa.
    #[snafu(display("Metadata key '{key}' does not match the value kind"))]
    KindMismatch {
        /// The offending key.
        key: String,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_target_error_display() {
        let err = MissingPathSnafu { target: "dns:" }.build();
        assert_eq!(err.to_string(), "Target 'dns:' has no path");
    }

    #[test]
    fn test_address_error_display_includes_family() {
        let err = NotAnIpLiteralSnafu { input: "example.com", family: "ipv4" }.build();
        assert!(err.to_string().contains("ipv4"));
        assert!(err.to_string().contains("example.com"));
    }

    #[test]
    fn test_malformed_address_captures_location() {
        let err = MalformedSnafu { input: "[::1", message: "unterminated bracket" }.build();
        match err {
            AddressError::Malformed { location, .. } => assert!(location.line > 0),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
