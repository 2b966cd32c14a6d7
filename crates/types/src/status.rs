//! RPC status codes and status values.
//!
//! Codes are stable small integers so they stay wire-compatible with peers.
//! Every call-level failure surfaces as a [`Status`]; cancellation and
//! deadline expiry are two particular codes, not a separate error channel.
//!
//! # Wire Format
//!
//! Use [`Code::as_i32`] when encoding and [`Code::from_i32`] when decoding.
//! Unknown integers decode to [`Code::Unknown`].

use std::fmt;

use crate::metadata::Metadata;

/// Standard RPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum Code {
    /// Not an error.
    Ok = 0,
    /// The operation was cancelled, typically by the caller.
    Cancelled = 1,
    /// Unknown error.
    Unknown = 2,
    /// The client specified an invalid argument.
    InvalidArgument = 3,
    /// The deadline expired before the operation could complete.
    DeadlineExceeded = 4,
    /// Some requested entity was not found.
    NotFound = 5,
    /// The entity a client attempted to create already exists.
    AlreadyExists = 6,
    /// The caller lacks permission for the operation.
    PermissionDenied = 7,
    /// Some resource has been exhausted.
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation.
    FailedPrecondition = 9,
    /// The operation was aborted.
    Aborted = 10,
    /// The operation was attempted past the valid range.
    OutOfRange = 11,
    /// The operation is not implemented.
    Unimplemented = 12,
    /// Internal invariant broken.
    Internal = 13,
    /// The service is currently unavailable.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// The request lacks valid authentication credentials.
    Unauthenticated = 16,
}

impl Code {
    /// Every code, indexed by its wire integer.
    pub const ALL: [Code; 17] = [
        Code::Ok,
        Code::Cancelled,
        Code::Unknown,
        Code::InvalidArgument,
        Code::DeadlineExceeded,
        Code::NotFound,
        Code::AlreadyExists,
        Code::PermissionDenied,
        Code::ResourceExhausted,
        Code::FailedPrecondition,
        Code::Aborted,
        Code::OutOfRange,
        Code::Unimplemented,
        Code::Internal,
        Code::Unavailable,
        Code::DataLoss,
        Code::Unauthenticated,
    ];

    /// Returns the wire integer.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Decodes a wire integer. Out-of-range values map to [`Code::Unknown`].
    #[must_use]
    pub fn from_i32(value: i32) -> Self {
        usize::try_from(value)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
            .unwrap_or(Self::Unknown)
    }

    /// Returns the canonical upper-snake-case name (`"DEADLINE_EXCEEDED"`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::DataLoss => "DATA_LOSS",
            Self::Unauthenticated => "UNAUTHENTICATED",
        }
    }

    /// Looks a code up by its canonical name, case-insensitively.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an RPC: a code, human-readable details and trailing metadata.
///
/// Build one with [`Status::new`] or, when metadata is involved, the builder:
///
/// ```
/// use wayfinder_types::{Code, Metadata, Status};
///
/// let status = Status::builder()
///     .code(Code::Unavailable)
///     .details("no healthy backends")
///     .metadata(Metadata::new())
///     .build();
/// assert_eq!(status.code(), Code::Unavailable);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct Status {
    #[builder(default = Code::Unknown)]
    code: Code,
    #[builder(default, into)]
    details: String,
    #[builder(default)]
    metadata: Metadata,
}

impl Status {
    /// Creates a status with empty metadata.
    pub fn new(code: Code, details: impl Into<String>) -> Self {
        Self { code, details: details.into(), metadata: Metadata::new() }
    }

    /// The OK status.
    #[must_use]
    pub fn ok() -> Self {
        Self::new(Code::Ok, "OK")
    }

    /// A CANCELLED status.
    pub fn cancelled(details: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, details)
    }

    /// A DEADLINE_EXCEEDED status.
    pub fn deadline_exceeded(details: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, details)
    }

    /// An UNAVAILABLE status.
    pub fn unavailable(details: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, details)
    }

    /// An INTERNAL status.
    pub fn internal(details: impl Into<String>) -> Self {
        Self::new(Code::Internal, details)
    }

    /// Returns the code.
    #[must_use]
    pub fn code(&self) -> Code {
        self.code
    }

    /// Returns the details message.
    #[must_use]
    pub fn details(&self) -> &str {
        &self.details
    }

    /// Returns the attached metadata.
    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Returns true when the code is [`Code::Ok`].
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    /// Replaces the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.code.as_i32(), self.code, self.details)
    }
}

impl std::error::Error for Status {}
