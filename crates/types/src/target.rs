//! Target URI parsing.
//!
//! A target is the logical name a channel connects to. The grammar is
//! `[scheme:][//authority/]path`: everything before the first `:` is the
//! scheme when it consists of URI scheme characters, and an authority is only
//! present when the remainder starts with `//`.
//!
//! ```text
//! dns:///example.com:443   scheme=dns  authority=""  path=example.com:443
//! unix:///tmp/sock         scheme=unix authority=""  path=tmp/sock
//! unix:relative/sock       scheme=unix               path=relative/sock
//! localhost:50051          scheme=localhost          path=50051
//! ```
//!
//! The last line is why the resolver registry remaps targets whose scheme is
//! not registered onto the default scheme with the whole string as the path.

use std::fmt;

use snafu::ensure;

use crate::error::{EmptySnafu, MissingPathSnafu, TargetError};

/// A parsed target URI. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    scheme: Option<String>,
    authority: Option<String>,
    path: String,
}

impl Target {
    /// Parses a target string.
    ///
    /// # Errors
    ///
    /// Returns [`TargetError::Empty`] for an empty string and
    /// [`TargetError::MissingPath`] when nothing follows the scheme.
    pub fn parse(input: &str) -> Result<Self, TargetError> {
        ensure!(!input.is_empty(), EmptySnafu);

        let (scheme, rest) = match input.split_once(':') {
            Some((scheme, rest)) if is_scheme(scheme) => (Some(scheme.to_owned()), rest),
            _ => (None, input),
        };

        let (authority, path) = match rest.strip_prefix("//") {
            Some(after) => match after.split_once('/') {
                Some((authority, path)) => (Some(authority.to_owned()), path),
                // `scheme://authority` with no path component
                None => (None, rest),
            },
            None => (None, rest),
        };

        ensure!(!path.is_empty(), MissingPathSnafu { target: input });

        Ok(Self { scheme, authority, path: path.to_owned() })
    }

    /// Builds a target directly from its components.
    pub fn from_parts(
        scheme: Option<String>,
        authority: Option<String>,
        path: impl Into<String>,
    ) -> Self {
        Self { scheme, authority, path: path.into() }
    }

    /// Returns the scheme, if one was written.
    #[must_use]
    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    /// Returns the authority, if one was written.
    #[must_use]
    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    /// Returns the path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns a copy of this target under `scheme`, with the whole original
    /// string as the path.
    #[must_use]
    pub fn with_default_scheme(&self, scheme: &str) -> Self {
        Self { scheme: Some(scheme.to_owned()), authority: None, path: self.to_string() }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(scheme) = &self.scheme {
            write!(f, "{scheme}:")?;
        }
        if let Some(authority) = &self.authority {
            write!(f, "//{authority}/")?;
        }
        f.write_str(&self.path)
    }
}

impl std::str::FromStr for Target {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn is_scheme(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}
