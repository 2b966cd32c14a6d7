//! Service configuration delivered by resolvers.
//!
//! A service config carries per-method call policy and the load-balancing
//! policy list. It uses the JSON field names of the wire format:
//!
//! ```json
//! {
//!   "loadBalancingConfig": [{"pick_first": {"shuffleAddressList": true}}],
//!   "methodConfig": [{
//!     "name": [{"service": "echo.Echo", "method": "Say"}],
//!     "timeout": "1.5s",
//!     "waitForReady": true,
//!     "retryPolicy": {
//!       "maxAttempts": 3,
//!       "initialBackoff": "0.1s",
//!       "maxBackoff": "1s",
//!       "backoffMultiplier": 2,
//!       "retryableStatusCodes": ["UNAVAILABLE"]
//!     }
//!   }]
//! }
//! ```
//!
//! Parsing validates everything up front so the channel can fall back to the
//! last known good config when a resolver hands it something broken.

use std::{collections::HashSet, time::Duration};

use serde::Deserialize;
use serde_json::Value;
use snafu::{ResultExt, Snafu, ensure};

use super::load_balancing::RawLoadBalancingConfig;
use crate::status::Code;

/// Upper bound applied to `maxAttempts`.
pub const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Errors produced while parsing a service config.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ServiceConfigError {
    /// The text is not valid JSON of the expected shape.
    #[snafu(display("service config is not valid JSON: {source}"))]
    Json {
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// The JSON parsed but violates a constraint.
    #[snafu(display("invalid service config: {message}"))]
    Invalid {
        /// Description of the violation.
        message: String,
    },
}

/// A `(service, method)` selector inside a method config.
///
/// An empty selector is the default for every method; a selector with only a
/// service applies to every method of that service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MethodName {
    /// Fully-qualified service name.
    pub service: Option<String>,
    /// Method name within the service.
    pub method: Option<String>,
}

/// Retry policy for a method.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first, in `2..=MAX_RETRY_ATTEMPTS`.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Cap on the delay between retries.
    pub max_backoff: Duration,
    /// Growth factor applied to the delay after each retry.
    pub backoff_multiplier: f64,
    /// Codes that make an attempt eligible for retry.
    pub retryable_status_codes: Vec<Code>,
}

impl RetryPolicy {
    /// Returns whether a failure with `code` may be retried.
    #[must_use]
    pub fn is_retryable(&self, code: Code) -> bool {
        self.retryable_status_codes.contains(&code)
    }
}

/// Per-method call policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodConfig {
    /// Selectors this entry applies to.
    pub names: Vec<MethodName>,
    /// Per-call timeout.
    pub timeout: Option<Duration>,
    /// Whether calls wait for the channel to become ready instead of failing fast.
    pub wait_for_ready: Option<bool>,
    /// Retry policy.
    pub retry_policy: Option<RetryPolicy>,
}

/// A parsed and validated service config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceConfig {
    /// Load-balancing policies in preference order.
    pub load_balancing_config: Vec<RawLoadBalancingConfig>,
    /// Legacy single policy name, used when `load_balancing_config` is empty.
    pub load_balancing_policy: Option<String>,
    /// Per-method configuration.
    pub method_config: Vec<MethodConfig>,
}

impl ServiceConfig {
    /// Parses and validates a service config document.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceConfigError::Json`] for malformed JSON and
    /// [`ServiceConfigError::Invalid`] for constraint violations.
    pub fn parse(json: &str) -> Result<Self, ServiceConfigError> {
        let value: Value = serde_json::from_str(json).context(JsonSnafu)?;
        Self::from_value(value)
    }

    /// Validates an already-parsed JSON value.
    ///
    /// # Errors
    ///
    /// Same conditions as [`ServiceConfig::parse`].
    pub fn from_value(value: Value) -> Result<Self, ServiceConfigError> {
        let wire: WireServiceConfig = serde_json::from_value(value).context(JsonSnafu)?;

        let mut seen = HashSet::new();
        let mut method_config = Vec::with_capacity(wire.method_config.len());
        for entry in wire.method_config {
            let config = entry.validate()?;
            for name in &config.names {
                ensure!(
                    seen.insert(name.clone()),
                    InvalidSnafu { message: format!("duplicate method name {name:?}") }
                );
            }
            method_config.push(config);
        }

        Ok(Self {
            load_balancing_config: wire.load_balancing_config,
            load_balancing_policy: wire.load_balancing_policy,
            method_config,
        })
    }

    /// Selects a config from a list of choices, as published in DNS TXT
    /// records.
    ///
    /// A choice matches when its `clientLanguage` list (if any) contains
    /// `language`, its `clientHostname` list (if any) contains `hostname`, and
    /// `percentage_roll` (in `0..100`) is below its `percentage` (if any). The
    /// first match wins; no match yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceConfigError`] when the choice list or the selected
    /// config is malformed.
    pub fn from_choices(
        json: &str,
        language: &str,
        hostname: Option<&str>,
        percentage_roll: u32,
    ) -> Result<Option<Self>, ServiceConfigError> {
        let choices: Vec<WireChoice> = serde_json::from_str(json).context(JsonSnafu)?;
        for choice in choices {
            if let Some(languages) = &choice.client_language
                && !languages.iter().any(|l| l.eq_ignore_ascii_case(language))
            {
                continue;
            }
            if let Some(hostnames) = &choice.client_hostname
                && !hostname.is_some_and(|h| hostnames.iter().any(|c| c == h))
            {
                continue;
            }
            if let Some(percentage) = choice.percentage {
                ensure!(
                    percentage <= 100,
                    InvalidSnafu { message: format!("percentage {percentage} exceeds 100") }
                );
                if percentage_roll >= percentage {
                    continue;
                }
            }
            return Self::from_value(choice.service_config).map(Some);
        }
        Ok(None)
    }

    /// Finds the method config for a call path of the form `/service/method`.
    ///
    /// Lookup order is the exact method, then the service wildcard, then the
    /// empty default selector.
    #[must_use]
    pub fn method_config(&self, path: &str) -> Option<&MethodConfig> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let (service, method) = trimmed.split_once('/').unwrap_or((trimmed, ""));

        let find = |want: &MethodName| {
            self.method_config.iter().find(|config| config.names.iter().any(|name| name == want))
        };

        find(&MethodName { service: Some(service.to_owned()), method: Some(method.to_owned()) })
            .or_else(|| find(&MethodName { service: Some(service.to_owned()), method: None }))
            .or_else(|| find(&MethodName::default()))
    }
}

/// Largest seconds value a `google.protobuf.Duration` can carry (10,000 years).
pub const MAX_PROTO_DURATION_SECS: u64 = 315_576_000_000;

/// Parses a protobuf JSON duration such as `"1.5s"` or `"0.000000001s"`.
///
/// Values above [`MAX_PROTO_DURATION_SECS`] are rejected.
#[must_use]
pub fn parse_proto_duration(text: &str) -> Option<Duration> {
    let number = text.strip_suffix('s')?;
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if fraction.len() > 9 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let seconds: u64 = whole.parse().ok()?;
    if seconds > MAX_PROTO_DURATION_SECS {
        return None;
    }
    let nanos: u32 = if fraction.is_empty() {
        0
    } else {
        format!("{fraction:0<9}").parse().ok()?
    };
    Some(Duration::new(seconds, nanos))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireServiceConfig {
    #[serde(default)]
    load_balancing_config: Vec<RawLoadBalancingConfig>,
    #[serde(default)]
    load_balancing_policy: Option<String>,
    #[serde(default)]
    method_config: Vec<WireMethodConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMethodConfig {
    #[serde(default)]
    name: Vec<WireMethodName>,
    #[serde(default)]
    timeout: Option<String>,
    #[serde(default)]
    wait_for_ready: Option<bool>,
    #[serde(default)]
    retry_policy: Option<WireRetryPolicy>,
}

#[derive(Debug, Deserialize)]
struct WireMethodName {
    #[serde(default)]
    service: Option<String>,
    #[serde(default)]
    method: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRetryPolicy {
    max_attempts: u32,
    initial_backoff: String,
    max_backoff: String,
    backoff_multiplier: f64,
    retryable_status_codes: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireChoice {
    #[serde(default)]
    client_language: Option<Vec<String>>,
    #[serde(default)]
    percentage: Option<u32>,
    #[serde(default)]
    client_hostname: Option<Vec<String>>,
    service_config: Value,
}

impl WireMethodConfig {
    fn validate(self) -> Result<MethodConfig, ServiceConfigError> {
        let mut names = Vec::with_capacity(self.name.len());
        for name in self.name {
            let service = name.service.filter(|s| !s.is_empty());
            let method = name.method.filter(|m| !m.is_empty());
            ensure!(
                service.is_some() || method.is_none(),
                InvalidSnafu { message: "method name set without a service" }
            );
            names.push(MethodName { service, method });
        }

        let timeout = match self.timeout {
            Some(text) => Some(parse_proto_duration(&text).ok_or_else(|| {
                InvalidSnafu { message: format!("invalid timeout '{text}'") }.build()
            })?),
            None => None,
        };

        let retry_policy = self.retry_policy.map(WireRetryPolicy::validate).transpose()?;

        Ok(MethodConfig { names, timeout, wait_for_ready: self.wait_for_ready, retry_policy })
    }
}

impl WireRetryPolicy {
    fn validate(self) -> Result<RetryPolicy, ServiceConfigError> {
        ensure!(
            self.max_attempts >= 2,
            InvalidSnafu { message: "retryPolicy.maxAttempts must be at least 2" }
        );
        let initial_backoff = positive_duration("retryPolicy.initialBackoff", &self.initial_backoff)?;
        let max_backoff = positive_duration("retryPolicy.maxBackoff", &self.max_backoff)?;
        ensure!(
            self.backoff_multiplier > 0.0,
            InvalidSnafu { message: "retryPolicy.backoffMultiplier must be > 0" }
        );
        ensure!(
            !self.retryable_status_codes.is_empty(),
            InvalidSnafu { message: "retryPolicy.retryableStatusCodes must not be empty" }
        );

        let mut codes = Vec::with_capacity(self.retryable_status_codes.len());
        for raw in &self.retryable_status_codes {
            let code = match raw {
                Value::String(name) => Code::from_name(name),
                Value::Number(n) => n
                    .as_i64()
                    .and_then(|n| i32::try_from(n).ok())
                    .filter(|n| (0..=16).contains(n))
                    .map(Code::from_i32),
                _ => None,
            };
            let code = code.ok_or_else(|| {
                InvalidSnafu { message: format!("unknown status code {raw}") }.build()
            })?;
            codes.push(code);
        }

        Ok(RetryPolicy {
            max_attempts: self.max_attempts.min(MAX_RETRY_ATTEMPTS),
            initial_backoff,
            max_backoff,
            backoff_multiplier: self.backoff_multiplier,
            retryable_status_codes: codes,
        })
    }
}

fn positive_duration(field: &str, text: &str) -> Result<Duration, ServiceConfigError> {
    match parse_proto_duration(text) {
        Some(duration) if !duration.is_zero() => Ok(duration),
        _ => InvalidSnafu { message: format!("{field} must be a positive duration, got '{text}'") }
            .fail(),
    }
}
