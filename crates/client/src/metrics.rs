//! Client-side metrics for observability.
//!
//! This module provides a pluggable metrics trait ([`ClientMetrics`]) that
//! applications implement to observe channels. Two implementations are
//! included:
//!
//! - [`NoopClientMetrics`]: Zero-overhead default that discards all metrics.
//! - [`MetricsClientMetrics`]: Integration with the [`metrics`](https://docs.rs/metrics) crate
//!   facade, forwarding to whatever recorder is installed (Prometheus, StatsD, etc.).
//!
//! # Metric Names
//!
//! All metrics follow the `wayfinder_client_` prefix convention:
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `wayfinder_client_channel_transitions_total` | Counter | `target`, `from`, `to` | Channel connectivity transitions |
//! | `wayfinder_client_subchannel_transitions_total` | Counter | `address`, `from`, `to` | Subchannel connectivity transitions |
//! | `wayfinder_client_resolutions_total` | Counter | `target`, `outcome` | Resolver results delivered to the channel |
//! | `wayfinder_client_calls_total` | Counter | `method`, `code` | Completed calls by final status |
//! | `wayfinder_client_call_duration_seconds` | Histogram | `method` | Call latency distribution |
//! | `wayfinder_client_retries_total` | Counter | `method`, `attempt` | Retry attempts |

use std::{fmt, sync::Arc, time::Duration};

use wayfinder_types::{Code, ConnectivityState};

/// Trait for client-side metrics collection.
///
/// All methods have default no-op implementations, so you only need to
/// override the metrics you care about.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` since a single instance is shared
/// by a channel, its subchannels and all of its calls.
pub trait ClientMetrics: Send + Sync + fmt::Debug {
    /// Records a channel connectivity transition.
    fn record_channel_transition(
        &self,
        target: &str,
        from: ConnectivityState,
        to: ConnectivityState,
    ) {
        let _ = (target, from, to);
    }

    /// Records a subchannel connectivity transition.
    fn record_subchannel_transition(
        &self,
        address: &str,
        from: ConnectivityState,
        to: ConnectivityState,
    ) {
        let _ = (address, from, to);
    }

    /// Records a resolver outcome.
    fn record_resolution(&self, target: &str, success: bool) {
        let _ = (target, success);
    }

    /// Records a finished call.
    ///
    /// - `method`: The method path (`/service/method`).
    /// - `duration`: Wall-clock time from call creation to completion.
    /// - `code`: The final status code.
    fn record_call(&self, method: &str, duration: Duration, code: Code) {
        let _ = (method, duration, code);
    }

    /// Records a retry attempt (2 = first retry).
    fn record_retry(&self, method: &str, attempt: u32) {
        let _ = (method, attempt);
    }
}

/// No-op metrics implementation with zero overhead.
///
/// This is the default when no metrics backend is configured.
#[derive(Debug, Clone, Copy)]
pub struct NoopClientMetrics;

impl ClientMetrics for NoopClientMetrics {}

/// Metrics implementation using the [`metrics`](https://docs.rs/metrics) crate facade.
///
/// All metric names use the `wayfinder_client_` prefix.
#[derive(Debug, Clone, Copy)]
pub struct MetricsClientMetrics;

/// Metric name constants for the `metrics` crate facade.
mod metric_names {
    /// Channel connectivity transitions.
    pub const CHANNEL_TRANSITIONS_TOTAL: &str = "wayfinder_client_channel_transitions_total";
    /// Subchannel connectivity transitions.
    pub const SUBCHANNEL_TRANSITIONS_TOTAL: &str = "wayfinder_client_subchannel_transitions_total";
    /// Resolver outcomes.
    pub const RESOLUTIONS_TOTAL: &str = "wayfinder_client_resolutions_total";
    /// Completed calls.
    pub const CALLS_TOTAL: &str = "wayfinder_client_calls_total";
    /// Call duration distribution.
    pub const CALL_DURATION: &str = "wayfinder_client_call_duration_seconds";
    /// Retry attempts.
    pub const RETRIES_TOTAL: &str = "wayfinder_client_retries_total";
}

impl ClientMetrics for MetricsClientMetrics {
    fn record_channel_transition(
        &self,
        target: &str,
        from: ConnectivityState,
        to: ConnectivityState,
    ) {
        metrics::counter!(
            metric_names::CHANNEL_TRANSITIONS_TOTAL,
            "target" => target.to_owned(),
            "from" => from.as_str(),
            "to" => to.as_str(),
        )
        .increment(1);
    }

    fn record_subchannel_transition(
        &self,
        address: &str,
        from: ConnectivityState,
        to: ConnectivityState,
    ) {
        metrics::counter!(
            metric_names::SUBCHANNEL_TRANSITIONS_TOTAL,
            "address" => address.to_owned(),
            "from" => from.as_str(),
            "to" => to.as_str(),
        )
        .increment(1);
    }

    fn record_resolution(&self, target: &str, success: bool) {
        let outcome = if success { "success" } else { "error" };
        metrics::counter!(
            metric_names::RESOLUTIONS_TOTAL,
            "target" => target.to_owned(),
            "outcome" => outcome,
        )
        .increment(1);
    }

    fn record_call(&self, method: &str, duration: Duration, code: Code) {
        metrics::counter!(metric_names::CALLS_TOTAL, "method" => method.to_owned(), "code" => code.as_str()).increment(1);
        metrics::histogram!(metric_names::CALL_DURATION, "method" => method.to_owned())
            .record(duration.as_secs_f64());
    }

    fn record_retry(&self, method: &str, attempt: u32) {
        metrics::counter!(
            metric_names::RETRIES_TOTAL,
            "method" => method.to_owned(),
            "attempt" => attempt.to_string(),
        )
        .increment(1);
    }
}

/// Creates the default metrics instance (no-op).
pub(crate) fn default_metrics() -> Arc<dyn ClientMetrics> {
    Arc::new(NoopClientMetrics)
}
