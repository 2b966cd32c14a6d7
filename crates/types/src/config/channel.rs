//! Per-channel configuration.

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ConfigError, LoadBalancingConfig, OptionTree, ServiceConfig};

/// Idle timeouts below this value are raised to it.
pub const MIN_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// Connection Backoff
// =============================================================================

fn default_backoff_initial() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_multiplier() -> f64 {
    1.6
}

fn default_backoff_jitter() -> f64 {
    0.2
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(120)
}

/// Exponential backoff applied between subchannel connection attempts and
/// between failed resolutions.
///
/// Delays start at `initial`, grow by `multiplier` after each failure up to
/// `max`, and are spread by ±`jitter` of their value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BackoffConfig {
    /// First delay.
    #[serde(default = "default_backoff_initial")]
    #[serde(with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub initial: Duration,
    /// Growth factor. Must be >= 1.0.
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    /// Relative jitter in `0.0..=1.0`.
    #[serde(default = "default_backoff_jitter")]
    pub jitter: f64,
    /// Cap on any single delay. Must be >= `initial`.
    #[serde(default = "default_backoff_max")]
    #[serde(with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: default_backoff_initial(),
            multiplier: default_backoff_multiplier(),
            jitter: default_backoff_jitter(),
            max: default_backoff_max(),
        }
    }
}

impl BackoffConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial.is_zero() {
            return Err(ConfigError::Validation {
                message: "backoff.initial must be > 0".to_string(),
            });
        }
        if self.max < self.initial {
            return Err(ConfigError::Validation {
                message: format!(
                    "backoff.max ({:?}) must be >= backoff.initial ({:?})",
                    self.max, self.initial
                ),
            });
        }
        if !(self.multiplier >= 1.0) {
            return Err(ConfigError::Validation {
                message: format!("backoff.multiplier must be >= 1.0, got {}", self.multiplier),
            });
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Validation {
                message: format!("backoff.jitter must be in 0.0..=1.0, got {}", self.jitter),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Channel
// =============================================================================

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_min_time_between_resolutions() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_enable_retries() -> bool {
    true
}

/// Configuration consumed by a channel.
///
/// # Example
///
/// ```no_run
/// # use std::time::Duration;
/// # use wayfinder_types::config::ChannelConfig;
/// let config = ChannelConfig::builder()
///     .idle_timeout(Duration::from_secs(60))
///     .min_time_between_resolutions(Duration::from_secs(5))
///     .use_local_subchannel_pool(true)
///     .build()
///     .expect("valid channel config");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChannelConfig {
    /// How long the channel stays connected with no calls before going idle.
    ///
    /// Values below [`MIN_IDLE_TIMEOUT`] are raised to it.
    #[serde(default = "default_idle_timeout")]
    #[serde(with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub idle_timeout: Duration,
    /// Minimum spacing between two resolutions of the same target.
    #[serde(default = "default_min_time_between_resolutions")]
    #[serde(with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub min_time_between_resolutions: Duration,
    /// Upper bound on a single connection attempt.
    #[serde(default = "default_connect_timeout")]
    #[serde(with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub connect_timeout: Duration,
    /// Backoff between connection attempts and failed resolutions.
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Policy used when the service config names none.
    #[serde(default)]
    #[schemars(with = "serde_json::Value")]
    pub default_load_balancing: LoadBalancingConfig,
    /// Give this channel a private subchannel pool instead of the shared one.
    #[serde(default)]
    pub use_local_subchannel_pool: bool,
    /// Ignore service configs published by the resolver.
    #[serde(default)]
    pub service_config_disable_resolution: bool,
    /// Service config used when the resolver publishes none (JSON text).
    #[serde(default)]
    pub default_service_config: Option<String>,
    /// Whether per-method retry policies are honoured.
    #[serde(default = "default_enable_retries")]
    pub enable_retries: bool,
    /// Overrides the authority derived from the target.
    #[serde(default)]
    pub default_authority: Option<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            min_time_between_resolutions: default_min_time_between_resolutions(),
            connect_timeout: default_connect_timeout(),
            backoff: BackoffConfig::default(),
            default_load_balancing: LoadBalancingConfig::default(),
            use_local_subchannel_pool: false,
            service_config_disable_resolution: false,
            default_service_config: None,
            enable_retries: default_enable_retries(),
            default_authority: None,
        }
    }
}

#[bon::bon]
impl ChannelConfig {
    /// Creates a channel configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range or
    /// the default service config does not parse.
    #[builder]
    pub fn new(
        #[builder(default = default_idle_timeout())] idle_timeout: Duration,
        #[builder(default = default_min_time_between_resolutions())]
        min_time_between_resolutions: Duration,
        #[builder(default = default_connect_timeout())] connect_timeout: Duration,
        #[builder(default)] backoff: BackoffConfig,
        #[builder(default)] default_load_balancing: LoadBalancingConfig,
        #[builder(default)] use_local_subchannel_pool: bool,
        #[builder(default)] service_config_disable_resolution: bool,
        #[builder(into)] default_service_config: Option<String>,
        #[builder(default = default_enable_retries())] enable_retries: bool,
        #[builder(into)] default_authority: Option<String>,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            idle_timeout,
            min_time_between_resolutions,
            connect_timeout,
            backoff,
            default_load_balancing,
            use_local_subchannel_pool,
            service_config_disable_resolution,
            default_service_config,
            enable_retries,
            default_authority,
        };
        config.validate()?;
        Ok(config)
    }
}

impl ChannelConfig {
    /// Builds a configuration from externally supplied dotted keys such as
    /// `backoff.initial = "2s"`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::RejectedKey`] for unsafe keys and
    /// [`ConfigError::Validation`] when the assembled document does not
    /// deserialize or validate.
    pub fn from_options<'a, I>(options: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, serde_json::Value)>,
    {
        let mut tree = OptionTree::new();
        for (key, value) in options {
            tree.insert(key, value)?;
        }
        let config: Self = serde_json::from_value(tree.into_value())
            .map_err(|e| ConfigError::Validation { message: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    /// Returns the idle timeout after applying the one-second floor.
    #[must_use]
    pub fn effective_idle_timeout(&self) -> Duration {
        self.idle_timeout.max(MIN_IDLE_TIMEOUT)
    }

    /// Parses [`ChannelConfig::default_service_config`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] when the text does not parse.
    pub fn parsed_default_service_config(&self) -> Result<Option<ServiceConfig>, ConfigError> {
        self.default_service_config
            .as_deref()
            .map(ServiceConfig::parse)
            .transpose()
            .map_err(|e| ConfigError::Validation {
                message: format!("default_service_config: {e}"),
            })
    }

    /// Validates the configuration values.
    ///
    /// Call after deserialization to ensure values are within valid ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Validation {
                message: "connect_timeout must be > 0".to_string(),
            });
        }
        self.backoff.validate()?;
        self.parsed_default_service_config()?;
        Ok(())
    }
}
