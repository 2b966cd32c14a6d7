//! Load-balancing policy configuration.
//!
//! On the wire a policy config is a single-key JSON object naming the policy:
//! `{"pick_first": {"shuffleAddressList": true}}`. [`RawLoadBalancingConfig`]
//! holds that shape untouched; [`LoadBalancingConfig`] is the validated,
//! typed form a load balancer receives.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};
use serde_json::{Map, Value};

use super::{ConfigError, ServiceConfigError, service::InvalidSnafu};

/// Registered name of the pick-first policy.
pub const PICK_FIRST: &str = "pick_first";

/// An unvalidated `{policy_name: config}` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLoadBalancingConfig {
    /// Policy name.
    pub name: String,
    /// Policy-specific configuration object.
    pub config: Value,
}

impl RawLoadBalancingConfig {
    /// Creates a raw entry.
    pub fn new(name: impl Into<String>, config: Value) -> Self {
        Self { name: name.into(), config }
    }
}

impl Serialize for RawLoadBalancingConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = Map::new();
        map.insert(self.name.clone(), self.config.clone());
        map.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RawLoadBalancingConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = Map::<String, Value>::deserialize(deserializer)?;
        if map.len() != 1 {
            return Err(D::Error::custom(format!(
                "load balancing config must have exactly one key, found {}",
                map.len()
            )));
        }
        map.into_iter()
            .next()
            .map(|(name, config)| Self { name, config })
            .ok_or_else(|| D::Error::custom("empty load balancing config"))
    }
}

/// Configuration of the pick-first policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickFirstConfig {
    /// Shuffle the address list once per update before picking.
    #[serde(rename = "shuffleAddressList", default)]
    pub shuffle_address_list: bool,
}

impl PickFirstConfig {
    /// Parses the policy-specific object.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceConfigError::Invalid`] when the object has the wrong
    /// shape.
    pub fn from_json(config: &Value) -> Result<Self, ServiceConfigError> {
        if config.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(config.clone()).map_err(|e| {
            InvalidSnafu { message: format!("invalid pick_first config: {e}") }.build()
        })
    }
}

/// A validated load-balancing configuration, one variant per policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawLoadBalancingConfig", into = "RawLoadBalancingConfig")]
pub enum LoadBalancingConfig {
    /// The pick-first policy.
    PickFirst(PickFirstConfig),
    /// A policy registered by an application. The parser registered for
    /// `name` has already accepted `config`.
    Custom {
        /// Policy name.
        name: String,
        /// Policy-specific configuration.
        config: Value,
    },
}

impl LoadBalancingConfig {
    /// Returns the policy name this config selects.
    #[must_use]
    pub fn policy_name(&self) -> &str {
        match self {
            Self::PickFirst(_) => PICK_FIRST,
            Self::Custom { name, .. } => name,
        }
    }

    /// Returns the pick-first config when this selects pick-first.
    #[must_use]
    pub fn as_pick_first(&self) -> Option<&PickFirstConfig> {
        match self {
            Self::PickFirst(config) => Some(config),
            Self::Custom { .. } => None,
        }
    }
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self::PickFirst(PickFirstConfig::default())
    }
}

impl fmt::Display for LoadBalancingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.policy_name())
    }
}

impl TryFrom<RawLoadBalancingConfig> for LoadBalancingConfig {
    type Error = ConfigError;

    fn try_from(raw: RawLoadBalancingConfig) -> Result<Self, Self::Error> {
        if raw.name == PICK_FIRST {
            return PickFirstConfig::from_json(&raw.config)
                .map(Self::PickFirst)
                .map_err(|e| ConfigError::Validation { message: e.to_string() });
        }
        Ok(Self::Custom { name: raw.name, config: raw.config })
    }
}

impl From<LoadBalancingConfig> for RawLoadBalancingConfig {
    fn from(config: LoadBalancingConfig) -> Self {
        match config {
            LoadBalancingConfig::PickFirst(pick_first) => Self::new(
                PICK_FIRST,
                serde_json::to_value(pick_first).unwrap_or(Value::Object(Map::new())),
            ),
            LoadBalancingConfig::Custom { name, config } => Self::new(name, config),
        }
    }
}
