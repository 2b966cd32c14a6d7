//! Load balancing.
//!
//! A [`LoadBalancer`] receives address lists from the channel, creates and
//! watches subchannels through a [`ChannelControlHelper`], and publishes an
//! aggregate connectivity state together with a [`Picker`]. Every method runs
//! on the channel's work serializer, so implementations need no locking.
//!
//! Policies are registered by name in a [`LoadBalancerRegistry`] together
//! with a config parser that turns the policy's JSON object into a typed
//! [`LoadBalancingConfig`].

mod pick_first;

use std::{collections::HashMap, fmt, sync::Arc};

use serde_json::{Map, Value};
use wayfinder_types::{
    Address, ConnectivityState,
    config::{
        InvalidSnafu, LoadBalancingConfig, PICK_FIRST, PickFirstConfig, RawLoadBalancingConfig,
        ServiceConfigError,
    },
};

pub use self::pick_first::{PickFirst, PickFirstFactory, shuffled};
use crate::{
    error::{Result, UnknownPolicySnafu},
    picker::Picker,
    subchannel::{Subchannel, SubchannelId, Subscription},
};

/// The channel-side services a load balancer uses.
pub trait ChannelControlHelper: Send {
    /// Returns a subchannel for `address` holding one reference for the
    /// caller, released with [`Subchannel::unref`].
    fn create_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel>;

    /// Routes state changes of `subchannel` to
    /// [`LoadBalancer::subchannel_state_changed`] until the subscription is
    /// dropped.
    fn watch_subchannel(&mut self, subchannel: &Arc<dyn Subchannel>) -> Subscription;

    /// Publishes a new aggregate state and picker.
    fn update_state(&mut self, state: ConnectivityState, picker: Arc<dyn Picker>);

    /// Asks the resolver for a fresh address list.
    fn request_reresolution(&mut self);

    /// Registers a subchannel for introspection.
    fn add_channelz_child(&mut self, child: SubchannelId) {
        let _ = child;
    }

    /// Unregisters a subchannel from introspection.
    fn remove_channelz_child(&mut self, child: SubchannelId) {
        let _ = child;
    }
}

/// A load-balancing policy instance.
pub trait LoadBalancer: Send + fmt::Debug {
    /// Replaces the address list.
    fn update_address_list(
        &mut self,
        addresses: Vec<Address>,
        config: &LoadBalancingConfig,
        helper: &mut dyn ChannelControlHelper,
    );

    /// A watched subchannel changed state.
    fn subchannel_state_changed(
        &mut self,
        subchannel: SubchannelId,
        previous: ConnectivityState,
        next: ConnectivityState,
        helper: &mut dyn ChannelControlHelper,
    );

    /// Leaves IDLE by reconnecting to the current address list.
    fn exit_idle(&mut self, helper: &mut dyn ChannelControlHelper);

    /// Resets reconnect backoff on every subchannel.
    fn reset_backoff(&mut self);

    /// Releases every subchannel. Nothing is published afterwards.
    fn destroy(&mut self, helper: &mut dyn ChannelControlHelper);

    /// Registered name of the policy.
    fn policy_name(&self) -> &str;
}

/// Builds policy instances.
pub trait LoadBalancerFactory: Send + Sync + fmt::Debug {
    /// Creates a fresh instance.
    fn build(&self) -> Box<dyn LoadBalancer>;
}

/// Parses a policy's JSON config object. Must reject bad input with an
/// error, never panic.
pub type ConfigParser =
    Arc<dyn Fn(&Value) -> std::result::Result<LoadBalancingConfig, ServiceConfigError> + Send + Sync>;

#[derive(Clone)]
struct RegisteredPolicy {
    factory: Arc<dyn LoadBalancerFactory>,
    parser: ConfigParser,
}

/// Maps policy names to factories and config parsers.
#[derive(Clone)]
pub struct LoadBalancerRegistry {
    policies: HashMap<String, RegisteredPolicy>,
}

impl Default for LoadBalancerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl LoadBalancerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { policies: HashMap::new() }
    }

    /// A registry with `pick_first`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            PICK_FIRST,
            Arc::new(PickFirstFactory),
            Arc::new(|value: &Value| {
                PickFirstConfig::from_json(value).map(LoadBalancingConfig::PickFirst)
            }),
        );
        registry
    }

    /// Registers a policy, replacing any previous one of the same name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn LoadBalancerFactory>,
        parser: ConfigParser,
    ) {
        let name = name.into();
        tracing::debug!(policy = %name, "registered load balancer");
        self.policies.insert(name, RegisteredPolicy { factory, parser });
    }

    /// Returns true when `name` is registered.
    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    /// Instantiates the policy `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownPolicy`](crate::ClientError::UnknownPolicy)
    /// when nothing is registered under `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn LoadBalancer>> {
        self.policies
            .get(name)
            .map(|policy| policy.factory.build())
            .ok_or_else(|| UnknownPolicySnafu { name }.build())
    }

    /// Parses one `{name: config}` entry with the registered parser.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceConfigError::Invalid`] for an unregistered policy or
    /// a config the parser rejects.
    pub fn parse_config(
        &self,
        raw: &RawLoadBalancingConfig,
    ) -> std::result::Result<LoadBalancingConfig, ServiceConfigError> {
        let Some(policy) = self.policies.get(&raw.name) else {
            return InvalidSnafu { message: format!("unknown load balancing policy '{}'", raw.name) }
                .fail();
        };
        (policy.parser)(&raw.config)
    }

    /// Chooses the policy from a service config: the first registered entry
    /// of `configs`, else the legacy `policy` name. `Ok(None)` means the
    /// service config expresses no preference.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceConfigError::Invalid`] when entries are present but
    /// none is registered, or when the chosen entry fails to parse.
    pub fn select_config(
        &self,
        configs: &[RawLoadBalancingConfig],
        legacy_policy: Option<&str>,
    ) -> std::result::Result<Option<LoadBalancingConfig>, ServiceConfigError> {
        if !configs.is_empty() {
            let Some(raw) = configs.iter().find(|raw| self.is_registered(&raw.name)) else {
                let names: Vec<&str> = configs.iter().map(|raw| raw.name.as_str()).collect();
                return InvalidSnafu {
                    message: format!("no supported load balancing policy in {names:?}"),
                }
                .fail();
            };
            return self.parse_config(raw).map(Some);
        }
        match legacy_policy {
            None => Ok(None),
            Some(name) => {
                let name = name.to_ascii_lowercase();
                self.parse_config(&RawLoadBalancingConfig::new(name, Value::Object(Map::new())))
                    .map(Some)
            },
        }
    }
}

impl fmt::Debug for LoadBalancerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.policies.keys().collect();
        names.sort();
        f.debug_struct("LoadBalancerRegistry").field("policies", &names).finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ClientError;

    #[derive(Debug)]
    struct NullFactory;

    impl LoadBalancerFactory for NullFactory {
        fn build(&self) -> Box<dyn LoadBalancer> {
            Box::new(PickFirst::new())
        }
    }

    fn custom_registry() -> LoadBalancerRegistry {
        let mut registry = LoadBalancerRegistry::with_defaults();
        registry.register(
            "weighted",
            Arc::new(NullFactory),
            Arc::new(|value: &Value| {
                if value.get("weight").and_then(Value::as_u64).is_none() {
                    return InvalidSnafu { message: "weight is required" }.fail();
                }
                Ok(LoadBalancingConfig::Custom { name: "weighted".to_owned(), config: value.clone() })
            }),
        );
        registry
    }

    #[test]
    fn test_create_pick_first() {
        let lb = LoadBalancerRegistry::with_defaults().create(PICK_FIRST).unwrap();
        assert_eq!(lb.policy_name(), PICK_FIRST);
    }

    #[test]
    fn test_create_unknown_policy_fails() {
        let err = LoadBalancerRegistry::with_defaults().create("round_robin").unwrap_err();
        assert!(matches!(err, ClientError::UnknownPolicy { ref name } if name == "round_robin"));
    }

    #[test]
    fn test_select_skips_unregistered_entries() {
        let registry = LoadBalancerRegistry::with_defaults();
        let configs = vec![
            RawLoadBalancingConfig::new("round_robin", json!({})),
            RawLoadBalancingConfig::new(PICK_FIRST, json!({"shuffleAddressList": true})),
        ];
        let selected = registry.select_config(&configs, None).unwrap().unwrap();
        assert_eq!(
            selected,
            LoadBalancingConfig::PickFirst(PickFirstConfig { shuffle_address_list: true })
        );
    }

    #[test]
    fn test_select_with_nothing_supported_fails() {
        let registry = LoadBalancerRegistry::with_defaults();
        let configs = vec![RawLoadBalancingConfig::new("round_robin", json!({}))];
        assert!(registry.select_config(&configs, None).is_err());
    }

    #[test]
    fn test_select_legacy_policy_name() {
        let registry = LoadBalancerRegistry::with_defaults();
        let selected = registry.select_config(&[], Some("PICK_FIRST")).unwrap();
        assert_eq!(selected, Some(LoadBalancingConfig::default()));
        assert_eq!(registry.select_config(&[], None).unwrap(), None);
    }

    #[test]
    fn test_custom_parser_rejects_without_panicking() {
        let registry = custom_registry();
        let bad = RawLoadBalancingConfig::new("weighted", json!({}));
        assert!(registry.parse_config(&bad).is_err());

        let good = RawLoadBalancingConfig::new("weighted", json!({"weight": 3}));
        let parsed = registry.parse_config(&good).unwrap();
        assert_eq!(parsed.policy_name(), "weighted");
    }

    #[test]
    fn test_mistyped_pick_first_is_rejected() {
        let registry = LoadBalancerRegistry::with_defaults();
        let raw = RawLoadBalancingConfig::new(PICK_FIRST, json!({"shuffleAddressList": 7}));
        assert!(registry.parse_config(&raw).is_err());
    }
}
