//! Name resolution.
//!
//! A [`Resolver`] turns a [`Target`] into a stream of [`ResolutionResult`]s
//! delivered to a [`ResolverListener`]. Resolvers are created by a
//! [`ResolverFactory`] registered against a URI scheme in a
//! [`ResolverRegistry`]. Built-in schemes:
//!
//! | Scheme | Resolver | Target examples |
//! |--------|----------|-----------------|
//! | `dns` | [`DnsResolver`] | `dns:///example.com:443`, `localhost:50051` |
//! | `ipv4` | [`IpResolver`] | `ipv4:10.0.0.1,10.0.0.2:8080` |
//! | `ipv6` | [`IpResolver`] | `ipv6:[::1]:8080,::2` |
//! | `unix` | [`UdsResolver`] | `unix:relative/sock`, `unix:///abs/sock` |
//!
//! A target whose scheme is not registered is remapped onto the default
//! scheme with the whole target string as the path.

mod dns;
mod ip;
mod uds;

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use wayfinder_types::{Address, Status, Target, config::ServiceConfig};

pub use self::{
    dns::{DnsResolver, DnsResolverFactory, HickoryLookup, HostLookup, ResolverError},
    ip::{IpFamily, IpResolver, IpResolverFactory},
    uds::{UdsResolver, UdsResolverFactory},
};
use crate::error::{Result, UnknownSchemeSnafu};

/// Scheme applied to targets with no registered scheme.
pub const DEFAULT_SCHEME: &str = "dns";

/// One resolver output.
#[derive(Debug, Clone, Default)]
pub struct ResolutionResult {
    /// Resolved addresses, in resolver order.
    pub addresses: Vec<Address>,
    /// Service config carried by the resolution, if any.
    pub service_config: Option<Arc<ServiceConfig>>,
    /// Set when the resolution carried a service config that failed to parse.
    pub service_config_error: Option<Status>,
}

impl ResolutionResult {
    /// A result with addresses only.
    #[must_use]
    pub fn from_addresses(addresses: Vec<Address>) -> Self {
        Self { addresses, ..Self::default() }
    }
}

/// Receives resolver output.
pub trait ResolverListener: Send + Sync {
    /// A resolution completed.
    fn on_successful_resolution(&self, result: ResolutionResult);

    /// A resolution failed. The status is UNAVAILABLE.
    fn on_error(&self, status: Status);
}

/// A live resolver for one target.
pub trait Resolver: Send + fmt::Debug {
    /// Starts a resolution, or schedules one for when the minimum interval
    /// since the last one has passed.
    fn update_resolution(&mut self);

    /// Stops resolving. No listener calls happen after this returns.
    fn destroy(&mut self);
}

/// Options passed to every resolver.
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Minimum spacing between two resolutions of the same target.
    pub min_time_between_resolutions: Duration,
    /// Skip service config lookups.
    pub disable_service_config: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self { min_time_between_resolutions: Duration::from_secs(30), disable_service_config: false }
    }
}

/// Creates resolvers for one scheme.
pub trait ResolverFactory: Send + Sync + fmt::Debug {
    /// Creates a resolver. It must not deliver anything before its first
    /// `update_resolution` call.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`](crate::ClientError) when the target cannot
    /// be handled by this scheme.
    fn create(
        &self,
        target: &Target,
        listener: Arc<dyn ResolverListener>,
        options: &ResolverOptions,
    ) -> Result<Box<dyn Resolver>>;

    /// Authority to use for calls on channels to `target`.
    fn default_authority(&self, target: &Target) -> String {
        target.path().to_owned()
    }
}

/// Maps URI schemes to resolver factories.
#[derive(Debug, Clone)]
pub struct ResolverRegistry {
    factories: HashMap<String, Arc<dyn ResolverFactory>>,
    default_scheme: Option<String>,
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ResolverRegistry {
    /// An empty registry with no default scheme.
    #[must_use]
    pub fn new() -> Self {
        Self { factories: HashMap::new(), default_scheme: None }
    }

    /// A registry with the built-in schemes and `dns` as the default.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("dns", Arc::new(DnsResolverFactory::new()));
        registry.register("ipv4", Arc::new(IpResolverFactory::new(IpFamily::V4)));
        registry.register("ipv6", Arc::new(IpResolverFactory::new(IpFamily::V6)));
        registry.register("unix", Arc::new(UdsResolverFactory));
        registry.set_default_scheme(DEFAULT_SCHEME);
        registry
    }

    /// Registers `factory` for `scheme`, replacing any previous one.
    pub fn register(&mut self, scheme: impl Into<String>, factory: Arc<dyn ResolverFactory>) {
        let scheme = scheme.into();
        tracing::debug!(%scheme, ?factory, "registered resolver");
        self.factories.insert(scheme, factory);
    }

    /// Sets the scheme used for targets with no registered scheme.
    pub fn set_default_scheme(&mut self, scheme: impl Into<String>) {
        self.default_scheme = Some(scheme.into());
    }

    /// Returns true when `scheme` has a factory.
    #[must_use]
    pub fn is_registered(&self, scheme: &str) -> bool {
        self.factories.contains_key(scheme)
    }

    /// Returns `target` unchanged when its scheme is registered, otherwise
    /// the target re-rooted under the default scheme. Returns `None` when
    /// neither applies.
    #[must_use]
    pub fn map_default_scheme(&self, target: &Target) -> Option<Target> {
        if target.scheme().is_some_and(|scheme| self.is_registered(scheme)) {
            return Some(target.clone());
        }
        let default = self.default_scheme.as_deref()?;
        self.is_registered(default).then(|| target.with_default_scheme(default))
    }

    /// Creates a resolver for `target`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownScheme`](crate::ClientError::UnknownScheme)
    /// when no factory handles the target, or the factory's own error.
    pub fn create_resolver(
        &self,
        target: &Target,
        listener: Arc<dyn ResolverListener>,
        options: &ResolverOptions,
    ) -> Result<Box<dyn Resolver>> {
        let factory = self.factory_for(target)?;
        factory.create(target, listener, options)
    }

    /// Default authority for `target`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownScheme`](crate::ClientError::UnknownScheme)
    /// when no factory handles the target.
    pub fn default_authority(&self, target: &Target) -> Result<String> {
        Ok(self.factory_for(target)?.default_authority(target))
    }

    fn factory_for(&self, target: &Target) -> Result<&Arc<dyn ResolverFactory>> {
        let scheme = target.scheme().unwrap_or_default();
        self.factories.get(scheme).ok_or_else(|| UnknownSchemeSnafu { scheme }.build())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use wayfinder_test_utils::strategies::{arb_dns_target, arb_hostname};

    use super::*;
    use crate::error::ClientError;

    #[derive(Debug)]
    struct OtherResolver;

    impl Resolver for OtherResolver {
        fn update_resolution(&mut self) {}
        fn destroy(&mut self) {}
    }

    #[derive(Debug)]
    struct OtherFactory;

    impl ResolverFactory for OtherFactory {
        fn create(
            &self,
            _target: &Target,
            _listener: Arc<dyn ResolverListener>,
            _options: &ResolverOptions,
        ) -> Result<Box<dyn Resolver>> {
            Ok(Box::new(OtherResolver))
        }

        fn default_authority(&self, _target: &Target) -> String {
            "other".to_owned()
        }
    }

    #[derive(Default)]
    struct Collect {
        results: Mutex<Vec<ResolutionResult>>,
        errors: Mutex<Vec<Status>>,
    }

    impl ResolverListener for Collect {
        fn on_successful_resolution(&self, result: ResolutionResult) {
            self.results.lock().push(result);
        }

        fn on_error(&self, status: Status) {
            self.errors.lock().push(status);
        }
    }

    fn map(registry: &ResolverRegistry, input: &str) -> Target {
        registry.map_default_scheme(&Target::parse(input).unwrap()).unwrap()
    }

    #[test]
    fn test_registered_scheme_is_kept() {
        let registry = ResolverRegistry::with_defaults();
        let target = map(&registry, "unix:socket");
        assert_eq!(target.scheme(), Some("unix"));
        assert_eq!(target.path(), "socket");
    }

    #[test]
    fn test_unregistered_scheme_maps_to_dns() {
        let registry = ResolverRegistry::with_defaults();
        let target = map(&registry, "localhost:50051");
        assert_eq!(target.scheme(), Some("dns"));
        assert_eq!(target.path(), "localhost:50051");

        let target = map(&registry, "example.com");
        assert_eq!(target.scheme(), Some("dns"));
        assert_eq!(target.path(), "example.com");
    }

    #[test]
    fn test_no_default_scheme_maps_to_none() {
        let registry = ResolverRegistry::new();
        assert!(registry.map_default_scheme(&Target::parse("example.com").unwrap()).is_none());
    }

    #[test]
    fn test_other_resolver_default_authority() {
        let mut registry = ResolverRegistry::with_defaults();
        registry.register("other", Arc::new(OtherFactory));
        let target = map(&registry, "other:name");
        assert_eq!(registry.default_authority(&target).unwrap(), "other");
    }

    #[test]
    fn test_dns_default_authority_is_path() {
        let registry = ResolverRegistry::with_defaults();
        let target = map(&registry, "dns:///example.com:8080");
        assert_eq!(registry.default_authority(&target).unwrap(), "example.com:8080");
    }

    #[test]
    fn test_unknown_scheme_is_an_error() {
        let registry = ResolverRegistry::new();
        let target = Target::parse("nope:thing").unwrap();
        let err = registry
            .create_resolver(&target, Arc::new(Collect::default()), &ResolverOptions::default())
            .unwrap_err();
        assert!(matches!(err, ClientError::UnknownScheme { ref scheme, .. } if scheme == "nope"));
    }

    #[test]
    fn test_ipv4_through_registry() {
        let registry = ResolverRegistry::with_defaults();
        let listener = Arc::new(Collect::default());
        let target = map(&registry, "ipv4:127.0.0.1:50051");
        let mut resolver =
            registry.create_resolver(&target, listener.clone(), &ResolverOptions::default()).unwrap();
        resolver.update_resolution();
        let results = listener.results.lock();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].addresses, vec![Address::tcp("127.0.0.1", 50051)]);
    }

    proptest! {
        #[test]
        fn prop_dns_targets_keep_their_scheme(target in arb_dns_target()) {
            let registry = ResolverRegistry::with_defaults();
            let parsed = Target::parse(&target).unwrap();
            let mapped = registry.map_default_scheme(&parsed).unwrap();
            prop_assert_eq!(&mapped, &parsed);
            prop_assert_eq!(registry.default_authority(&mapped).unwrap(), parsed.path());
        }

        #[test]
        fn prop_bare_hosts_map_to_dns(host in arb_hostname()) {
            let registry = ResolverRegistry::with_defaults();
            let mapped = registry.map_default_scheme(&Target::parse(&host).unwrap()).unwrap();
            prop_assert_eq!(mapped.scheme(), Some(DEFAULT_SCHEME));
            prop_assert_eq!(mapped.path(), host.as_str());
        }
    }
}
