//! DNS targets: `dns:///example.com:443`, or any target whose scheme is not
//! registered.
//!
//! Each resolver runs one background task. A call to `update_resolution`
//! wakes it; wake-ups that arrive while a lookup is running or while the
//! throttle holds are coalesced into a single follow-up lookup. After a
//! success the next lookup starts no sooner than the minimum interval after
//! the previous one started; after a failure it waits out an exponential
//! backoff.

use std::{
    fmt,
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::{FutureExt, future::BoxFuture};
use hickory_resolver::{
    Resolver as HickoryResolver, config::ResolverConfig, name_server::TokioConnectionProvider,
};
use parking_lot::RwLock;
use rand::Rng;
use snafu::ResultExt;
use tokio::{sync::Notify, task::AbortHandle, time::Instant};
use wayfinder_types::{
    Address, DEFAULT_PORT, HostPort, Status, Target,
    config::{BackoffConfig, ServiceConfig},
};

use super::{ResolutionResult, Resolver, ResolverFactory, ResolverListener, ResolverOptions};
use crate::{
    backoff::ConnectionBackoff,
    error::{InvalidAddressSnafu, Result},
};

/// TXT record prefix carrying service config choices.
const SERVICE_CONFIG_TXT_PREFIX: &str = "grpc_config=";

/// Language name matched against `clientLanguage` in service config choices.
const CLIENT_LANGUAGE: &str = "rust";

/// Errors that can occur during DNS resolution.
#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    /// Address lookup failed.
    #[error("DNS resolution failed for {host}: {source}")]
    DnsResolution { host: String, source: hickory_resolver::ResolveError },

    /// TXT lookup failed.
    #[error("TXT lookup failed for {host}: {source}")]
    TxtResolution { host: String, source: hickory_resolver::ResolveError },

    /// The lookup succeeded with no usable answers.
    #[error("No addresses found for {host}")]
    NoAddresses { host: String },
}

/// Host lookups used by [`DnsResolver`].
pub trait HostLookup: Send + Sync + fmt::Debug {
    /// Looks up A and AAAA records.
    fn lookup_ip(&self, host: &str) -> BoxFuture<'static, std::result::Result<Vec<IpAddr>, ResolverError>>;

    /// Looks up TXT records, each returned as one string.
    fn lookup_txt(&self, host: &str) -> BoxFuture<'static, std::result::Result<Vec<String>, ResolverError>>;
}

/// [`HostLookup`] backed by hickory with the default resolver configuration.
#[derive(Debug, Clone, Default)]
pub struct HickoryLookup {
    /// Created on first use so construction needs no runtime.
    resolver: Arc<RwLock<Option<HickoryResolver<TokioConnectionProvider>>>>,
}

impl HickoryLookup {
    /// Creates a lookup that builds its resolver on first use.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_create(&self) -> HickoryResolver<TokioConnectionProvider> {
        if let Some(resolver) = self.resolver.read().as_ref() {
            return resolver.clone();
        }
        let mut guard = self.resolver.write();
        guard
            .get_or_insert_with(|| {
                HickoryResolver::builder_with_config(
                    ResolverConfig::default(),
                    TokioConnectionProvider::default(),
                )
                .build()
            })
            .clone()
    }
}

impl HostLookup for HickoryLookup {
    fn lookup_ip(&self, host: &str) -> BoxFuture<'static, std::result::Result<Vec<IpAddr>, ResolverError>> {
        let resolver = self.get_or_create();
        let host = host.to_owned();
        async move {
            let lookup = resolver
                .lookup_ip(host.as_str())
                .await
                .map_err(|source| ResolverError::DnsResolution { host: host.clone(), source })?;
            Ok(lookup.iter().collect())
        }
        .boxed()
    }

    fn lookup_txt(&self, host: &str) -> BoxFuture<'static, std::result::Result<Vec<String>, ResolverError>> {
        let resolver = self.get_or_create();
        let host = host.to_owned();
        async move {
            let lookup = resolver
                .txt_lookup(host.as_str())
                .await
                .map_err(|source| ResolverError::TxtResolution { host: host.clone(), source })?;
            Ok(lookup
                .iter()
                .map(|txt| {
                    txt.txt_data().iter().map(|chunk| String::from_utf8_lossy(chunk)).collect()
                })
                .collect())
        }
        .boxed()
    }
}

struct Lookup {
    host: String,
    port: u16,
    host_lookup: Arc<dyn HostLookup>,
    disable_service_config: bool,
}

impl Lookup {
    async fn resolve(&self) -> std::result::Result<ResolutionResult, ResolverError> {
        let ips = self.host_lookup.lookup_ip(&self.host).await?;
        let mut addresses: Vec<Address> = Vec::with_capacity(ips.len());
        for ip in ips {
            let address = Address::from(std::net::SocketAddr::new(ip, self.port));
            if !addresses.contains(&address) {
                addresses.push(address);
            }
        }
        if addresses.is_empty() {
            return Err(ResolverError::NoAddresses { host: self.host.clone() });
        }

        let mut result = ResolutionResult::from_addresses(addresses);
        if !self.disable_service_config {
            match self.service_config().await {
                Ok(config) => result.service_config = config.map(Arc::new),
                Err(status) => result.service_config_error = Some(status),
            }
        }
        Ok(result)
    }

    /// Reads the first `grpc_config=` TXT record. TXT lookup failures mean
    /// "no service config".
    async fn service_config(&self) -> std::result::Result<Option<ServiceConfig>, Status> {
        let records = match self.host_lookup.lookup_txt(&self.host).await {
            Ok(records) => records,
            Err(e) => {
                tracing::trace!(host = %self.host, error = %e, "no service config TXT record");
                return Ok(None);
            },
        };
        let Some(json) =
            records.iter().find_map(|record| record.strip_prefix(SERVICE_CONFIG_TXT_PREFIX))
        else {
            return Ok(None);
        };
        let roll = rand::rng().random_range(0..100);
        ServiceConfig::from_choices(json, CLIENT_LANGUAGE, None, roll)
            .map_err(|e| Status::unavailable(format!("invalid service config for {}: {e}", self.host)))
    }
}

/// Resolves a host name through a [`HostLookup`].
pub struct DnsResolver {
    target: Target,
    listener: Arc<dyn ResolverListener>,
    /// Set when the target is already an IP literal.
    literal: Option<Address>,
    lookup: Arc<Lookup>,
    options: ResolverOptions,
    wake: Arc<Notify>,
    destroyed: Arc<AtomicBool>,
    task: Option<AbortHandle>,
}

impl DnsResolver {
    fn spawn(&self) -> Option<AbortHandle> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(target = %self.target, "no tokio runtime; DNS resolution not started");
            return None;
        };
        let task = resolve_loop(
            Arc::clone(&self.lookup),
            Arc::clone(&self.listener),
            Arc::clone(&self.wake),
            Arc::clone(&self.destroyed),
            self.options.min_time_between_resolutions,
        );
        Some(runtime.spawn(task).abort_handle())
    }
}

impl Resolver for DnsResolver {
    fn update_resolution(&mut self) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        if let Some(address) = &self.literal {
            // Literals never change: deliver once.
            let address = address.clone();
            self.destroyed.store(true, Ordering::Release);
            self.listener.on_successful_resolution(ResolutionResult::from_addresses(vec![address]));
            return;
        }
        if self.task.is_none() {
            self.task = self.spawn();
        }
        self.wake.notify_one();
    }

    fn destroy(&mut self) {
        self.destroyed.store(true, Ordering::Release);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for DnsResolver {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for DnsResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsResolver")
            .field("target", &self.target)
            .field("literal", &self.literal)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

async fn resolve_loop(
    lookup: Arc<Lookup>,
    listener: Arc<dyn ResolverListener>,
    wake: Arc<Notify>,
    destroyed: Arc<AtomicBool>,
    min_interval: std::time::Duration,
) {
    let mut backoff = ConnectionBackoff::new(BackoffConfig::default());
    loop {
        wake.notified().await;
        let started = Instant::now();
        let outcome = lookup.resolve().await;
        if destroyed.load(Ordering::Acquire) {
            return;
        }
        let next_allowed = match outcome {
            Ok(result) => {
                backoff.reset();
                tracing::debug!(
                    host = %lookup.host,
                    addresses = result.addresses.len(),
                    has_service_config = result.service_config.is_some(),
                    "DNS resolution succeeded"
                );
                listener.on_successful_resolution(result);
                started + min_interval
            },
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(host = %lookup.host, error = %e, retry_after = ?delay, "DNS resolution failed");
                listener.on_error(Status::unavailable(e.to_string()));
                Instant::now() + delay
            },
        };
        tokio::time::sleep_until(next_allowed).await;
    }
}

/// Factory for the `dns` scheme.
#[derive(Debug, Clone)]
pub struct DnsResolverFactory {
    host_lookup: Arc<dyn HostLookup>,
}

impl Default for DnsResolverFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsResolverFactory {
    /// A factory using hickory for lookups.
    #[must_use]
    pub fn new() -> Self {
        Self::with_lookup(Arc::new(HickoryLookup::new()))
    }

    /// A factory using a custom lookup implementation.
    #[must_use]
    pub fn with_lookup(host_lookup: Arc<dyn HostLookup>) -> Self {
        Self { host_lookup }
    }
}

impl ResolverFactory for DnsResolverFactory {
    fn create(
        &self,
        target: &Target,
        listener: Arc<dyn ResolverListener>,
        options: &ResolverOptions,
    ) -> Result<Box<dyn Resolver>> {
        if let Some(authority) = target.authority()
            && !authority.is_empty()
        {
            tracing::warn!(%target, %authority, "custom DNS servers are not supported; using system resolver");
        }

        let host_port = HostPort::parse(target.path())
            .context(InvalidAddressSnafu { target: target.to_string() })?;
        let port = host_port.port.unwrap_or(DEFAULT_PORT);
        let literal = host_port
            .host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| Address::from(std::net::SocketAddr::new(ip, port)));

        Ok(Box::new(DnsResolver {
            target: target.clone(),
            listener,
            literal,
            lookup: Arc::new(Lookup {
                host: host_port.host,
                port,
                host_lookup: Arc::clone(&self.host_lookup),
                disable_service_config: options.disable_service_config,
            }),
            options: options.clone(),
            wake: Arc::new(Notify::new()),
            destroyed: Arc::new(AtomicBool::new(false)),
            task: None,
        }))
    }
}
