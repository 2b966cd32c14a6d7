//! The channel: one logical connection to a target.
//!
//! A [`Channel`] owns the resolver for its target, the active load balancer
//! and the idle timer. Everything that changes channel state is an event
//! processed one at a time on the channel's work serializer: resolver output,
//! subchannel transitions, timers and call accounting. Handlers that cause
//! further events (a resolver answering synchronously, a subchannel
//! transition triggered by the load balancer) enqueue them instead of
//! recursing.
//!
//! The result of all that work is a [`ChannelSnapshot`] (state, picker and
//! service config) published through a `tokio::sync::watch` channel, which is
//! all that calls and connectivity watchers ever look at.
//!
//! # Lifecycle
//!
//! ```text
//!  new ──▶ IDLE ──first call / connectivity_state(true)──▶ CONNECTING ──▶ ...
//!           ▲                                                   │
//!           └──────── idle timer fires with no active calls ────┘
//!
//!  close() from any state ──▶ SHUTDOWN
//! ```

use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use snafu::ResultExt;
use tokio::{sync::watch, task::AbortHandle, time::Instant};
use wayfinder_types::{
    Address, ConnectivityState, Status, Target,
    config::{ChannelConfig, LoadBalancingConfig, MethodConfig, ServiceConfig},
};

use crate::{
    backoff::ConnectionBackoff,
    call::{Call, CallOptions},
    error::{InvalidTargetSnafu, Result, UnknownSchemeSnafu},
    load_balancer::{ChannelControlHelper, LoadBalancer, LoadBalancerRegistry},
    metrics::{ClientMetrics, default_metrics},
    picker::{FailPicker, Picker, QueuePicker},
    resolver::{ResolutionResult, Resolver, ResolverListener, ResolverOptions, ResolverRegistry},
    serializer::Serializer,
    subchannel::{Subchannel, SubchannelId, SubchannelPool, SubchannelSettings, Subscription},
    transport::{Connector, TonicConnector},
};

/// What calls and watchers see of a channel.
#[derive(Clone)]
pub struct ChannelSnapshot {
    /// Aggregate connectivity state.
    pub state: ConnectivityState,
    /// Current picker.
    pub picker: Arc<dyn Picker>,
    /// Service config in effect.
    pub service_config: Option<Arc<ServiceConfig>>,
}

impl fmt::Debug for ChannelSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSnapshot")
            .field("state", &self.state)
            .field("picker", &self.picker)
            .field("has_service_config", &self.service_config.is_some())
            .finish()
    }
}

enum Event {
    Resolved { generation: u64, result: ResolutionResult },
    ResolutionFailed { generation: u64, status: Status },
    SubchannelState {
        lb_generation: u64,
        subchannel: SubchannelId,
        previous: ConnectivityState,
        next: ConnectivityState,
    },
    ExitIdle,
    CallStarted,
    CallEnded,
    IdleTimerFired { generation: u64 },
    ReresolveTimerFired { generation: u64 },
    ResetBackoff,
    Shutdown,
}

/// State owned by whichever thread is draining the serializer.
struct Core {
    state: ConnectivityState,
    /// True while the channel is idle at the channel level: no resolver
    /// activity and no load balancer.
    channel_idle: bool,
    shut_down: bool,
    resolver: Option<Box<dyn Resolver>>,
    resolver_generation: u64,
    lb: Option<Box<dyn LoadBalancer>>,
    lb_generation: u64,
    lb_config: Option<LoadBalancingConfig>,
    service_config: Option<Arc<ServiceConfig>>,
    resolution_backoff: ConnectionBackoff,
    reresolve_timer: Option<AbortHandle>,
    reresolve_generation: u64,
    idle_timer: Option<AbortHandle>,
    idle_generation: u64,
}

impl Core {
    fn helper<'a>(
        &'a mut self,
        channel: &'a ChannelInner,
    ) -> (Option<&'a mut Box<dyn LoadBalancer>>, Helper<'a>) {
        let Self { lb, state, resolver, lb_generation, .. } = self;
        (lb.as_mut(), Helper { channel, state, resolver, lb_generation: *lb_generation })
    }
}

/// The [`ChannelControlHelper`] handed to the load balancer.
struct Helper<'a> {
    channel: &'a ChannelInner,
    state: &'a mut ConnectivityState,
    resolver: &'a mut Option<Box<dyn Resolver>>,
    lb_generation: u64,
}

impl ChannelControlHelper for Helper<'_> {
    fn create_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        self.channel.pool.get_or_create(
            address,
            &self.channel.connector,
            &self.channel.subchannel_settings,
            &self.channel.metrics,
        )
    }

    fn watch_subchannel(&mut self, subchannel: &Arc<dyn Subchannel>) -> Subscription {
        let channel = self.channel.weak_self.clone();
        let lb_generation = self.lb_generation;
        subchannel.subscribe(Arc::new(move |subchannel, previous, next| {
            if let Some(channel) = channel.upgrade() {
                channel.submit(Event::SubchannelState { lb_generation, subchannel, previous, next });
            }
        }))
    }

    fn update_state(&mut self, state: ConnectivityState, picker: Arc<dyn Picker>) {
        self.channel.publish(self.state, state, picker);
    }

    fn request_reresolution(&mut self) {
        if let Some(resolver) = self.resolver.as_mut() {
            tracing::debug!(channel = %self.channel.target, "re-resolution requested");
            resolver.update_resolution();
        }
    }

    fn add_channelz_child(&mut self, child: SubchannelId) {
        tracing::trace!(channel = %self.channel.target, %child, "subchannel attached");
    }

    fn remove_channelz_child(&mut self, child: SubchannelId) {
        tracing::trace!(channel = %self.channel.target, %child, "subchannel detached");
    }
}

/// Forwards resolver output into the serializer, tagged with the resolver's
/// generation so that output from a destroyed resolver is dropped.
struct ResolverEvents {
    channel: Weak<ChannelInner>,
    generation: u64,
}

impl ResolverListener for ResolverEvents {
    fn on_successful_resolution(&self, result: ResolutionResult) {
        if let Some(channel) = self.channel.upgrade() {
            channel.submit(Event::Resolved { generation: self.generation, result });
        }
    }

    fn on_error(&self, status: Status) {
        if let Some(channel) = self.channel.upgrade() {
            channel.submit(Event::ResolutionFailed { generation: self.generation, status });
        }
    }
}

pub(crate) struct ChannelInner {
    target: Target,
    authority: String,
    config: ChannelConfig,
    resolvers: Arc<ResolverRegistry>,
    resolver_options: ResolverOptions,
    load_balancers: Arc<LoadBalancerRegistry>,
    connector: Arc<dyn Connector>,
    pool: Arc<SubchannelPool>,
    subchannel_settings: SubchannelSettings,
    metrics: Arc<dyn ClientMetrics>,
    default_service_config: Option<Arc<ServiceConfig>>,
    serializer: Serializer<Event>,
    core: Mutex<Core>,
    snapshot: watch::Sender<ChannelSnapshot>,
    active_calls: AtomicUsize,
    weak_self: Weak<ChannelInner>,
}

impl ChannelInner {
    fn submit(&self, event: Event) {
        self.serializer.run(event, |event| self.handle(event));
    }

    fn handle(&self, event: Event) {
        let mut core = self.core.lock();
        match event {
            Event::Resolved { generation, result } => self.on_resolved(&mut core, generation, result),
            Event::ResolutionFailed { generation, status } => {
                self.on_resolution_failed(&mut core, generation, &status);
            },
            Event::SubchannelState { lb_generation, subchannel, previous, next } => {
                if core.shut_down || lb_generation != core.lb_generation {
                    return;
                }
                let (lb, mut helper) = core.helper(self);
                if let Some(lb) = lb {
                    lb.subchannel_state_changed(subchannel, previous, next, &mut helper);
                }
            },
            Event::ExitIdle => self.exit_idle(&mut core),
            Event::CallStarted => {
                Self::disarm_idle_timer(&mut core);
                if core.state == ConnectivityState::Idle {
                    self.exit_idle(&mut core);
                }
            },
            Event::CallEnded => {
                if self.active_calls.load(Ordering::Acquire) == 0 {
                    self.arm_idle_timer(&mut core);
                }
            },
            Event::IdleTimerFired { generation } => {
                if generation != core.idle_generation
                    || core.shut_down
                    || core.channel_idle
                    || self.active_calls.load(Ordering::Acquire) > 0
                {
                    return;
                }
                self.enter_idle(&mut core);
            },
            Event::ReresolveTimerFired { generation } => {
                if generation != core.reresolve_generation || core.shut_down {
                    return;
                }
                core.reresolve_timer = None;
                if let Some(resolver) = core.resolver.as_mut() {
                    resolver.update_resolution();
                }
            },
            Event::ResetBackoff => {
                core.resolution_backoff.reset();
                if let Some(lb) = core.lb.as_mut() {
                    lb.reset_backoff();
                }
                if let Some(timer) = core.reresolve_timer.take() {
                    timer.abort();
                    if let Some(resolver) = core.resolver.as_mut() {
                        resolver.update_resolution();
                    }
                }
            },
            Event::Shutdown => self.shutdown(&mut core),
        }
    }

    fn publish(&self, current: &mut ConnectivityState, state: ConnectivityState, picker: Arc<dyn Picker>) {
        let previous = std::mem::replace(current, state);
        if previous != state {
            tracing::debug!(channel = %self.target, from = %previous, to = %state, "channel state change");
            self.metrics.record_channel_transition(&self.target.to_string(), previous, state);
        }
        self.snapshot.send_modify(|snapshot| {
            snapshot.state = state;
            snapshot.picker = picker;
        });
    }

    fn fail_with(&self, core: &mut Core, status: Status) {
        self.publish(
            &mut core.state,
            ConnectivityState::TransientFailure,
            Arc::new(FailPicker::new(status)),
        );
    }

    fn create_resolver(&self, generation: u64) -> Result<Box<dyn Resolver>> {
        let listener = Arc::new(ResolverEvents { channel: self.weak_self.clone(), generation });
        self.resolvers.create_resolver(&self.target, listener, &self.resolver_options)
    }

    fn spawn_timer(&self, delay: Duration, event: Event) -> Option<AbortHandle> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(channel = %self.target, "no tokio runtime; timer not started");
            return None;
        };
        let channel = self.weak_self.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(channel) = channel.upgrade() {
                channel.submit(event);
            }
        });
        Some(task.abort_handle())
    }

    fn arm_idle_timer(&self, core: &mut Core) {
        if core.shut_down || core.channel_idle {
            return;
        }
        Self::disarm_idle_timer(core);
        let timeout = self.config.effective_idle_timeout();
        core.idle_timer =
            self.spawn_timer(timeout, Event::IdleTimerFired { generation: core.idle_generation });
        tracing::trace!(channel = %self.target, ?timeout, "idle timer armed");
    }

    fn disarm_idle_timer(core: &mut Core) {
        core.idle_generation += 1;
        if let Some(timer) = core.idle_timer.take() {
            timer.abort();
        }
    }

    fn exit_idle(&self, core: &mut Core) {
        if core.shut_down {
            return;
        }
        if core.channel_idle {
            core.channel_idle = false;
            tracing::info!(channel = %self.target, "channel exiting idle");
            if core.resolver.is_none() {
                core.resolver_generation += 1;
                match self.create_resolver(core.resolver_generation) {
                    Ok(resolver) => core.resolver = Some(resolver),
                    Err(err) => {
                        tracing::warn!(channel = %self.target, error = %err, "failed to create resolver");
                        self.fail_with(core, Status::unavailable(err.to_string()));
                        return;
                    },
                }
            }
            self.publish(&mut core.state, ConnectivityState::Connecting, Arc::new(QueuePicker));
            if let Some(resolver) = core.resolver.as_mut() {
                resolver.update_resolution();
            }
        } else if core.lb.is_some() {
            let (lb, mut helper) = core.helper(self);
            if let Some(lb) = lb {
                lb.exit_idle(&mut helper);
            }
        } else if let Some(resolver) = core.resolver.as_mut() {
            resolver.update_resolution();
        }
        if self.active_calls.load(Ordering::Acquire) == 0 {
            self.arm_idle_timer(core);
        }
    }

    /// Destroys the load balancer and the resolver and cancels re-resolution.
    fn teardown(&self, core: &mut Core) {
        if let Some(timer) = core.reresolve_timer.take() {
            timer.abort();
        }
        if let Some(mut resolver) = core.resolver.take() {
            resolver.destroy();
        }
        core.resolver_generation += 1;
        core.resolution_backoff.reset();

        let lb = core.lb.take();
        core.lb_generation += 1;
        if let Some(mut lb) = lb {
            let (_, mut helper) = core.helper(self);
            lb.destroy(&mut helper);
        }
    }

    fn enter_idle(&self, core: &mut Core) {
        tracing::info!(channel = %self.target, "channel entering idle");
        core.idle_timer = None;
        self.teardown(core);
        core.channel_idle = true;
        self.publish(&mut core.state, ConnectivityState::Idle, Arc::new(QueuePicker));
    }

    fn shutdown(&self, core: &mut Core) {
        if core.shut_down {
            return;
        }
        tracing::info!(channel = %self.target, "channel shutting down");
        Self::disarm_idle_timer(core);
        self.teardown(core);
        core.shut_down = true;
        self.publish(
            &mut core.state,
            ConnectivityState::Shutdown,
            Arc::new(FailPicker::new(Status::unavailable("channel closed"))),
        );
    }

    /// Chooses the service config to apply for `result`. An error means there
    /// is nothing usable: the resolver's config is invalid and there is no
    /// previous or default config to fall back on.
    fn choose_service_config(
        &self,
        previous: Option<&Arc<ServiceConfig>>,
        result: &ResolutionResult,
    ) -> std::result::Result<Option<Arc<ServiceConfig>>, Status> {
        if self.config.service_config_disable_resolution {
            return Ok(self.default_service_config.clone());
        }
        if let Some(error) = &result.service_config_error {
            tracing::warn!(channel = %self.target, error = %error, "rejected service config from resolver");
            if let Some(config) = previous.or(self.default_service_config.as_ref()) {
                return Ok(Some(Arc::clone(config)));
            }
            return Err(Status::unavailable(format!("invalid service config: {}", error.details())));
        }
        Ok(result.service_config.clone().or_else(|| self.default_service_config.clone()))
    }

    fn on_resolved(&self, core: &mut Core, generation: u64, result: ResolutionResult) {
        if core.shut_down || generation != core.resolver_generation {
            return;
        }
        tracing::debug!(channel = %self.target, addresses = result.addresses.len(), "resolution succeeded");
        self.metrics.record_resolution(&self.target.to_string(), true);
        core.resolution_backoff.reset();
        if let Some(timer) = core.reresolve_timer.take() {
            timer.abort();
        }

        let mut service_config = match self.choose_service_config(core.service_config.as_ref(), &result) {
            Ok(config) => config,
            Err(status) => {
                if core.lb.is_none() {
                    self.fail_with(core, status);
                }
                return;
            },
        };

        let selected = service_config.as_deref().map(|config| {
            self.load_balancers
                .select_config(&config.load_balancing_config, config.load_balancing_policy.as_deref())
        });
        let lb_config = match selected {
            Some(Ok(Some(selected))) => selected,
            None | Some(Ok(None)) => self.config.default_load_balancing.clone(),
            Some(Err(err)) => {
                tracing::warn!(
                    channel = %self.target,
                    error = %err,
                    "rejected load balancing config; keeping the previous service config"
                );
                service_config = core.service_config.clone();
                core.lb_config.clone().unwrap_or_else(|| self.config.default_load_balancing.clone())
            },
        };

        let replaced = match core.lb.as_ref() {
            Some(lb) if lb.policy_name() == lb_config.policy_name() => None,
            _ => match self.load_balancers.create(lb_config.policy_name()) {
                Ok(lb) => {
                    tracing::debug!(channel = %self.target, policy = lb_config.policy_name(), "load balancer created");
                    core.lb_generation += 1;
                    core.lb.replace(lb)
                },
                Err(err) => {
                    tracing::warn!(channel = %self.target, error = %err, "failed to create load balancer");
                    return;
                },
            },
        };

        core.service_config = service_config.clone();
        core.lb_config = Some(lb_config.clone());
        self.snapshot.send_modify(|snapshot| snapshot.service_config = service_config);

        let (lb, mut helper) = core.helper(self);
        if let Some(lb) = lb {
            lb.update_address_list(result.addresses, &lb_config, &mut helper);
        }
        // The old policy goes last so subchannels shared with the new one keep
        // their references and connections.
        if let Some(mut old) = replaced {
            old.destroy(&mut helper);
        }
    }

    fn on_resolution_failed(&self, core: &mut Core, generation: u64, status: &Status) {
        if core.shut_down || generation != core.resolver_generation {
            return;
        }
        tracing::warn!(channel = %self.target, error = %status, "name resolution failed");
        self.metrics.record_resolution(&self.target.to_string(), false);
        if core.lb.is_none() {
            self.fail_with(
                core,
                Status::unavailable(format!(
                    "name resolution failed for {}: {}",
                    self.target,
                    status.details()
                )),
            );
        }

        let delay = core.resolution_backoff.next_delay();
        core.reresolve_generation += 1;
        if let Some(timer) = core.reresolve_timer.take() {
            timer.abort();
        }
        core.reresolve_timer =
            self.spawn_timer(delay, Event::ReresolveTimerFired { generation: core.reresolve_generation });
        tracing::debug!(channel = %self.target, ?delay, "re-resolution scheduled");
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ChannelSnapshot> {
        self.snapshot.subscribe()
    }

    pub(crate) fn call_started(&self) {
        self.active_calls.fetch_add(1, Ordering::AcqRel);
        self.submit(Event::CallStarted);
    }

    pub(crate) fn call_ended(&self) {
        let _ = self.active_calls.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.submit(Event::CallEnded);
    }

    pub(crate) fn metrics(&self) -> &Arc<dyn ClientMetrics> {
        &self.metrics
    }

    pub(crate) fn config(&self) -> &ChannelConfig {
        &self.config
    }

    fn state(&self) -> ConnectivityState {
        self.snapshot.borrow().state
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let mut core = std::mem::replace(self.core.get_mut(), Core::placeholder());
        if let Some(timer) = core.idle_timer.take() {
            timer.abort();
        }
        self.teardown(&mut core);
    }
}

impl Core {
    fn new(resolver: Option<Box<dyn Resolver>>, backoff: ConnectionBackoff) -> Self {
        Self {
            state: ConnectivityState::Idle,
            channel_idle: true,
            shut_down: false,
            resolver,
            resolver_generation: 0,
            lb: None,
            lb_generation: 0,
            lb_config: None,
            service_config: None,
            resolution_backoff: backoff,
            reresolve_timer: None,
            reresolve_generation: 0,
            idle_timer: None,
            idle_generation: 0,
        }
    }

    fn placeholder() -> Self {
        Self::new(None, ConnectionBackoff::new(Default::default()))
    }
}

/// A client channel to one target.
///
/// Cloning is cheap; clones share the same connections. The channel starts
/// IDLE and connects on the first call or on
/// [`Channel::connectivity_state`]`(true)`.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
///
/// use wayfinder_client::{CallOptions, Channel};
/// use wayfinder_types::config::ChannelConfig;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let channel = Channel::builder()
///     .target("dns:///echo.example.com:50051")
///     .config(ChannelConfig::builder().idle_timeout(Duration::from_secs(300)).build()?)
///     .build()?;
///
/// let call = channel.create_call("/echo.Echo/Say", CallOptions::default());
/// let reply = call.unary(bytes::Bytes::from_static(b"hello")).await?;
/// # drop(reply);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

#[bon::bon]
impl Channel {
    /// Creates a channel.
    ///
    /// The target is parsed and its resolver created up front, so a bad
    /// target fails here rather than on the first call. Nothing connects
    /// until the channel leaves IDLE.
    ///
    /// # Errors
    ///
    /// - [`ClientError::InvalidTarget`](crate::ClientError::InvalidTarget) for an unparsable target.
    /// - [`ClientError::UnknownScheme`](crate::ClientError::UnknownScheme) when no resolver applies.
    /// - [`ClientError::InvalidAddress`](crate::ClientError::InvalidAddress) for bad IP literals.
    /// - [`ClientError::Config`](crate::ClientError::Config) when the config fails validation.
    #[builder]
    pub fn new(
        #[builder(into)] target: String,
        #[builder(default)] config: ChannelConfig,
        connector: Option<Arc<dyn Connector>>,
        resolvers: Option<Arc<ResolverRegistry>>,
        load_balancers: Option<Arc<LoadBalancerRegistry>>,
        metrics: Option<Arc<dyn ClientMetrics>>,
        subchannel_pool: Option<Arc<SubchannelPool>>,
    ) -> Result<Self> {
        config.validate()?;
        let default_service_config = config.parsed_default_service_config()?.map(Arc::new);

        let resolvers = resolvers.unwrap_or_default();
        let parsed = Target::parse(&target).context(InvalidTargetSnafu)?;
        let target = resolvers.map_default_scheme(&parsed).ok_or_else(|| {
            UnknownSchemeSnafu { scheme: parsed.scheme().unwrap_or_default() }.build()
        })?;
        let authority = match &config.default_authority {
            Some(authority) => authority.clone(),
            None => resolvers.default_authority(&target)?,
        };

        let pool = match subchannel_pool {
            _ if config.use_local_subchannel_pool => Arc::new(SubchannelPool::new()),
            Some(pool) => pool,
            None => SubchannelPool::global(),
        };
        let connector = connector.unwrap_or_else(TonicConnector::shared);

        let inner = Arc::new_cyclic(|weak_self| ChannelInner {
            authority,
            resolver_options: ResolverOptions {
                min_time_between_resolutions: config.min_time_between_resolutions,
                disable_service_config: config.service_config_disable_resolution,
            },
            subchannel_settings: SubchannelSettings::from_config(&config),
            core: Mutex::new(Core::new(None, ConnectionBackoff::new(config.backoff.clone()))),
            snapshot: watch::Sender::new(ChannelSnapshot {
                state: ConnectivityState::Idle,
                picker: Arc::new(QueuePicker),
                service_config: default_service_config.clone(),
            }),
            target,
            config,
            resolvers,
            load_balancers: load_balancers.unwrap_or_default(),
            connector,
            pool,
            metrics: metrics.unwrap_or_else(default_metrics),
            default_service_config,
            serializer: Serializer::new(),
            active_calls: AtomicUsize::new(0),
            weak_self: weak_self.clone(),
        });

        let resolver = inner.create_resolver(0)?;
        inner.core.lock().resolver = Some(resolver);
        tracing::debug!(channel = %inner.target, authority = %inner.authority, "channel created");
        Ok(Self { inner })
    }
}

impl Channel {
    /// The target after default-scheme mapping.
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    /// Authority sent with calls.
    #[must_use]
    pub fn authority(&self) -> &str {
        &self.inner.authority
    }

    /// The configuration the channel was built with.
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Returns the current state. With `try_to_connect`, an IDLE channel
    /// starts connecting; the returned value is still the state observed
    /// before that.
    pub fn connectivity_state(&self, try_to_connect: bool) -> ConnectivityState {
        let state = self.inner.state();
        if try_to_connect && state == ConnectivityState::Idle {
            self.inner.submit(Event::ExitIdle);
        }
        state
    }

    /// Waits until the state differs from `current`. Returns false if the
    /// deadline passes first.
    pub async fn watch_connectivity_state(&self, current: ConnectivityState, deadline: Instant) -> bool {
        let mut snapshots = self.inner.subscribe();
        let changed = snapshots.wait_for(|snapshot| snapshot.state != current);
        matches!(tokio::time::timeout_at(deadline, changed).await, Ok(Ok(_)))
    }

    /// Connects if needed and waits for READY.
    ///
    /// # Errors
    ///
    /// Returns DEADLINE_EXCEEDED when the deadline passes first and
    /// UNAVAILABLE when the channel is closed.
    pub async fn wait_for_ready(&self, deadline: Instant) -> std::result::Result<(), Status> {
        loop {
            let state = self.connectivity_state(true);
            match state {
                ConnectivityState::Ready => return Ok(()),
                ConnectivityState::Shutdown => return Err(Status::unavailable("channel closed")),
                _ => {},
            }
            if !self.watch_connectivity_state(state, deadline).await {
                return Err(Status::deadline_exceeded(format!(
                    "channel to {} not ready before deadline (last state {state})",
                    self.inner.target
                )));
            }
        }
    }

    /// The latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ChannelSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Service config in effect.
    #[must_use]
    pub fn service_config(&self) -> Option<Arc<ServiceConfig>> {
        self.inner.snapshot.borrow().service_config.clone()
    }

    /// Method config for `path` from the service config in effect.
    #[must_use]
    pub fn method_config(&self, path: &str) -> Option<MethodConfig> {
        self.inner.snapshot.borrow().service_config.as_ref().and_then(|sc| sc.method_config(path).cloned())
    }

    /// Number of calls that have started and not finished.
    #[must_use]
    pub fn active_calls(&self) -> usize {
        self.inner.active_calls.load(Ordering::Acquire)
    }

    /// Starts a call on `path`.
    pub fn create_call(&self, path: impl Into<String>, options: CallOptions) -> Call {
        Call::new(self.clone(), path.into(), options)
    }

    /// Resets reconnect and re-resolution backoff.
    pub fn reset_backoff(&self) {
        self.inner.submit(Event::ResetBackoff);
    }

    /// Shuts the channel down. Queued and future calls fail with UNAVAILABLE.
    pub fn close(&self) {
        self.inner.submit(Event::Shutdown);
    }

    pub(crate) fn inner(&self) -> &ChannelInner {
        &self.inner
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("target", &self.inner.target.to_string())
            .field("state", &self.inner.state())
            .field("active_calls", &self.active_calls())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use serde_json::json;
    use wayfinder_test_utils::{wait_for, wait_for_state};
    use wayfinder_types::{Code, config::PickFirstConfig};

    use super::*;
    use crate::{
        error::ClientError,
        mock::{ConnectBehavior, FixedResolverFactory, MockConnector},
        transport::Disconnect,
    };

    struct Fixture {
        channel: Channel,
        connector: Arc<MockConnector>,
        resolver: Arc<FixedResolverFactory>,
    }

    fn fixture(config: ChannelConfig, addresses: Vec<Address>) -> Fixture {
        let connector = MockConnector::new();
        let resolver = FixedResolverFactory::new(addresses);
        let mut registry = ResolverRegistry::with_defaults();
        registry.register("fixed", resolver.clone());
        let channel = Channel::builder()
            .target("fixed:///backend")
            .config(config)
            .connector(connector.clone())
            .resolvers(Arc::new(registry))
            .build()
            .unwrap();
        Fixture { channel, connector, resolver }
    }

    fn backend() -> Address {
        Address::tcp("10.0.0.1", 443)
    }

    async fn ready(channel: &Channel) {
        channel.wait_for_ready(Instant::now() + Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_idle_and_connects_on_request() {
        let f = fixture(ChannelConfig::default(), vec![backend()]);
        assert_eq!(f.channel.connectivity_state(false), ConnectivityState::Idle);
        assert_eq!(f.resolver.resolutions(), 0);

        assert_eq!(f.channel.connectivity_state(true), ConnectivityState::Idle);
        ready(&f.channel).await;
        assert_eq!(f.resolver.created(), 1);
        assert_eq!(f.connector.attempts(&backend()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_tears_down_and_reconnects() {
        let config = ChannelConfig::builder().idle_timeout(Duration::from_secs(2)).build().unwrap();
        let f = fixture(config, vec![backend()]);
        ready(&f.channel).await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(f.channel.connectivity_state(false), ConnectivityState::Idle);
        assert_eq!(f.resolver.destroyed(), 1);
        assert!(f.connector.last_transport(&backend()).unwrap().is_shut_down());

        ready(&f.channel).await;
        assert_eq!(f.resolver.created(), 2);
        assert_eq!(f.connector.attempts(&backend()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_has_one_second_floor() {
        let config = ChannelConfig::builder().idle_timeout(Duration::from_millis(10)).build().unwrap();
        let f = fixture(config, vec![backend()]);
        ready(&f.channel).await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(f.channel.connectivity_state(false), ConnectivityState::Ready);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(f.channel.connectivity_state(false), ConnectivityState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_call_holds_channel_out_of_idle() {
        let config = ChannelConfig::builder().idle_timeout(Duration::from_secs(1)).build().unwrap();
        let f = fixture(config, vec![backend()]);
        ready(&f.channel).await;

        let call = f.channel.create_call("/svc/m", CallOptions::default());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.channel.connectivity_state(false), ConnectivityState::Ready);

        call.cancel();
        assert_eq!(f.channel.active_calls(), 0);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(f.channel.connectivity_state(false), ConnectivityState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolution_failure_then_recovery() {
        let f = fixture(ChannelConfig::default(), vec![backend()]);
        f.resolver.set_error(Status::unavailable("no such host"));
        f.channel.connectivity_state(true);
        assert_eq!(f.channel.connectivity_state(false), ConnectivityState::TransientFailure);

        f.resolver.set_addresses(vec![backend()]);
        // First re-resolution backoff is one second with 20% jitter.
        wait_for_state(Duration::from_secs(3), ConnectivityState::Ready, || {
            f.channel.connectivity_state(false)
        })
        .await
        .unwrap();
        assert_eq!(f.resolver.resolutions(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_backends_down_is_transient_failure() {
        let f = fixture(ChannelConfig::default(), vec![backend(), Address::tcp("10.0.0.2", 443)]);
        f.connector.set_default_behavior(ConnectBehavior::Refuse);
        f.channel.connectivity_state(true);
        wait_for_state(Duration::from_millis(100), ConnectivityState::TransientFailure, || {
            f.channel.connectivity_state(false)
        })
        .await
        .unwrap();
        let call = f.channel.create_call("/svc/m", CallOptions::default());
        let err = call.unary(bytes::Bytes::from_static(b"x")).await.unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_service_config_keeps_last_good() {
        let f = fixture(ChannelConfig::default(), vec![backend()]);
        let good = ServiceConfig::from_value(json!({
            "methodConfig": [{"name": [{"service": "svc"}], "timeout": "2s"}]
        }))
        .unwrap();
        f.resolver.set_result(ResolutionResult {
            addresses: vec![backend()],
            service_config: Some(Arc::new(good)),
            service_config_error: None,
        });
        ready(&f.channel).await;
        assert_eq!(f.channel.method_config("/svc/m").unwrap().timeout, Some(Duration::from_secs(2)));

        f.resolver.set_result(ResolutionResult {
            addresses: vec![backend()],
            service_config: None,
            service_config_error: Some(Status::unavailable("bad json")),
        });
        // Losing the connection makes the policy ask for a fresh resolution,
        // which now carries a broken config.
        f.connector
            .last_transport(&backend())
            .unwrap()
            .disconnect(Disconnect::Failed(Status::unavailable("reset")));
        let recovered = wait_for(Duration::from_secs(3), || {
            (f.resolver.resolutions() == 2
                && f.channel.connectivity_state(false) == ConnectivityState::Ready)
                .then_some(())
        })
        .await;
        assert!(recovered.is_some());
        assert_eq!(f.channel.method_config("/svc/m").unwrap().timeout, Some(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_service_config_without_fallback_fails() {
        let f = fixture(ChannelConfig::default(), vec![backend()]);
        f.resolver.set_result(ResolutionResult {
            addresses: vec![backend()],
            service_config: None,
            service_config_error: Some(Status::unavailable("bad json")),
        });
        f.channel.connectivity_state(true);
        assert_eq!(f.channel.connectivity_state(false), ConnectivityState::TransientFailure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_service_config_applies_without_resolver_config() {
        let config = ChannelConfig::builder()
            .default_service_config(r#"{"methodConfig": [{"name": [{}], "waitForReady": true}]}"#)
            .build()
            .unwrap();
        let f = fixture(config, vec![backend()]);
        // In effect before the first resolution.
        assert_eq!(f.channel.connectivity_state(false), ConnectivityState::Idle);
        assert_eq!(f.channel.method_config("/any/method").unwrap().wait_for_ready, Some(true));
        ready(&f.channel).await;
        assert_eq!(f.channel.method_config("/any/method").unwrap().wait_for_ready, Some(true));
    }

    #[tokio::test]
    async fn test_default_channels_share_connector_and_subchannels() {
        let a = Channel::builder().target("ipv4:127.0.0.1:1").build().unwrap();
        let b = Channel::builder().target("ipv4:127.0.0.1:1").build().unwrap();
        assert!(Arc::ptr_eq(&a.inner.connector, &b.inner.connector));
        assert!(Arc::ptr_eq(&a.inner.pool, &b.inner.pool));

        let address = Address::tcp("127.0.0.1", 1);
        let from_a = a.inner.pool.get_or_create(
            &address,
            &a.inner.connector,
            &a.inner.subchannel_settings,
            &a.inner.metrics,
        );
        let from_b = b.inner.pool.get_or_create(
            &address,
            &b.inner.connector,
            &b.inner.subchannel_settings,
            &b.inner.metrics,
        );
        assert_eq!(from_a.id(), from_b.id());
        from_a.unref();
        from_b.unref();
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_config_selects_shuffle() {
        let f = fixture(ChannelConfig::default(), vec![backend()]);
        let config = ServiceConfig::from_value(json!({
            "loadBalancingConfig": [{"round_robin": {}}, {"pick_first": {"shuffleAddressList": true}}]
        }))
        .unwrap();
        f.resolver.set_result(ResolutionResult {
            addresses: vec![backend()],
            service_config: Some(Arc::new(config)),
            service_config_error: None,
        });
        ready(&f.channel).await;
        let core = f.channel.inner().core.lock();
        assert_eq!(
            core.lb_config,
            Some(LoadBalancingConfig::PickFirst(PickFirstConfig { shuffle_address_list: true }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_publishes_shutdown_and_rejects_calls() {
        let f = fixture(ChannelConfig::default(), vec![backend()]);
        ready(&f.channel).await;
        f.channel.close();
        assert_eq!(f.channel.connectivity_state(true), ConnectivityState::Shutdown);
        assert_eq!(f.resolver.destroyed(), 1);

        let call = f.channel.create_call("/svc/m", CallOptions::default());
        let err = call.unary(bytes::Bytes::new()).await.unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_connectivity_state_times_out() {
        let f = fixture(ChannelConfig::default(), vec![backend()]);
        let changed = f
            .channel
            .watch_connectivity_state(ConnectivityState::Idle, Instant::now() + Duration::from_millis(50))
            .await;
        assert!(!changed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_ready_times_out_when_unreachable() {
        let f = fixture(ChannelConfig::default(), vec![backend()]);
        f.connector.set_behavior(&backend(), ConnectBehavior::Hang);
        let err = f.channel.wait_for_ready(Instant::now() + Duration::from_millis(200)).await.unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
    }

    #[test]
    fn test_bad_targets_fail_at_construction() {
        let connector: Arc<dyn Connector> = MockConnector::new();
        let err = Channel::builder().target("").connector(connector.clone()).build().unwrap_err();
        assert!(matches!(err, ClientError::InvalidTarget { .. }));

        let err = Channel::builder().target("ipv4:not-an-ip").connector(connector).build().unwrap_err();
        assert!(matches!(err, ClientError::InvalidAddress { .. }));
    }

    #[test]
    fn test_authority_defaults() {
        let connector: Arc<dyn Connector> = MockConnector::new();
        let channel = Channel::builder().target("localhost:50051").connector(connector.clone()).build().unwrap();
        assert_eq!(channel.authority(), "localhost:50051");

        let channel = Channel::builder().target("unix:///tmp/sock").connector(connector).build().unwrap();
        assert_eq!(channel.authority(), "localhost");
    }
}
