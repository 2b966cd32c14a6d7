//! Controllable collaborators for testing channels and policies without a
//! network.
//!
//! # Contents
//!
//! - [`MockSubchannel`]: a subchannel whose state is set by the test.
//! - [`MockControlHelper`] and [`LbHarness`]: drive a [`LoadBalancer`]
//!   directly and record what it publishes.
//! - [`MockConnector`] / [`MockTransport`]: per-address connect outcomes and
//!   scripted responses, with attempt and request counting.
//! - [`FixedResolverFactory`]: a resolver that hands out whatever the test
//!   configured.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use wayfinder_client::{
//!     Channel, ResolverRegistry,
//!     mock::{FixedResolverFactory, MockConnector},
//! };
//! use wayfinder_types::{Address, config::ChannelConfig};
//!
//! # fn example() -> wayfinder_client::Result<()> {
//! let connector = MockConnector::new();
//! let resolver = FixedResolverFactory::new(vec![Address::tcp("10.0.0.1", 443)]);
//! let mut registry = ResolverRegistry::with_defaults();
//! registry.register("fixed", resolver.clone());
//!
//! let channel = Channel::builder()
//!     .target("fixed:///backend")
//!     .config(ChannelConfig::default())
//!     .connector(connector)
//!     .resolvers(Arc::new(registry))
//!     .build()?;
//! # drop(channel);
//! # Ok(())
//! # }
//! ```

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use tokio::sync::watch;
use wayfinder_types::{Address, ConnectivityState, Status, Target, config::LoadBalancingConfig};

use crate::{
    error::Result,
    load_balancer::{ChannelControlHelper, LoadBalancer},
    picker::Picker,
    resolver::{ResolutionResult, Resolver, ResolverFactory, ResolverListener, ResolverOptions},
    subchannel::{StateListener, StateListeners, Subchannel, SubchannelId, Subscription},
    transport::{Connector, Disconnect, OutgoingRequest, Transport},
};

// ============================================================================
// Subchannel
// ============================================================================

/// A subchannel whose connectivity is driven by the test.
///
/// `request_connection` only counts; it never changes the state.
pub struct MockSubchannel {
    id: SubchannelId,
    address: Address,
    state: Mutex<ConnectivityState>,
    listeners: StateListeners,
    refs: AtomicUsize,
    connection_requests: AtomicUsize,
    backoff_resets: AtomicUsize,
    transport: Mutex<Option<Arc<dyn Transport>>>,
}

impl MockSubchannel {
    /// An IDLE subchannel.
    #[must_use]
    pub fn new(address: Address) -> Arc<Self> {
        Self::with_state(address, ConnectivityState::Idle)
    }

    /// A subchannel starting in `state`.
    #[must_use]
    pub fn with_state(address: Address, state: ConnectivityState) -> Arc<Self> {
        Arc::new(Self {
            id: SubchannelId::next(),
            address,
            state: Mutex::new(state),
            listeners: StateListeners::new(),
            refs: AtomicUsize::new(0),
            connection_requests: AtomicUsize::new(0),
            backoff_resets: AtomicUsize::new(0),
            transport: Mutex::new(None),
        })
    }

    /// Moves to `next` and notifies listeners. Setting the current state
    /// again does nothing.
    pub fn set_state(&self, next: ConnectivityState) {
        let previous = std::mem::replace(&mut *self.state.lock(), next);
        if previous != next {
            self.listeners.notify(self.id, previous, next);
        }
    }

    /// Sets the transport returned while READY.
    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.lock() = Some(transport);
    }

    /// Number of `request_connection` calls.
    #[must_use]
    pub fn connection_requests(&self) -> usize {
        self.connection_requests.load(Ordering::SeqCst)
    }

    /// Number of `reset_backoff` calls.
    #[must_use]
    pub fn backoff_resets(&self) -> usize {
        self.backoff_resets.load(Ordering::SeqCst)
    }

    /// Current reference count.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }
}

impl Subchannel for MockSubchannel {
    fn id(&self) -> SubchannelId {
        self.id
    }

    fn address(&self) -> &Address {
        &self.address
    }

    fn state(&self) -> ConnectivityState {
        *self.state.lock()
    }

    fn subscribe(&self, listener: StateListener) -> Subscription {
        self.listeners.subscribe(listener)
    }

    fn request_connection(&self) {
        self.connection_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    fn unref(&self) {
        let _ = self.refs.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        match self.state() {
            ConnectivityState::Ready => self.transport.lock().clone(),
            _ => None,
        }
    }

    fn reset_backoff(&self) {
        self.backoff_resets.fetch_add(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for MockSubchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockSubchannel")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Control helper
// ============================================================================

type StateEvent = (SubchannelId, ConnectivityState, ConnectivityState);

/// Records everything a load balancer asks of its channel.
///
/// Subchannels it creates are [`MockSubchannel`]s starting in the state set
/// by [`MockControlHelper::set_initial_state`]. Watched transitions are
/// queued rather than delivered, so the test decides when the policy sees
/// them (see [`LbHarness::drain`]).
pub struct MockControlHelper {
    initial_state: ConnectivityState,
    subchannels: Vec<Arc<MockSubchannel>>,
    events: Arc<Mutex<VecDeque<StateEvent>>>,
    states: Vec<ConnectivityState>,
    pickers: Vec<Arc<dyn Picker>>,
    reresolution_requests: usize,
    channelz_children: HashSet<SubchannelId>,
}

impl Default for MockControlHelper {
    fn default() -> Self {
        Self::new()
    }
}

impl MockControlHelper {
    /// A helper creating IDLE subchannels.
    #[must_use]
    pub fn new() -> Self {
        Self {
            initial_state: ConnectivityState::Idle,
            subchannels: Vec::new(),
            events: Arc::default(),
            states: Vec::new(),
            pickers: Vec::new(),
            reresolution_requests: 0,
            channelz_children: HashSet::new(),
        }
    }

    /// State of subchannels created from now on.
    pub fn set_initial_state(&mut self, state: ConnectivityState) {
        self.initial_state = state;
    }

    /// The `index`-th subchannel created, in creation order, or `None`
    /// when fewer were created.
    #[must_use]
    pub fn subchannel(&self, index: usize) -> Option<Arc<MockSubchannel>> {
        self.subchannels.get(index).cloned()
    }

    /// Number of subchannels created.
    #[must_use]
    pub fn created(&self) -> usize {
        self.subchannels.len()
    }

    /// Every published state, in order.
    #[must_use]
    pub fn states(&self) -> Vec<ConnectivityState> {
        self.states.clone()
    }

    /// The most recently published picker.
    #[must_use]
    pub fn last_picker(&self) -> Option<Arc<dyn Picker>> {
        self.pickers.last().cloned()
    }

    /// Number of re-resolution requests.
    #[must_use]
    pub fn reresolution_requests(&self) -> usize {
        self.reresolution_requests
    }

    /// Subchannels currently registered for introspection.
    #[must_use]
    pub fn channelz_children(&self) -> &HashSet<SubchannelId> {
        &self.channelz_children
    }

    /// Takes the oldest undelivered transition.
    pub fn pop_event(&self) -> Option<StateEvent> {
        self.events.lock().pop_front()
    }
}

impl ChannelControlHelper for MockControlHelper {
    fn create_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        let subchannel = MockSubchannel::with_state(address.clone(), self.initial_state);
        subchannel.add_ref();
        self.subchannels.push(Arc::clone(&subchannel));
        subchannel
    }

    fn watch_subchannel(&mut self, subchannel: &Arc<dyn Subchannel>) -> Subscription {
        let events = Arc::clone(&self.events);
        subchannel.subscribe(Arc::new(move |id, previous, next| {
            events.lock().push_back((id, previous, next));
        }))
    }

    fn update_state(&mut self, state: ConnectivityState, picker: Arc<dyn Picker>) {
        self.states.push(state);
        self.pickers.push(picker);
    }

    fn request_reresolution(&mut self) {
        self.reresolution_requests += 1;
    }

    fn add_channelz_child(&mut self, child: SubchannelId) {
        self.channelz_children.insert(child);
    }

    fn remove_channelz_child(&mut self, child: SubchannelId) {
        self.channelz_children.remove(&child);
    }
}

impl fmt::Debug for MockControlHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockControlHelper")
            .field("created", &self.subchannels.len())
            .field("states", &self.states)
            .field("reresolution_requests", &self.reresolution_requests)
            .finish_non_exhaustive()
    }
}

/// A load balancer wired to a [`MockControlHelper`].
#[derive(Debug)]
pub struct LbHarness {
    /// The policy under test.
    pub lb: Box<dyn LoadBalancer>,
    /// The helper it talks to.
    pub helper: MockControlHelper,
}

impl LbHarness {
    /// Wraps `lb`.
    #[must_use]
    pub fn new(lb: Box<dyn LoadBalancer>) -> Self {
        Self { lb, helper: MockControlHelper::new() }
    }

    /// Delivers an address list, then any transitions it caused.
    pub fn update(&mut self, addresses: Vec<Address>, config: &LoadBalancingConfig) {
        self.lb.update_address_list(addresses, config, &mut self.helper);
        self.drain();
    }

    /// Delivers queued subchannel transitions one at a time.
    pub fn drain(&mut self) {
        while let Some((id, previous, next)) = self.helper.pop_event() {
            self.lb.subchannel_state_changed(id, previous, next, &mut self.helper);
        }
    }

    /// Calls [`LoadBalancer::exit_idle`].
    pub fn exit_idle(&mut self) {
        self.lb.exit_idle(&mut self.helper);
        self.drain();
    }

    /// Calls [`LoadBalancer::destroy`].
    pub fn destroy(&mut self) {
        self.lb.destroy(&mut self.helper);
    }
}

// ============================================================================
// Connector and transport
// ============================================================================

/// How [`MockConnector::connect`] treats an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectBehavior {
    /// Connect immediately.
    #[default]
    Accept,
    /// Fail immediately with UNAVAILABLE.
    Refuse,
    /// Never complete.
    Hang,
}

/// How a [`MockTransport`] answers a request.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBehavior {
    /// Return the request payload.
    Echo,
    /// Fail with the status.
    Fail(Status),
    /// Never answer.
    Hang,
    /// Echo after a delay.
    Delay(Duration),
}

#[derive(Debug)]
struct ResponseScript {
    default: Mutex<ResponseBehavior>,
    queued: Mutex<VecDeque<ResponseBehavior>>,
}

impl ResponseScript {
    fn next(&self) -> ResponseBehavior {
        match self.queued.lock().pop_front() {
            Some(behavior) => behavior,
            None => self.default.lock().clone(),
        }
    }
}

/// A connector with per-address outcomes.
#[derive(Debug)]
pub struct MockConnector {
    default_behavior: Mutex<ConnectBehavior>,
    behaviors: Mutex<HashMap<Address, ConnectBehavior>>,
    attempts: Mutex<HashMap<Address, usize>>,
    transports: Mutex<HashMap<Address, Vec<Arc<MockTransport>>>>,
    responses: Arc<ResponseScript>,
}

impl MockConnector {
    /// A connector accepting every address, whose transports echo.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            default_behavior: Mutex::new(ConnectBehavior::Accept),
            behaviors: Mutex::default(),
            attempts: Mutex::default(),
            transports: Mutex::default(),
            responses: Arc::new(ResponseScript {
                default: Mutex::new(ResponseBehavior::Echo),
                queued: Mutex::default(),
            }),
        })
    }

    /// Sets the outcome for `address`.
    pub fn set_behavior(&self, address: &Address, behavior: ConnectBehavior) {
        self.behaviors.lock().insert(address.clone(), behavior);
    }

    /// Sets the outcome for addresses without their own behavior.
    pub fn set_default_behavior(&self, behavior: ConnectBehavior) {
        *self.default_behavior.lock() = behavior;
    }

    /// Sets how every transport answers once queued responses run out.
    pub fn set_response(&self, behavior: ResponseBehavior) {
        *self.responses.default.lock() = behavior;
    }

    /// Queues a one-shot answer for the next request on any transport.
    pub fn enqueue_response(&self, behavior: ResponseBehavior) {
        self.responses.queued.lock().push_back(behavior);
    }

    /// Connection attempts made to `address`.
    #[must_use]
    pub fn attempts(&self, address: &Address) -> usize {
        self.attempts.lock().get(address).copied().unwrap_or(0)
    }

    /// Connection attempts across all addresses.
    #[must_use]
    pub fn total_attempts(&self) -> usize {
        self.attempts.lock().values().sum()
    }

    /// The most recent transport opened to `address`.
    #[must_use]
    pub fn last_transport(&self, address: &Address) -> Option<Arc<MockTransport>> {
        self.transports.lock().get(address).and_then(|list| list.last().cloned())
    }

    /// Every transport opened to `address`.
    #[must_use]
    pub fn transports(&self, address: &Address) -> Vec<Arc<MockTransport>> {
        self.transports.lock().get(address).cloned().unwrap_or_default()
    }

    /// Requests sent over all transports.
    #[must_use]
    pub fn total_requests(&self) -> usize {
        self.transports.lock().values().flatten().map(|t| t.requests().len()).sum()
    }
}

impl Connector for MockConnector {
    fn connect(&self, address: &Address) -> BoxFuture<'static, std::result::Result<Arc<dyn Transport>, Status>> {
        *self.attempts.lock().entry(address.clone()).or_insert(0) += 1;
        let behavior =
            self.behaviors.lock().get(address).copied().unwrap_or(*self.default_behavior.lock());
        match behavior {
            ConnectBehavior::Accept => {
                let transport = Arc::new(MockTransport::new(address.clone(), Arc::clone(&self.responses)));
                self.transports.lock().entry(address.clone()).or_default().push(Arc::clone(&transport));
                let transport: Arc<dyn Transport> = transport;
                futures::future::ready(Ok(transport)).boxed()
            },
            ConnectBehavior::Refuse => {
                let status = Status::unavailable(format!("connection refused: {address}"));
                futures::future::ready(Err(status)).boxed()
            },
            ConnectBehavior::Hang => futures::future::pending().boxed(),
        }
    }
}

/// A transport that answers from its connector's response script.
pub struct MockTransport {
    address: Address,
    responses: Arc<ResponseScript>,
    requests: Mutex<Vec<OutgoingRequest>>,
    closed: watch::Sender<Option<Disconnect>>,
    shut_down: AtomicBool,
}

impl MockTransport {
    fn new(address: Address, responses: Arc<ResponseScript>) -> Self {
        Self {
            address,
            responses,
            requests: Mutex::default(),
            closed: watch::Sender::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// The address this transport is connected to.
    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Ends the connection with `reason`.
    pub fn disconnect(&self, reason: Disconnect) {
        self.closed.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    /// Returns true once [`Transport::shutdown`] was called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<OutgoingRequest> {
        self.requests.lock().clone()
    }
}

impl Transport for MockTransport {
    fn send(&self, request: OutgoingRequest) -> BoxFuture<'static, std::result::Result<Bytes, Status>> {
        if self.is_shut_down() || self.closed.borrow().is_some() {
            return futures::future::ready(Err(Status::unavailable("transport closed"))).boxed();
        }
        let payload = request.payload.clone();
        self.requests.lock().push(request);
        match self.responses.next() {
            ResponseBehavior::Echo => futures::future::ready(Ok(payload)).boxed(),
            ResponseBehavior::Fail(status) => futures::future::ready(Err(status)).boxed(),
            ResponseBehavior::Hang => futures::future::pending().boxed(),
            ResponseBehavior::Delay(delay) => async move {
                tokio::time::sleep(delay).await;
                Ok(payload)
            }
            .boxed(),
        }
    }

    fn closed(&self) -> BoxFuture<'static, Disconnect> {
        let mut receiver = self.closed.subscribe();
        async move {
            match receiver.wait_for(Option::is_some).await {
                Ok(reason) => reason.clone().unwrap_or(Disconnect::Idle),
                Err(_) => Disconnect::Failed(Status::unavailable("transport dropped")),
            }
        }
        .boxed()
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.disconnect(Disconnect::Idle);
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("address", &self.address)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Resolver
// ============================================================================

#[derive(Debug)]
struct FixedState {
    outcome: std::result::Result<ResolutionResult, Status>,
    created: usize,
    resolutions: usize,
    destroyed: usize,
}

/// Resolver factory that delivers a configured outcome synchronously on
/// every `update_resolution`.
#[derive(Debug, Clone)]
pub struct FixedResolverFactory {
    state: Arc<Mutex<FixedState>>,
}

impl FixedResolverFactory {
    /// A factory resolving to `addresses`.
    #[must_use]
    pub fn new(addresses: Vec<Address>) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(FixedState {
                outcome: Ok(ResolutionResult::from_addresses(addresses)),
                created: 0,
                resolutions: 0,
                destroyed: 0,
            })),
        })
    }

    /// Resolves to `addresses` from now on.
    pub fn set_addresses(&self, addresses: Vec<Address>) {
        self.state.lock().outcome = Ok(ResolutionResult::from_addresses(addresses));
    }

    /// Resolves to `result` from now on.
    pub fn set_result(&self, result: ResolutionResult) {
        self.state.lock().outcome = Ok(result);
    }

    /// Fails with `status` from now on.
    pub fn set_error(&self, status: Status) {
        self.state.lock().outcome = Err(status);
    }

    /// Resolvers created.
    #[must_use]
    pub fn created(&self) -> usize {
        self.state.lock().created
    }

    /// `update_resolution` calls on live resolvers.
    #[must_use]
    pub fn resolutions(&self) -> usize {
        self.state.lock().resolutions
    }

    /// Resolvers destroyed.
    #[must_use]
    pub fn destroyed(&self) -> usize {
        self.state.lock().destroyed
    }
}

impl ResolverFactory for FixedResolverFactory {
    fn create(
        &self,
        _target: &Target,
        listener: Arc<dyn ResolverListener>,
        _options: &ResolverOptions,
    ) -> Result<Box<dyn Resolver>> {
        self.state.lock().created += 1;
        Ok(Box::new(FixedResolver { state: Arc::clone(&self.state), listener, destroyed: false }))
    }
}

/// Resolver created by [`FixedResolverFactory`].
pub struct FixedResolver {
    state: Arc<Mutex<FixedState>>,
    listener: Arc<dyn ResolverListener>,
    destroyed: bool,
}

impl Resolver for FixedResolver {
    fn update_resolution(&mut self) {
        if self.destroyed {
            return;
        }
        let outcome = {
            let mut state = self.state.lock();
            state.resolutions += 1;
            state.outcome.clone()
        };
        match outcome {
            Ok(result) => self.listener.on_successful_resolution(result),
            Err(status) => self.listener.on_error(status),
        }
    }

    fn destroy(&mut self) {
        if !std::mem::replace(&mut self.destroyed, true) {
            self.state.lock().destroyed += 1;
        }
    }
}

impl Drop for FixedResolver {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for FixedResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedResolver").field("destroyed", &self.destroyed).finish_non_exhaustive()
    }
}
