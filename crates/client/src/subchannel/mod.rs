//! Per-address connectivity.
//!
//! A subchannel owns at most one transport to a single [`Address`] and walks
//! the connectivity state machine:
//!
//! ```text
//!            request_connection
//!   IDLE ─────────────────────▶ CONNECTING ──────▶ READY
//!    ▲                            │    ▲             │  │
//!    │                    failure │    │ backoff     │  │ transport died
//!    │                            ▼    │             │  ▼
//!    │                       TRANSIENT_FAILURE ◀─────┼──┘
//!    └───────────────────────────────────────────────┘
//!                     transport idle / closed cleanly
//!
//!   any state ──unref to zero──▶ SHUTDOWN (terminal)
//! ```
//!
//! Every transition is delivered to all subscribed listeners as
//! `(id, previous, next)`, in transition order, with no internal lock held.

mod pool;

use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::{sync::Notify, task::AbortHandle};
use wayfinder_types::{Address, ConnectivityState, Status};

pub use self::pool::{SubchannelPool, SubchannelSettings};
use crate::{
    backoff::ConnectionBackoff,
    metrics::ClientMetrics,
    serializer::Serializer,
    transport::{Connector, Disconnect, Transport},
};

static NEXT_SUBCHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique subchannel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubchannelId(u64);

impl SubchannelId {
    /// Allocates a fresh identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_SUBCHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubchannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subchannel-{}", self.0)
    }
}

/// Callback invoked with `(subchannel, previous, next)` on every transition.
pub type StateListener =
    Arc<dyn Fn(SubchannelId, ConnectivityState, ConnectivityState) + Send + Sync>;

#[derive(Default)]
struct ListenerSet {
    next_token: u64,
    listeners: Vec<(u64, StateListener)>,
}

/// An ordered set of [`StateListener`]s.
#[derive(Clone, Default)]
pub struct StateListeners {
    set: Arc<Mutex<ListenerSet>>,
}

impl StateListeners {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener. It stays registered until the returned
    /// [`Subscription`] is dropped.
    pub fn subscribe(&self, listener: StateListener) -> Subscription {
        let mut set = self.set.lock();
        let token = set.next_token;
        set.next_token += 1;
        set.listeners.push((token, listener));
        Subscription { set: Arc::downgrade(&self.set), token }
    }

    /// Calls every listener registered at the time of the call, in
    /// registration order.
    pub fn notify(&self, id: SubchannelId, previous: ConnectivityState, next: ConnectivityState) {
        let listeners: Vec<StateListener> =
            self.set.lock().listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            listener(id, previous, next);
        }
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.set.lock().listeners.len()
    }

    /// Returns true when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for StateListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateListeners").field("len", &self.len()).finish()
    }
}

/// Keeps a listener registered. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes its listener"]
pub struct Subscription {
    set: Weak<Mutex<ListenerSet>>,
    token: u64,
}

impl Subscription {
    /// A subscription bound to nothing.
    pub fn detached() -> Self {
        Self { set: Weak::new(), token: 0 }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(set) = self.set.upgrade() {
            set.lock().listeners.retain(|(token, _)| *token != self.token);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("token", &self.token)
            .field("live", &(self.set.strong_count() > 0))
            .finish()
    }
}

/// The view of a subchannel that load balancers and calls use.
pub trait Subchannel: Send + Sync + fmt::Debug {
    /// Identity, stable for the subchannel's lifetime.
    fn id(&self) -> SubchannelId;

    /// The address this subchannel connects to.
    fn address(&self) -> &Address;

    /// Current connectivity state.
    fn state(&self) -> ConnectivityState;

    /// Registers a transition listener.
    fn subscribe(&self, listener: StateListener) -> Subscription;

    /// Starts connecting if IDLE. No effect in any other state.
    fn request_connection(&self);

    /// Takes a reference.
    fn add_ref(&self);

    /// Drops a reference. Reaching zero shuts the subchannel down.
    fn unref(&self);

    /// The live transport, when READY.
    fn transport(&self) -> Option<Arc<dyn Transport>>;

    /// Rewinds the reconnect backoff and cuts a pending backoff wait short.
    fn reset_backoff(&self);
}

struct Inner {
    state: ConnectivityState,
    transport: Option<Arc<dyn Transport>>,
    backoff: ConnectionBackoff,
    task: Option<AbortHandle>,
}

/// A subchannel that connects through a [`Connector`].
pub struct TransportSubchannel {
    id: SubchannelId,
    address: Address,
    connector: Arc<dyn Connector>,
    settings: SubchannelSettings,
    metrics: Arc<dyn ClientMetrics>,
    inner: Mutex<Inner>,
    listeners: StateListeners,
    notifications: Serializer<(ConnectivityState, ConnectivityState)>,
    refs: AtomicUsize,
    backoff_wake: Arc<Notify>,
    weak_self: Weak<TransportSubchannel>,
}

impl TransportSubchannel {
    /// Creates an IDLE subchannel with no references.
    pub fn new(
        address: Address,
        connector: Arc<dyn Connector>,
        settings: SubchannelSettings,
        metrics: Arc<dyn ClientMetrics>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            id: SubchannelId::next(),
            address,
            connector,
            inner: Mutex::new(Inner {
                state: ConnectivityState::Idle,
                transport: None,
                backoff: ConnectionBackoff::new(settings.backoff.clone()),
                task: None,
            }),
            settings,
            metrics,
            listeners: StateListeners::new(),
            notifications: Serializer::new(),
            refs: AtomicUsize::new(0),
            backoff_wake: Arc::new(Notify::new()),
            weak_self: weak_self.clone(),
        })
    }

    /// The settings this subchannel was created with.
    #[must_use]
    pub fn settings(&self) -> &SubchannelSettings {
        &self.settings
    }

    /// Current reference count.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Moves to `next` when the current state is one of `from`, applying
    /// `update` under the same lock. Returns whether the transition happened.
    fn transition(
        &self,
        from: &[ConnectivityState],
        next: ConnectivityState,
        update: impl FnOnce(&mut Inner),
    ) -> bool {
        self.transition_if(|state| from.contains(&state), next, update)
    }

    /// Like [`Self::transition`], with an arbitrary check of the current
    /// state made under the lock.
    fn transition_if(
        &self,
        allowed: impl FnOnce(ConnectivityState) -> bool,
        next: ConnectivityState,
        update: impl FnOnce(&mut Inner),
    ) -> bool {
        let drain = {
            let mut inner = self.inner.lock();
            if !allowed(inner.state) {
                return false;
            }
            let previous = std::mem::replace(&mut inner.state, next);
            update(&mut inner);
            tracing::debug!(
                subchannel = %self.id,
                address = %self.address,
                from = %previous,
                to = %next,
                "subchannel state change"
            );
            self.metrics.record_subchannel_transition(
                &self.address.to_string(),
                previous,
                next,
            );
            // Queued under the state lock so notifications keep transition order.
            self.notifications.push((previous, next))
        };
        if drain {
            while let Some((previous, next)) = self.notifications.next() {
                self.listeners.notify(self.id, previous, next);
            }
        }
        true
    }

    fn spawn_connect_loop(&self) -> Option<AbortHandle> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                subchannel = %self.id,
                address = %self.address,
                "no tokio runtime; connection attempt not started"
            );
            return None;
        };
        Some(runtime.spawn(connect_loop(self.weak_self.clone())).abort_handle())
    }

    fn on_connected(&self, transport: &Arc<dyn Transport>) -> bool {
        self.transition(&[ConnectivityState::Connecting], ConnectivityState::Ready, |inner| {
            inner.transport = Some(Arc::clone(transport));
            inner.backoff.reset();
        })
    }

    /// Enters TRANSIENT_FAILURE and returns how long to back off.
    fn on_failure(&self, status: &Status) -> Option<std::time::Duration> {
        let mut delay = None;
        let moved = self.transition(
            &[ConnectivityState::Connecting, ConnectivityState::Ready],
            ConnectivityState::TransientFailure,
            |inner| {
                inner.transport = None;
                delay = Some(inner.backoff.next_delay());
            },
        );
        if moved {
            tracing::debug!(
                subchannel = %self.id,
                address = %self.address,
                error = %status,
                backoff_ms = delay.map(|d| d.as_millis() as u64),
                "connection failed"
            );
        }
        delay
    }

    /// Takes a reference unless the subchannel is shut down. Serialized with
    /// the shutdown that follows the last `unref`, so a subchannel handed out
    /// this way is never shut down under its new owner.
    pub(crate) fn try_add_ref(&self) -> bool {
        let inner = self.inner.lock();
        if inner.state == ConnectivityState::Shutdown {
            return false;
        }
        self.refs.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Shuts down if nobody took a reference since the count reached zero.
    fn shutdown(&self) {
        let mut task = None;
        let mut transport = None;
        self.transition_if(
            |state| state != ConnectivityState::Shutdown && self.ref_count() == 0,
            ConnectivityState::Shutdown,
            |inner| {
                task = inner.task.take();
                transport = inner.transport.take();
            },
        );
        if let Some(task) = task {
            task.abort();
        }
        if let Some(transport) = transport {
            transport.shutdown();
        }
    }
}

impl Subchannel for TransportSubchannel {
    fn id(&self) -> SubchannelId {
        self.id
    }

    fn address(&self) -> &Address {
        &self.address
    }

    fn state(&self) -> ConnectivityState {
        self.inner.lock().state
    }

    fn subscribe(&self, listener: StateListener) -> Subscription {
        self.listeners.subscribe(listener)
    }

    fn request_connection(&self) {
        self.transition(&[ConnectivityState::Idle], ConnectivityState::Connecting, |inner| {
            inner.task = self.spawn_connect_loop();
        });
    }

    fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    fn unref(&self) {
        match self.refs.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1)) {
            Ok(1) => self.shutdown(),
            Ok(_) => {},
            Err(_) => {
                tracing::warn!(subchannel = %self.id, "unref on a subchannel with no references");
            },
        }
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        let inner = self.inner.lock();
        match inner.state {
            ConnectivityState::Ready => inner.transport.clone(),
            _ => None,
        }
    }

    fn reset_backoff(&self) {
        let mut inner = self.inner.lock();
        inner.backoff.reset();
        if inner.state == ConnectivityState::TransientFailure {
            self.backoff_wake.notify_one();
        }
    }
}

impl fmt::Debug for TransportSubchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSubchannel")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state())
            .field("refs", &self.ref_count())
            .finish_non_exhaustive()
    }
}

impl Drop for TransportSubchannel {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        if let Some(transport) = inner.transport.take() {
            transport.shutdown();
        }
    }
}

/// Connect, wait out the connection, back off, repeat. The loop holds only a
/// weak reference so that dropping the subchannel ends it.
async fn connect_loop(weak: Weak<TransportSubchannel>) {
    loop {
        let Some(failure) = attempt(&weak).await else { return };
        let Some((delay, wake)) = weak
            .upgrade()
            .and_then(|this| this.on_failure(&failure).map(|d| (d, Arc::clone(&this.backoff_wake))))
        else {
            return;
        };

        tokio::select! {
            () = tokio::time::sleep(delay) => {},
            () = wake.notified() => {},
        }

        let Some(this) = weak.upgrade() else { return };
        if !this.transition(
            &[ConnectivityState::TransientFailure],
            ConnectivityState::Connecting,
            |_| {},
        ) {
            return;
        }
    }
}

/// Runs one connection attempt and, when it succeeds, waits for the
/// transport to go away. Returns the failure that should trigger backoff, or
/// `None` when the loop should stop.
async fn attempt(weak: &Weak<TransportSubchannel>) -> Option<Status> {
    let (connector, address, timeout) = {
        let this = weak.upgrade()?;
        (Arc::clone(&this.connector), this.address.clone(), this.settings.connect_timeout)
    };

    let connected = tokio::time::timeout(timeout, connector.connect(&address))
        .await
        .unwrap_or_else(|_| {
            Err(Status::unavailable(format!("connection to {address} timed out after {timeout:?}")))
        });
    let transport = match connected {
        Ok(transport) => transport,
        Err(status) => return Some(status),
    };

    let Some(this) = weak.upgrade() else {
        transport.shutdown();
        return None;
    };
    if !this.on_connected(&transport) {
        transport.shutdown();
        return None;
    }
    let closed = transport.closed();
    drop(this);

    match closed.await {
        Disconnect::Idle => {
            let this = weak.upgrade()?;
            this.transition(&[ConnectivityState::Ready], ConnectivityState::Idle, |inner| {
                if inner.transport.as_ref().is_some_and(|t| Arc::ptr_eq(t, &transport)) {
                    inner.transport = None;
                }
            });
            None
        },
        Disconnect::Failed(status) => Some(status),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use wayfinder_test_utils::{wait_for, wait_for_state};
    use wayfinder_types::config::BackoffConfig;

    use super::*;
    use crate::{
        metrics::default_metrics,
        mock::{ConnectBehavior, MockConnector},
    };

    type Seen = Arc<Mutex<Vec<(ConnectivityState, ConnectivityState)>>>;

    fn settings() -> SubchannelSettings {
        SubchannelSettings {
            connect_timeout: Duration::from_secs(5),
            backoff: BackoffConfig {
                initial: Duration::from_secs(1),
                multiplier: 2.0,
                jitter: 0.0,
                max: Duration::from_secs(10),
            },
        }
    }

    fn record(subchannel: &TransportSubchannel) -> (Seen, Subscription) {
        let seen: Seen = Arc::default();
        let sink = Arc::clone(&seen);
        let subscription = subchannel.subscribe(Arc::new(move |_, prev, next| {
            sink.lock().push((prev, next));
        }));
        (seen, subscription)
    }

    fn subchannel(connector: &Arc<MockConnector>, address: &Address) -> Arc<TransportSubchannel> {
        TransportSubchannel::new(address.clone(), connector.clone(), settings(), default_metrics())
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(SubchannelId::next(), SubchannelId::next());
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let listeners = StateListeners::new();
        let subscription = listeners.subscribe(Arc::new(|_, _, _| {}));
        assert_eq!(listeners.len(), 1);
        drop(subscription);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_listeners_notified_in_registration_order() {
        let listeners = StateListeners::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let subs: Vec<_> = (0..3)
            .map(|i| {
                let order = Arc::clone(&order);
                listeners.subscribe(Arc::new(move |_, _, _| order.lock().push(i)))
            })
            .collect();
        listeners.notify(SubchannelId::next(), ConnectivityState::Idle, ConnectivityState::Connecting);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        drop(subs);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_to_ready() {
        let connector = MockConnector::new();
        let address = Address::tcp("10.0.0.1", 443);
        let sc = subchannel(&connector, &address);
        let (seen, _sub) = record(&sc);

        sc.request_connection();
        wait_for_state(Duration::from_secs(1), ConnectivityState::Ready, || {
            sc.state()
        })
        .await
        .unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                (ConnectivityState::Idle, ConnectivityState::Connecting),
                (ConnectivityState::Connecting, ConnectivityState::Ready),
            ]
        );
        assert!(sc.transport().is_some());
        assert_eq!(connector.attempts(&address), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_connection_is_noop_unless_idle() {
        let connector = MockConnector::new();
        let address = Address::tcp("10.0.0.1", 443);
        connector.set_behavior(&address, ConnectBehavior::Hang);
        let sc = subchannel(&connector, &address);

        sc.request_connection();
        sc.request_connection();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sc.state(), ConnectivityState::Connecting);
        assert_eq!(connector.attempts(&address), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_backs_off_then_retries() {
        let connector = MockConnector::new();
        let address = Address::tcp("10.0.0.2", 443);
        connector.set_behavior(&address, ConnectBehavior::Refuse);
        let sc = subchannel(&connector, &address);
        let (seen, _sub) = record(&sc);

        sc.request_connection();
        wait_for_state(Duration::from_millis(100), ConnectivityState::TransientFailure, || {
            sc.state()
        })
        .await
        .unwrap();
        assert_eq!(connector.attempts(&address), 1);

        // First backoff is one second.
        connector.set_behavior(&address, ConnectBehavior::Accept);
        wait_for_state(Duration::from_secs(2), ConnectivityState::Ready, || {
            sc.state()
        })
        .await
        .unwrap();
        assert_eq!(connector.attempts(&address), 2);
        assert_eq!(
            *seen.lock(),
            vec![
                (ConnectivityState::Idle, ConnectivityState::Connecting),
                (ConnectivityState::Connecting, ConnectivityState::TransientFailure),
                (ConnectivityState::TransientFailure, ConnectivityState::Connecting),
                (ConnectivityState::Connecting, ConnectivityState::Ready),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_counts_as_failure() {
        let connector = MockConnector::new();
        let address = Address::tcp("10.0.0.3", 443);
        connector.set_behavior(&address, ConnectBehavior::Hang);
        let sc = subchannel(&connector, &address);

        sc.request_connection();
        wait_for_state(Duration::from_secs(6), ConnectivityState::TransientFailure, || {
            sc.state()
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_close_returns_to_idle() {
        let connector = MockConnector::new();
        let address = Address::tcp("10.0.0.4", 443);
        let sc = subchannel(&connector, &address);
        let (seen, _sub) = record(&sc);

        sc.request_connection();
        let transport =
            wait_for(Duration::from_secs(1), || connector.last_transport(&address)).await.unwrap();
        wait_for_state(Duration::from_secs(1), ConnectivityState::Ready, || {
            sc.state()
        })
        .await
        .unwrap();

        transport.disconnect(Disconnect::Idle);
        wait_for_state(Duration::from_secs(1), ConnectivityState::Idle, || {
            sc.state()
        })
        .await
        .unwrap();
        assert!(sc.transport().is_none());
        assert_eq!(seen.lock().last(), Some(&(ConnectivityState::Ready, ConnectivityState::Idle)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_death_enters_transient_failure() {
        let connector = MockConnector::new();
        let address = Address::tcp("10.0.0.5", 443);
        let sc = subchannel(&connector, &address);

        sc.request_connection();
        let transport =
            wait_for(Duration::from_secs(1), || connector.last_transport(&address)).await.unwrap();
        wait_for_state(Duration::from_secs(1), ConnectivityState::Ready, || {
            sc.state()
        })
        .await
        .unwrap();

        transport.disconnect(Disconnect::Failed(Status::unavailable("reset by peer")));
        wait_for_state(Duration::from_millis(100), ConnectivityState::TransientFailure, || {
            sc.state()
        })
        .await
        .unwrap();
        // Reconnects after backoff.
        wait_for_state(Duration::from_secs(2), ConnectivityState::Ready, || {
            sc.state()
        })
        .await
        .unwrap();
        assert_eq!(connector.attempts(&address), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_backoff_cuts_wait_short() {
        let connector = MockConnector::new();
        let address = Address::tcp("10.0.0.6", 443);
        connector.set_behavior(&address, ConnectBehavior::Refuse);
        let sc = TransportSubchannel::new(
            address.clone(),
            connector.clone(),
            SubchannelSettings {
                backoff: BackoffConfig {
                    initial: Duration::from_secs(100),
                    max: Duration::from_secs(100),
                    jitter: 0.0,
                    multiplier: 1.0,
                },
                ..settings()
            },
            default_metrics(),
        );

        sc.request_connection();
        wait_for_state(Duration::from_millis(100), ConnectivityState::TransientFailure, || {
            sc.state()
        })
        .await
        .unwrap();
        connector.set_behavior(&address, ConnectBehavior::Accept);
        sc.reset_backoff();
        wait_for_state(Duration::from_secs(1), ConnectivityState::Ready, || {
            sc.state()
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unref_to_zero_shuts_down() {
        let connector = MockConnector::new();
        let address = Address::tcp("10.0.0.7", 443);
        let sc = subchannel(&connector, &address);
        let (seen, _sub) = record(&sc);

        sc.add_ref();
        sc.add_ref();
        sc.request_connection();
        let transport =
            wait_for(Duration::from_secs(1), || connector.last_transport(&address)).await.unwrap();

        sc.unref();
        assert_ne!(sc.state(), ConnectivityState::Shutdown);
        sc.unref();
        assert_eq!(sc.state(), ConnectivityState::Shutdown);
        assert_eq!(seen.lock().last().map(|(_, next)| *next), Some(ConnectivityState::Shutdown));
        assert!(transport.is_shut_down());

        // Terminal: nothing moves it again.
        sc.request_connection();
        assert_eq!(sc.state(), ConnectivityState::Shutdown);
    }

    #[test]
    fn test_unref_below_zero_is_ignored() {
        let connector = MockConnector::new();
        let sc = subchannel(&connector, &Address::tcp("10.0.0.8", 443));
        sc.unref();
        assert_eq!(sc.ref_count(), 0);
        assert_eq!(sc.state(), ConnectivityState::Idle);
    }

    #[test]
    fn test_reference_taken_before_deferred_shutdown_keeps_subchannel() {
        let connector = MockConnector::new();
        let sc = subchannel(&connector, &Address::tcp("10.0.0.9", 443));
        sc.add_ref();

        // The last owner's count reaches zero, then a new owner takes the
        // subchannel before the shutdown half of `unref` runs.
        sc.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(sc.try_add_ref());
        sc.shutdown();
        assert_eq!(sc.state(), ConnectivityState::Idle);
        assert_eq!(sc.ref_count(), 1);

        sc.unref();
        assert_eq!(sc.state(), ConnectivityState::Shutdown);
        assert!(!sc.try_add_ref());
        assert_eq!(sc.ref_count(), 0);
    }
}
