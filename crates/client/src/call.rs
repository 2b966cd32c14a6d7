//! Calls: one RPC on a channel.
//!
//! A [`Call`] picks a subchannel from the channel's current picker, sends
//! its request over that subchannel's transport and finishes exactly once
//! with a [`Status`]. Deadline expiry and cancellation are just two more ways
//! of finishing.
//!
//! Calls form a forest. A call created with a parent and
//! [`PropagateFlags::DEADLINE`] never outlives the parent's deadline; with
//! [`PropagateFlags::CANCELLATION`] it is cancelled when the parent finishes
//! with a non-OK status. Parents hold only weak references to their
//! children, and nothing a child does reaches its parent.

use std::{
    fmt,
    ops::BitOr,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::{task::AbortHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use wayfinder_types::{
    Code, ConnectivityState, Metadata, Status,
    config::{BackoffConfig, RetryPolicy, ServiceConfig},
};

use crate::{
    backoff::ConnectionBackoff,
    channel::Channel,
    picker::{PickArgs, PickResult},
    subchannel::Subchannel,
    transport::{Codec, OutgoingRequest, Transport},
};

/// Retry policies never allow more attempts than this.
pub const MAX_ATTEMPTS_LIMIT: u32 = 5;

/// Which parent attributes a child call inherits.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropagateFlags(u32);

impl PropagateFlags {
    /// Inherit nothing.
    pub const NONE: Self = Self(0);
    /// Inherit the parent's deadline.
    pub const DEADLINE: Self = Self(1);
    /// Inherit the stats context.
    pub const CENSUS_STATS_CONTEXT: Self = Self(2);
    /// Inherit the tracing context.
    pub const CENSUS_TRACING_CONTEXT: Self = Self(4);
    /// Be cancelled with the parent.
    pub const CANCELLATION: Self = Self(8);
    /// Everything.
    pub const DEFAULTS: Self = Self(0xffff);

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Builds flags from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Returns true when every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for PropagateFlags {
    fn default() -> Self {
        Self::DEFAULTS
    }
}

impl BitOr for PropagateFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for PropagateFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PropagateFlags({:#x})", self.0)
    }
}

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique call identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(u64);

impl CallId {
    fn next() -> Self {
        Self(NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default, bon::Builder)]
pub struct CallOptions {
    /// Absolute deadline.
    pub deadline: Option<Instant>,
    /// Parent call to inherit from.
    pub parent: Option<Call>,
    /// What to inherit from `parent`.
    #[builder(default)]
    pub propagate: PropagateFlags,
    /// Queue instead of failing while the channel cannot pick. Overrides the
    /// method config.
    pub wait_for_ready: Option<bool>,
    /// Request metadata.
    #[builder(default)]
    pub metadata: Metadata,
}

/// Values that depend on the channel's method config.
#[derive(Debug, Default)]
struct CallSettings {
    deadline: Option<Instant>,
    wait_for_ready: bool,
    retry_policy: Option<RetryPolicy>,
    /// Set once the config came from a picker that could route the call.
    settled: bool,
}

struct CallInner {
    id: CallId,
    channel: Channel,
    path: String,
    metadata: Metadata,
    /// Earliest of the caller's and the parent's deadline.
    requested_deadline: Option<Instant>,
    requested_wait_for_ready: Option<bool>,
    settings: Mutex<CallSettings>,
    parent: Option<Call>,
    started: Instant,
    status: Mutex<Option<Status>>,
    done: CancellationToken,
    deadline_timer: Mutex<Option<AbortHandle>>,
    children: Mutex<Vec<Weak<CallInner>>>,
}

impl CallInner {
    /// Records the final status. Only the first call has any effect.
    fn finish(&self, status: Status) -> bool {
        {
            let mut slot = self.status.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(status.clone());
        }

        if let Some(timer) = self.deadline_timer.lock().take() {
            timer.abort();
        }
        self.done.cancel();
        tracing::debug!(call = %self.id, path = %self.path, code = %status.code(), "call finished");
        self.channel.inner().metrics().record_call(&self.path, self.started.elapsed(), status.code());
        self.channel.inner().call_ended();

        if !status.is_ok() {
            let children = std::mem::take(&mut *self.children.lock());
            for child in children.iter().filter_map(Weak::upgrade) {
                child.finish(Status::cancelled(format!("parent {} finished: {}", self.id, status.code())));
            }
        }
        true
    }

    fn status(&self) -> Option<Status> {
        self.status.lock().clone()
    }

    /// The recorded status, for paths that stopped because the call finished.
    fn final_status(&self) -> Status {
        self.status().unwrap_or_else(|| Status::cancelled("call finished"))
    }
}

impl Drop for CallInner {
    fn drop(&mut self) {
        if self.status.get_mut().is_none() {
            if let Some(timer) = self.deadline_timer.get_mut().take() {
                timer.abort();
            }
            self.channel.inner().call_ended();
        }
    }
}

/// An RPC on a [`Channel`]. Cloning shares the call.
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

impl Call {
    pub(crate) fn new(channel: Channel, path: String, options: CallOptions) -> Self {
        let CallOptions { deadline, parent, propagate, wait_for_ready, metadata } = options;
        let service_config = channel.service_config();
        let now = Instant::now();

        let parent_deadline = parent
            .as_ref()
            .filter(|_| propagate.contains(PropagateFlags::DEADLINE))
            .and_then(Call::deadline);
        let deadline = [deadline, parent_deadline].into_iter().flatten().min();

        let propagates = propagate.contains(PropagateFlags::DEADLINE)
            || propagate.contains(PropagateFlags::CANCELLATION);
        let cancel_with_parent = propagate.contains(PropagateFlags::CANCELLATION);
        let parent = parent.filter(|_| propagates);

        channel.inner().call_started();
        let inner = Arc::new(CallInner {
            id: CallId::next(),
            channel,
            path,
            metadata,
            requested_deadline: deadline,
            requested_wait_for_ready: wait_for_ready,
            settings: Mutex::new(CallSettings::default()),
            parent,
            started: now,
            status: Mutex::new(None),
            done: CancellationToken::new(),
            deadline_timer: Mutex::new(None),
            children: Mutex::new(Vec::new()),
        });
        tracing::trace!(call = %inner.id, path = %inner.path, ?deadline, "call created");
        let call = Self { inner };

        // Provisional until a picker routes the call: the resolver may still
        // replace the channel's default service config.
        call.apply_method_config(service_config.as_deref(), false);
        if let Some(parent) = call.inner.parent.as_ref().filter(|_| cancel_with_parent) {
            parent.adopt(&call);
        }
        if call.inner.channel.connectivity_state(false) == ConnectivityState::Shutdown {
            call.inner.finish(Status::unavailable("channel closed"));
        }
        call
    }

    /// Applies the method config for this call's path from `service_config`.
    /// Once settled, later configs are ignored.
    fn apply_method_config(&self, service_config: Option<&ServiceConfig>, settled: bool) {
        let inner = &self.inner;
        let method_config = service_config.and_then(|config| config.method_config(&inner.path));

        let mut settings = inner.settings.lock();
        if settings.settled {
            return;
        }
        settings.settled = settled;
        settings.wait_for_ready = inner
            .requested_wait_for_ready
            .or_else(|| method_config.and_then(|mc| mc.wait_for_ready))
            .unwrap_or(false);
        settings.retry_policy = method_config
            .and_then(|mc| mc.retry_policy.clone())
            .filter(|_| inner.channel.config().enable_retries);

        // A timeout too large for the clock means no deadline at all.
        let method_deadline =
            method_config.and_then(|mc| mc.timeout).and_then(|timeout| inner.started.checked_add(timeout));
        let deadline = [inner.requested_deadline, method_deadline].into_iter().flatten().min();
        if settings.deadline != deadline {
            settings.deadline = deadline;
            self.arm_deadline_timer(deadline);
        }
    }

    /// Replaces the deadline timer. The lock is held across the spawn so a
    /// concurrent `finish` always finds the handle it must abort.
    fn arm_deadline_timer(&self, deadline: Option<Instant>) {
        let mut timer = self.inner.deadline_timer.lock();
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        // finish() records the status before it takes the timer.
        let Some(deadline) = deadline.filter(|_| !self.is_finished()) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(call = %self.inner.id, "no tokio runtime; deadline not enforced");
            return;
        };
        let call = Arc::downgrade(&self.inner);
        let task = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(call) = call.upgrade() {
                call.finish(Status::deadline_exceeded("deadline exceeded"));
            }
        });
        *timer = Some(task.abort_handle());
    }

    fn adopt(&self, child: &Call) {
        {
            let mut children = self.inner.children.lock();
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        // The parent may have finished before the child was registered.
        if let Some(status) = self.status().filter(|status| !status.is_ok()) {
            child.inner.finish(Status::cancelled(format!(
                "parent {} finished: {}",
                self.inner.id,
                status.code()
            )));
        }
    }

    /// Identity.
    #[must_use]
    pub fn id(&self) -> CallId {
        self.inner.id
    }

    /// Method path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Effective deadline.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.settings.lock().deadline
    }

    /// Whether the call queues through transient failures.
    #[must_use]
    pub fn wait_for_ready(&self) -> bool {
        self.inner.settings.lock().wait_for_ready
    }

    /// The parent, when this call propagates from one.
    #[must_use]
    pub fn parent(&self) -> Option<&Call> {
        self.inner.parent.as_ref()
    }

    /// Final status, once finished.
    #[must_use]
    pub fn status(&self) -> Option<Status> {
        self.inner.status()
    }

    /// Returns true once the call has a final status.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.status.lock().is_some()
    }

    /// Returns true while the deadline timer is armed.
    #[must_use]
    pub fn has_deadline_timer(&self) -> bool {
        self.inner.deadline_timer.lock().is_some()
    }

    /// Number of live children registered for cancellation.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.inner.children.lock().iter().filter(|weak| weak.strong_count() > 0).count()
    }

    /// Cancels the call with CANCELLED.
    pub fn cancel(&self) {
        self.cancel_with_status(Status::cancelled("cancelled on client"));
    }

    /// Finishes the call with `status`. No effect if already finished.
    pub fn cancel_with_status(&self, status: Status) {
        if self.inner.finish(status) {
            tracing::debug!(call = %self.inner.id, "call cancelled");
        }
    }

    /// Resolves once the call has finished for any reason.
    pub async fn finished(&self) {
        self.inner.done.cancelled().await;
    }

    /// Sends one request and waits for the response, retrying according to
    /// the method's retry policy. Finishes the call.
    ///
    /// # Errors
    ///
    /// Returns the call's final non-OK status: the transport's failure,
    /// DEADLINE_EXCEEDED, CANCELLED, or UNAVAILABLE when no subchannel could
    /// be picked.
    pub async fn unary(&self, payload: Bytes) -> Result<Bytes, Status> {
        let result = self.run_attempts(payload).await;
        let status = match &result {
            Ok(_) => Status::ok(),
            Err(status) => status.clone(),
        };
        self.inner.finish(status);
        match self.status() {
            Some(status) if !status.is_ok() => Err(status),
            _ => result,
        }
    }

    /// Like [`Call::unary`], encoding the request and decoding the response
    /// with `codec`.
    ///
    /// # Errors
    ///
    /// As [`Call::unary`], plus INTERNAL for codec failures.
    pub async fn unary_message<Req, Resp, C>(&self, codec: &C, request: &Req) -> Result<Resp, Status>
    where
        C: Codec<Req> + Codec<Resp>,
    {
        let payload = match Codec::<Req>::encode(codec, request) {
            Ok(payload) => payload,
            Err(status) => {
                self.inner.finish(status.clone());
                return Err(status);
            },
        };
        let response = self.unary(payload).await?;
        Codec::<Resp>::decode(codec, response)
    }

    async fn run_attempts(&self, payload: Bytes) -> Result<Bytes, Status> {
        let mut backoff: Option<ConnectionBackoff> = None;
        let mut attempt = 1;
        loop {
            let status = match self.attempt(payload.clone()).await {
                Ok(response) => return Ok(response),
                Err(status) => status,
            };
            // Read after the attempt: the first pick settles the method config.
            let Some(policy) = self.inner.settings.lock().retry_policy.clone() else {
                return Err(status);
            };
            let max_attempts = policy.max_attempts.clamp(1, MAX_ATTEMPTS_LIMIT);
            if !policy.is_retryable(status.code()) || attempt >= max_attempts || self.is_finished() {
                return Err(status);
            }
            let backoff = backoff.get_or_insert_with(|| {
                ConnectionBackoff::new(BackoffConfig {
                    initial: policy.initial_backoff,
                    multiplier: policy.backoff_multiplier.max(1.0),
                    jitter: 0.0,
                    max: policy.max_backoff.max(policy.initial_backoff),
                })
            });

            // Full jitter: uniform in [0, current backoff).
            let delay = backoff.next_delay().mul_f64(rand::rng().random::<f64>());
            tracing::debug!(
                call = %self.inner.id,
                attempt,
                code = %status.code(),
                delay_ms = delay.as_millis() as u64,
                "retrying call"
            );
            self.inner.channel.inner().metrics().record_retry(&self.inner.path, attempt + 1);
            tokio::select! {
                () = tokio::time::sleep(delay) => {},
                () = self.inner.done.cancelled() => return Err(self.inner.final_status()),
            }
            attempt += 1;
        }
    }

    async fn attempt(&self, payload: Bytes) -> Result<Bytes, Status> {
        let (subchannel, transport) = self.pick().await?;
        let timeout = match self.deadline() {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(Status::deadline_exceeded("deadline exceeded"));
                }
                Some(remaining)
            },
            None => None,
        };
        tracing::trace!(call = %self.inner.id, subchannel = %subchannel.id(), "sending request");
        let request = OutgoingRequest {
            path: self.inner.path.clone(),
            metadata: self.inner.metadata.clone(),
            timeout,
            payload,
        };
        tokio::select! {
            result = transport.send(request) => result,
            () = self.inner.done.cancelled() => Err(self.inner.final_status()),
        }
    }

    /// Waits for a picker that yields a connected subchannel.
    async fn pick(&self) -> Result<(Arc<dyn Subchannel>, Arc<dyn Transport>), Status> {
        let channel = &self.inner.channel;
        let mut snapshots = channel.inner().subscribe();
        loop {
            if let Some(status) = self.status() {
                return Err(status);
            }
            let (state, picker, service_config) = {
                let snapshot = snapshots.borrow_and_update();
                (snapshot.state, Arc::clone(&snapshot.picker), snapshot.service_config.clone())
            };
            if state == ConnectivityState::Shutdown {
                return Err(Status::unavailable("channel closed"));
            }

            let args = PickArgs { path: &self.inner.path, metadata: &self.inner.metadata };
            let result = picker.pick(args);
            // A picker that routes or fails the call was built from a
            // resolution, so the config alongside it is final.
            self.apply_method_config(service_config.as_deref(), !matches!(result, PickResult::Queue));
            match result {
                PickResult::Pick(subchannel) => match subchannel.transport() {
                    Some(transport) => return Ok((subchannel, transport)),
                    None => {
                        tracing::trace!(call = %self.inner.id, subchannel = %subchannel.id(), "picked subchannel not connected");
                    },
                },
                PickResult::Queue => {
                    if state == ConnectivityState::Idle {
                        channel.connectivity_state(true);
                    }
                },
                PickResult::Fail(status) if !self.wait_for_ready() => {
                    return Err(unavailable_or(status));
                },
                PickResult::Fail(_) => {},
            }

            tokio::select! {
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        return Err(Status::unavailable("channel closed"));
                    }
                },
                () = self.inner.done.cancelled() => return Err(self.inner.final_status()),
            }
        }
    }
}

/// Pick failures surface as UNAVAILABLE unless the picker chose a more
/// specific code.
fn unavailable_or(status: Status) -> Status {
    match status.code() {
        Code::Ok => Status::unavailable(status.details().to_owned()),
        _ => status,
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.inner.id)
            .field("path", &self.inner.path)
            .field("deadline", &self.deadline())
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use wayfinder_types::{
        Address,
        config::{ChannelConfig, MethodConfig, MethodName},
    };

    use super::*;
    use crate::{
        mock::{FixedResolverFactory, MockConnector, ResponseBehavior},
        resolver::{ResolutionResult, ResolverRegistry},
        transport::JsonCodec,
    };

    fn channel_with(connector: &Arc<MockConnector>, config: ChannelConfig) -> (Channel, Arc<FixedResolverFactory>) {
        let resolver = FixedResolverFactory::new(vec![Address::tcp("10.0.0.1", 443)]);
        let mut registry = ResolverRegistry::with_defaults();
        registry.register("fixed", resolver.clone());
        let channel = Channel::builder()
            .target("fixed:///svc")
            .config(config)
            .connector(connector.clone())
            .resolvers(Arc::new(registry))
            .build()
            .unwrap();
        (channel, resolver)
    }

    fn channel(connector: &Arc<MockConnector>) -> Channel {
        channel_with(connector, ChannelConfig::default()).0
    }

    fn with_service_config(connector: &Arc<MockConnector>, config: serde_json::Value) -> Channel {
        let (channel, resolver) = channel_with(connector, ChannelConfig::default());
        resolver.set_result(ResolutionResult {
            addresses: vec![Address::tcp("10.0.0.1", 443)],
            service_config: Some(Arc::new(wayfinder_types::config::ServiceConfig::from_value(config).unwrap())),
            service_config_error: None,
        });
        channel
    }

    #[test]
    fn test_propagate_flags() {
        let flags = PropagateFlags::DEADLINE | PropagateFlags::CANCELLATION;
        assert_eq!(flags.bits(), 9);
        assert!(flags.contains(PropagateFlags::DEADLINE));
        assert!(!flags.contains(PropagateFlags::CENSUS_STATS_CONTEXT));
        assert!(PropagateFlags::DEFAULTS.contains(flags));
        assert_eq!(PropagateFlags::default(), PropagateFlags::DEFAULTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unary_echoes_on_ready_channel() {
        let connector = MockConnector::new();
        let channel = channel(&connector);
        let call = channel.create_call("/echo.Echo/Say", CallOptions::default());
        let reply = call.unary(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(&reply[..], b"hello");
        assert!(call.status().unwrap().is_ok());
        assert_eq!(channel.active_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_against_unresponsive_peer() {
        let connector = MockConnector::new();
        connector.set_response(ResponseBehavior::Hang);
        let channel = channel(&connector);

        let start = Instant::now();
        let call = channel.create_call(
            "/svc/slow",
            CallOptions::builder().deadline(start + Duration::from_millis(100)).build(),
        );
        assert!(call.has_deadline_timer());
        let err = call.unary(Bytes::new()).await.unwrap_err();

        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert!(start.elapsed() < Duration::from_millis(150));
        assert!(!call.has_deadline_timer());
        // A second finish is a no-op.
        call.cancel();
        assert_eq!(call.status().unwrap().code(), Code::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_carries_remaining_timeout() {
        let connector = MockConnector::new();
        let channel = channel(&connector);
        let deadline = Instant::now() + Duration::from_secs(10);
        let call = channel.create_call("/svc/m", CallOptions::builder().deadline(deadline).build());
        call.unary(Bytes::new()).await.unwrap();

        let sent = connector.last_transport(&Address::tcp("10.0.0.1", 443)).unwrap().requests();
        let timeout = sent[0].timeout.unwrap();
        assert!(timeout <= Duration::from_secs(10) && timeout > Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_parent_cancels_child() {
        let connector = MockConnector::new();
        let channel = channel(&connector);
        let parent = channel.create_call("/svc/parent", CallOptions::default());
        let child = channel.create_call(
            "/svc/child",
            CallOptions::builder().parent(parent.clone()).propagate(PropagateFlags::CANCELLATION).build(),
        );
        let grandchild = channel.create_call(
            "/svc/grandchild",
            CallOptions::builder().parent(child.clone()).build(),
        );
        assert_eq!(parent.child_count(), 1);

        parent.cancel();
        assert_eq!(child.status().unwrap().code(), Code::Cancelled);
        assert_eq!(grandchild.status().unwrap().code(), Code::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_child_leaves_parent_and_siblings() {
        let connector = MockConnector::new();
        let channel = channel(&connector);
        let parent = channel.create_call("/svc/parent", CallOptions::default());
        let child = channel.create_call("/svc/a", CallOptions::builder().parent(parent.clone()).build());
        let sibling = channel.create_call("/svc/b", CallOptions::builder().parent(parent.clone()).build());

        child.cancel();
        assert!(!parent.is_finished());
        assert!(!sibling.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_without_cancellation_flag_survives_parent() {
        let connector = MockConnector::new();
        let channel = channel(&connector);
        let parent = channel.create_call("/svc/parent", CallOptions::default());
        let child = channel.create_call(
            "/svc/child",
            CallOptions::builder().parent(parent.clone()).propagate(PropagateFlags::DEADLINE).build(),
        );
        parent.cancel();
        assert!(!child.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_of_finished_parent_is_cancelled_immediately() {
        let connector = MockConnector::new();
        let channel = channel(&connector);
        let parent = channel.create_call("/svc/parent", CallOptions::default());
        parent.cancel();
        let child = channel.create_call("/svc/child", CallOptions::builder().parent(parent).build());
        assert_eq!(child.status().unwrap().code(), Code::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_inherits_earlier_parent_deadline() {
        let connector = MockConnector::new();
        let channel = channel(&connector);
        let now = Instant::now();
        let parent = channel.create_call(
            "/svc/parent",
            CallOptions::builder().deadline(now + Duration::from_secs(1)).build(),
        );
        let child = channel.create_call(
            "/svc/child",
            CallOptions::builder()
                .parent(parent.clone())
                .deadline(now + Duration::from_secs(5))
                .build(),
        );
        assert_eq!(child.deadline(), Some(now + Duration::from_secs(1)));

        let opted_out = channel.create_call(
            "/svc/child",
            CallOptions::builder()
                .parent(parent)
                .propagate(PropagateFlags::CANCELLATION)
                .deadline(now + Duration::from_secs(5))
                .build(),
        );
        assert_eq!(opted_out.deadline(), Some(now + Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_method_timeout_applies() {
        let connector = MockConnector::new();
        connector.set_response(ResponseBehavior::Hang);
        let channel = with_service_config(
            &connector,
            json!({"methodConfig": [{"name": [{"service": "svc"}], "timeout": "0.5s"}]}),
        );
        channel.wait_for_ready(Instant::now() + Duration::from_secs(1)).await.unwrap();

        let call = channel.create_call("/svc/m", CallOptions::default());
        assert!(call.deadline().is_some());
        let err = call.unary(Bytes::new()).await.unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_on_retryable_code() {
        let connector = MockConnector::new();
        let channel = with_service_config(
            &connector,
            json!({"methodConfig": [{
                "name": [{"service": "svc"}],
                "retryPolicy": {
                    "maxAttempts": 3,
                    "initialBackoff": "0.1s",
                    "maxBackoff": "1s",
                    "backoffMultiplier": 2,
                    "retryableStatusCodes": ["UNAVAILABLE"]
                }
            }]}),
        );
        connector.enqueue_response(ResponseBehavior::Fail(Status::unavailable("busy")));
        connector.enqueue_response(ResponseBehavior::Fail(Status::unavailable("busy")));

        let call = channel.create_call("/svc/m", CallOptions::default());
        let reply = call.unary(Bytes::from_static(b"ok")).await.unwrap();
        assert_eq!(&reply[..], b"ok");
        assert_eq!(connector.total_requests(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_code_fails_immediately() {
        let connector = MockConnector::new();
        let channel = with_service_config(
            &connector,
            json!({"methodConfig": [{
                "name": [{"service": "svc"}],
                "retryPolicy": {
                    "maxAttempts": 3,
                    "initialBackoff": "0.1s",
                    "maxBackoff": "1s",
                    "backoffMultiplier": 2,
                    "retryableStatusCodes": ["UNAVAILABLE"]
                }
            }]}),
        );
        connector.enqueue_response(ResponseBehavior::Fail(Status::new(Code::PermissionDenied, "no")));

        let call = channel.create_call("/svc/m", CallOptions::default());
        let err = call.unary(Bytes::new()).await.unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
        assert_eq!(connector.total_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_ready_call_survives_transient_failure() {
        let connector = MockConnector::new();
        let address = Address::tcp("10.0.0.1", 443);
        connector.set_behavior(&address, crate::mock::ConnectBehavior::Refuse);
        let channel = channel(&connector);

        let call = channel.create_call("/svc/m", CallOptions::builder().wait_for_ready(true).build());
        let pending = tokio::spawn({
            let call = call.clone();
            async move { call.unary(Bytes::from_static(b"late")).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(channel.connectivity_state(false), ConnectivityState::TransientFailure);
        assert!(!call.is_finished());

        connector.set_behavior(&address, crate::mock::ConnectBehavior::Accept);
        let reply = pending.await.unwrap().unwrap();
        assert_eq!(&reply[..], b"late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unary_message_with_json_codec() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Ping {
            seq: u32,
        }

        let connector = MockConnector::new();
        let channel = channel(&connector);
        let call = channel.create_call("/svc/ping", CallOptions::default());
        let pong: Ping = call.unary_message(&JsonCodec, &Ping { seq: 7 }).await.unwrap();
        assert_eq!(pong, Ping { seq: 7 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_unfinished_call_releases_channel() {
        let connector = MockConnector::new();
        let channel = channel(&connector);
        let call = channel.create_call("/svc/m", CallOptions::default());
        assert_eq!(channel.active_calls(), 1);
        drop(call);
        assert_eq!(channel.active_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolver_timeout_applies_to_call_made_before_resolution() {
        let connector = MockConnector::new();
        connector.set_response(ResponseBehavior::Hang);
        let channel = with_service_config(
            &connector,
            json!({"methodConfig": [{"name": [{"service": "svc"}], "timeout": "0.5s"}]}),
        );
        assert_eq!(channel.connectivity_state(false), ConnectivityState::Idle);

        let start = Instant::now();
        let call = channel.create_call("/svc/m", CallOptions::default());
        assert_eq!(call.deadline(), None);
        let err = call.unary(Bytes::new()).await.unwrap_err();

        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert_eq!(call.deadline(), Some(start + Duration::from_millis(500)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_service_config_governs_first_call() {
        let connector = MockConnector::new();
        connector.set_response(ResponseBehavior::Hang);
        let config = ChannelConfig::builder()
            .default_service_config(r#"{"methodConfig": [{"name": [{}], "timeout": "2s"}]}"#)
            .build()
            .unwrap();
        let (channel, _resolver) = channel_with(&connector, config);

        let start = Instant::now();
        let call = channel.create_call("/svc/m", CallOptions::default());
        assert_eq!(call.deadline(), Some(start + Duration::from_secs(2)));
        assert!(call.has_deadline_timer());
        let err = call.unary(Bytes::new()).await.unwrap_err();

        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert!(start.elapsed() >= Duration::from_secs(2) && start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_config_replaces_default_for_queued_call() {
        let connector = MockConnector::new();
        connector.set_response(ResponseBehavior::Hang);
        let config = ChannelConfig::builder()
            .default_service_config(r#"{"methodConfig": [{"name": [{}], "timeout": "2s"}]}"#)
            .build()
            .unwrap();
        let (channel, resolver) = channel_with(&connector, config);
        resolver.set_result(ResolutionResult {
            addresses: vec![Address::tcp("10.0.0.1", 443)],
            service_config: Some(Arc::new(
                ServiceConfig::from_value(json!({"methodConfig": [{"name": [{}], "timeout": "0.5s"}]})).unwrap(),
            )),
            service_config_error: None,
        });

        let start = Instant::now();
        let call = channel.create_call("/svc/m", CallOptions::default());
        let err = call.unary(Bytes::new()).await.unwrap_err();

        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert_eq!(call.deadline(), Some(start + Duration::from_millis(500)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_beyond_clock_range_means_no_method_deadline() {
        let connector = MockConnector::new();
        let channel = channel(&connector);
        let huge = ServiceConfig {
            method_config: vec![MethodConfig {
                names: vec![MethodName::default()],
                timeout: Some(Duration::MAX),
                wait_for_ready: None,
                retry_policy: None,
            }],
            ..ServiceConfig::default()
        };

        let call = channel.create_call("/svc/m", CallOptions::default());
        call.apply_method_config(Some(&huge), true);
        assert_eq!(call.deadline(), None);
        assert!(!call.has_deadline_timer());
        call.unary(Bytes::from_static(b"ok")).await.unwrap();

        // The caller's own deadline still holds.
        let deadline = Instant::now() + Duration::from_secs(5);
        let call = channel.create_call("/svc/m", CallOptions::builder().deadline(deadline).build());
        call.apply_method_config(Some(&huge), true);
        assert_eq!(call.deadline(), Some(deadline));
    }

    #[tokio::test(start_paused = true)]
    async fn test_largest_service_config_timeout_is_usable() {
        let connector = MockConnector::new();
        let channel = with_service_config(
            &connector,
            json!({"methodConfig": [{"name": [{}], "timeout": "315576000000s"}]}),
        );
        let call = channel.create_call("/svc/m", CallOptions::default());
        let reply = call.unary(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(&reply[..], b"hi");
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_call_disarms_deadline_timer() {
        let connector = MockConnector::new();
        let channel = channel(&connector);
        let call = channel
            .create_call("/svc/m", CallOptions::builder().deadline(Instant::now() + Duration::from_secs(10)).build());
        assert!(call.has_deadline_timer());

        call.unary(Bytes::new()).await.unwrap();
        assert!(call.status().unwrap().is_ok());
        assert!(!call.has_deadline_timer());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_call_does_not_rearm_deadline_timer() {
        let connector = MockConnector::new();
        let channel = channel(&connector);
        let call = channel.create_call("/svc/m", CallOptions::default());
        call.cancel();

        call.arm_deadline_timer(Some(Instant::now() + Duration::from_secs(1)));
        assert!(!call.has_deadline_timer());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(call.status().unwrap().code(), Code::Cancelled);
    }
}
