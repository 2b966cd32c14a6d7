//! Pickers: immutable per-call routing decisions.
//!
//! A load balancer publishes a new picker with every state change. Calls
//! consult the latest one; a picker is never mutated after publication.

use std::{fmt, sync::Arc};

use wayfinder_types::{Metadata, Status};

use crate::subchannel::Subchannel;

/// What a pick sees of the call.
#[derive(Debug, Clone, Copy)]
pub struct PickArgs<'a> {
    /// Method path, `/service/method`.
    pub path: &'a str,
    /// Call metadata.
    pub metadata: &'a Metadata,
}

/// Outcome of a pick.
#[derive(Clone)]
pub enum PickResult {
    /// Send the call on this subchannel.
    Pick(Arc<dyn Subchannel>),
    /// Wait for the next picker.
    Queue,
    /// Fail the call, unless it is wait-for-ready.
    Fail(Status),
}

impl fmt::Debug for PickResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pick(subchannel) => f.debug_tuple("Pick").field(&subchannel.id()).finish(),
            Self::Queue => f.write_str("Queue"),
            Self::Fail(status) => f.debug_tuple("Fail").field(status).finish(),
        }
    }
}

/// A routing decision function.
pub trait Picker: Send + Sync + fmt::Debug {
    /// Chooses where a call goes.
    fn pick(&self, args: PickArgs<'_>) -> PickResult;
}

/// Queues every call. Published while connecting.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueuePicker;

impl Picker for QueuePicker {
    fn pick(&self, _args: PickArgs<'_>) -> PickResult {
        PickResult::Queue
    }
}

/// Fails every call with a fixed status.
#[derive(Debug, Clone)]
pub struct FailPicker {
    status: Status,
}

impl FailPicker {
    /// Creates a picker failing with `status`.
    #[must_use]
    pub fn new(status: Status) -> Self {
        Self { status }
    }

    /// The status calls fail with.
    #[must_use]
    pub fn status(&self) -> &Status {
        &self.status
    }
}

impl Picker for FailPicker {
    fn pick(&self, _args: PickArgs<'_>) -> PickResult {
        PickResult::Fail(self.status.clone())
    }
}

/// Sends every call to one subchannel.
#[derive(Debug, Clone)]
pub struct PickFirstPicker {
    subchannel: Arc<dyn Subchannel>,
}

impl PickFirstPicker {
    /// Creates a picker bound to `subchannel`.
    #[must_use]
    pub fn new(subchannel: Arc<dyn Subchannel>) -> Self {
        Self { subchannel }
    }

    /// The picked subchannel.
    #[must_use]
    pub fn subchannel(&self) -> &Arc<dyn Subchannel> {
        &self.subchannel
    }
}

impl Picker for PickFirstPicker {
    fn pick(&self, args: PickArgs<'_>) -> PickResult {
        tracing::trace!(path = args.path, subchannel = %self.subchannel.id(), "picked");
        PickResult::Pick(Arc::clone(&self.subchannel))
    }
}
