//! Pick-first: connect to addresses in order and send everything to the
//! first one that becomes READY.
//!
//! Once a subchannel is picked the remaining children are released; the pick
//! is kept across address updates until a child of the new list becomes
//! READY or the pick itself stops being READY. When every child of the
//! current list has failed the policy enters sticky TRANSIENT_FAILURE and
//! stays there, whatever the children do, until one becomes READY.

use std::sync::Arc;

use rand::seq::SliceRandom;
use wayfinder_types::{
    Address, ConnectivityState, Status,
    config::{LoadBalancingConfig, PICK_FIRST, PickFirstConfig},
};

use super::{ChannelControlHelper, LoadBalancer, LoadBalancerFactory};
use crate::{
    picker::{FailPicker, PickFirstPicker, Picker, QueuePicker},
    subchannel::{Subchannel, SubchannelId, Subscription},
};

/// Returns a uniformly shuffled copy of `items`.
#[must_use]
pub fn shuffled<T: Clone>(items: &[T]) -> Vec<T> {
    let mut out = items.to_vec();
    out.shuffle(&mut rand::rng());
    out
}

struct Child {
    subchannel: Arc<dyn Subchannel>,
    _watch: Subscription,
    has_failed: bool,
}

impl Child {
    fn id(&self) -> SubchannelId {
        self.subchannel.id()
    }
}

/// The pick-first policy.
#[derive(Default)]
pub struct PickFirst {
    children: Vec<Child>,
    current_pick: Option<Child>,
    /// Index of the child currently being connected.
    current_index: usize,
    sticky_failure: bool,
    latest_addresses: Vec<Address>,
    last_reported: Option<(ConnectivityState, Option<SubchannelId>)>,
    destroyed: bool,
}

impl PickFirst {
    /// Creates an idle policy with no addresses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn release(child: Child, helper: &mut dyn ChannelControlHelper) {
        let Child { subchannel, _watch: watch, .. } = child;
        drop(watch);
        helper.remove_channelz_child(subchannel.id());
        subchannel.unref();
    }

    fn reset_children(&mut self, helper: &mut dyn ChannelControlHelper) {
        for child in self.children.drain(..) {
            Self::release(child, helper);
        }
        self.current_index = 0;
    }

    fn remove_current_pick(&mut self, helper: &mut dyn ChannelControlHelper) {
        if let Some(pick) = self.current_pick.take() {
            Self::release(pick, helper);
        }
    }

    /// Makes child `index` the pick, releasing the previous pick and every
    /// other child.
    fn pick_child(&mut self, index: usize, helper: &mut dyn ChannelControlHelper) {
        let child = self.children.remove(index);
        tracing::debug!(
            subchannel = %child.id(),
            address = %child.subchannel.address(),
            "pick_first picked subchannel"
        );
        self.sticky_failure = false;
        self.remove_current_pick(helper);
        self.current_pick = Some(child);
        self.reset_children(helper);
    }

    /// Requests a connection on the first child at or after `start` that has
    /// not failed.
    fn connect_from(&mut self, start: usize) {
        for (index, child) in self.children.iter().enumerate().skip(start) {
            match child.subchannel.state() {
                ConnectivityState::Idle if !child.has_failed => {
                    self.current_index = index;
                    child.subchannel.request_connection();
                    return;
                },
                ConnectivityState::Connecting if !child.has_failed => {
                    self.current_index = index;
                    return;
                },
                _ => {},
            }
        }
        self.current_index = self.children.len();
    }

    fn maybe_enter_sticky_failure(&mut self, helper: &mut dyn ChannelControlHelper) {
        if self.children.is_empty() || !self.children.iter().all(|child| child.has_failed) {
            return;
        }
        if !self.sticky_failure {
            tracing::debug!(children = self.children.len(), "pick_first entering transient failure");
        }
        self.sticky_failure = true;
        // Every child failed once: that closes a cycle. The next cycle
        // starts with clean flags and asks for addresses again when it ends.
        helper.request_reresolution();
        for child in &mut self.children {
            child.has_failed = false;
            // Children reconnect on their own after backoff. Nudge idle ones.
            if child.subchannel.state() == ConnectivityState::Idle {
                child.subchannel.request_connection();
            }
        }
    }

    fn report(&mut self, helper: &mut dyn ChannelControlHelper) {
        if self.destroyed {
            return;
        }
        let (state, picker): (ConnectivityState, Arc<dyn Picker>) = if let Some(pick) = &self.current_pick {
            (ConnectivityState::Ready, Arc::new(PickFirstPicker::new(Arc::clone(&pick.subchannel))))
        } else if self.latest_addresses.is_empty() {
            (
                ConnectivityState::TransientFailure,
                Arc::new(FailPicker::new(Status::unavailable("resolver returned an empty address list"))),
            )
        } else if self.children.is_empty() {
            (ConnectivityState::Idle, Arc::new(QueuePicker))
        } else if self.sticky_failure {
            (
                ConnectivityState::TransientFailure,
                Arc::new(FailPicker::new(Status::unavailable(format!(
                    "failed to connect to all {} addresses",
                    self.children.len()
                )))),
            )
        } else {
            (ConnectivityState::Connecting, Arc::new(QueuePicker))
        };

        let key = (state, self.current_pick.as_ref().map(Child::id));
        if self.last_reported == Some(key) {
            return;
        }
        self.last_reported = Some(key);
        helper.update_state(state, picker);
    }

    fn connect_to_address_list(&mut self, addresses: &[Address], helper: &mut dyn ChannelControlHelper) {
        // New children take their references before the old ones are
        // released, so a subchannel present in both lists stays connected.
        let mut children = Vec::with_capacity(addresses.len());
        for address in addresses {
            let subchannel = helper.create_subchannel(address);
            let watch = helper.watch_subchannel(&subchannel);
            helper.add_channelz_child(subchannel.id());
            let has_failed = subchannel.state() == ConnectivityState::TransientFailure;
            children.push(Child { subchannel, _watch: watch, has_failed });
        }
        self.reset_children(helper);
        self.children = children;

        if let Some(index) = self
            .children
            .iter()
            .position(|child| child.subchannel.state() == ConnectivityState::Ready)
        {
            self.pick_child(index, helper);
            return;
        }
        self.connect_from(0);
        self.maybe_enter_sticky_failure(helper);
    }

    fn child_index(&self, id: SubchannelId) -> Option<usize> {
        self.children.iter().position(|child| child.id() == id)
    }
}

impl LoadBalancer for PickFirst {
    fn update_address_list(
        &mut self,
        addresses: Vec<Address>,
        config: &LoadBalancingConfig,
        helper: &mut dyn ChannelControlHelper,
    ) {
        if self.destroyed {
            return;
        }
        let config = config.as_pick_first().cloned().unwrap_or_else(PickFirstConfig::default);
        let addresses = if config.shuffle_address_list { shuffled(&addresses) } else { addresses };
        tracing::debug!(addresses = addresses.len(), shuffle = config.shuffle_address_list, "pick_first address update");

        self.latest_addresses = addresses.clone();
        if addresses.is_empty() {
            self.reset_children(helper);
            self.remove_current_pick(helper);
            helper.request_reresolution();
        } else {
            self.connect_to_address_list(&addresses, helper);
        }
        self.report(helper);
    }

    fn subchannel_state_changed(
        &mut self,
        subchannel: SubchannelId,
        previous: ConnectivityState,
        next: ConnectivityState,
        helper: &mut dyn ChannelControlHelper,
    ) {
        if self.destroyed {
            return;
        }
        tracing::trace!(%subchannel, from = %previous, to = %next, "pick_first child state");

        if self.current_pick.as_ref().is_some_and(|pick| pick.id() == subchannel) {
            if next != ConnectivityState::Ready {
                tracing::debug!(%subchannel, to = %next, "pick_first lost its pick");
                self.remove_current_pick(helper);
                helper.request_reresolution();
                self.report(helper);
            }
            return;
        }

        let Some(index) = self.child_index(subchannel) else { return };
        match next {
            ConnectivityState::Ready => {
                self.pick_child(index, helper);
            },
            ConnectivityState::TransientFailure | ConnectivityState::Shutdown => {
                self.children[index].has_failed = true;
                if index == self.current_index {
                    self.connect_from(index + 1);
                }
                self.maybe_enter_sticky_failure(helper);
            },
            ConnectivityState::Idle => {
                if self.sticky_failure || index == self.current_index {
                    self.children[index].subchannel.request_connection();
                }
            },
            ConnectivityState::Connecting => {},
        }
        self.report(helper);
    }

    fn exit_idle(&mut self, helper: &mut dyn ChannelControlHelper) {
        if self.destroyed || self.current_pick.is_some() {
            return;
        }
        if self.children.is_empty() {
            if self.latest_addresses.is_empty() {
                return;
            }
            let addresses = self.latest_addresses.clone();
            self.connect_to_address_list(&addresses, helper);
        } else if let Some(child) = self.children.get(self.current_index) {
            child.subchannel.request_connection();
        }
        self.report(helper);
    }

    fn reset_backoff(&mut self) {
        for child in self.children.iter().chain(self.current_pick.as_ref()) {
            child.subchannel.reset_backoff();
        }
    }

    fn destroy(&mut self, helper: &mut dyn ChannelControlHelper) {
        self.reset_children(helper);
        self.remove_current_pick(helper);
        self.destroyed = true;
    }

    fn policy_name(&self) -> &str {
        PICK_FIRST
    }
}

impl std::fmt::Debug for PickFirst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PickFirst")
            .field("children", &self.children.len())
            .field("current_pick", &self.current_pick.as_ref().map(Child::id))
            .field("sticky_failure", &self.sticky_failure)
            .finish_non_exhaustive()
    }
}

/// Builds [`PickFirst`] instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct PickFirstFactory;

impl LoadBalancerFactory for PickFirstFactory {
    fn build(&self) -> Box<dyn LoadBalancer> {
        Box::new(PickFirst::new())
    }
}
