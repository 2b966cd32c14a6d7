//! Client-side connection management for RPC channels.
//!
//! A [`Channel`] turns a target string such as `dns:///api.example.com:443`
//! into a set of connected subchannels. It resolves names, balances load,
//! reconnects with backoff, goes idle when unused, and exposes an aggregate
//! connectivity state. [`Call`]s run on top of a channel with deadlines,
//! cancellation that propagates from parent to child, and per-method retry
//! policies from the service config.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use bytes::Bytes;
//! use wayfinder_client::{CallOptions, Channel};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let channel = Channel::builder().target("dns:///localhost:50051").build()?;
//!
//!     let call = channel.create_call("/echo.Echo/Say", CallOptions::default());
//!     let reply = call.unary(Bytes::from_static(b"hello")).await?;
//!     println!("{reply:?}");
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Channel / Call (public API)                  │
//! │  create_call │ connectivity_state │ watch │ close           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                Work serializer (one event at a time)        │
//! │  resolver results │ subchannel transitions │ idle timer     │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  Resolvers (dns, ipv4,       │  Load balancer (pick_first)  │
//! │  ipv6, unix) via registry    │  publishes state + picker    │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │                Subchannel pool (shared or per channel)      │
//! │  connect │ backoff (backon) │ connectivity watchers         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                Transport (tonic HTTP/2 or custom)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod call;
mod channel;
mod deadline;
mod error;
pub mod load_balancer;
mod metrics;
pub mod mock;
mod picker;
pub mod resolver;
mod serializer;
pub mod subchannel;
pub mod transport;

// Public API exports
pub use backoff::ConnectionBackoff;
pub use call::{Call, CallId, CallOptions, MAX_ATTEMPTS_LIMIT, PropagateFlags};
pub use channel::{Channel, ChannelSnapshot};
pub use deadline::{decode_timeout, encode_timeout};
pub use error::{ClientError, Result};
pub use load_balancer::{
    ChannelControlHelper, LoadBalancer, LoadBalancerFactory, LoadBalancerRegistry,
};
pub use metrics::{ClientMetrics, MetricsClientMetrics, NoopClientMetrics};
pub use picker::{FailPicker, PickArgs, PickFirstPicker, PickResult, Picker, QueuePicker};
pub use resolver::{
    ResolutionResult, Resolver, ResolverFactory, ResolverListener, ResolverOptions,
    ResolverRegistry,
};
pub use serializer::Serializer;
pub use subchannel::{Subchannel, SubchannelId, SubchannelPool, Subscription};
pub use transport::{Codec, Connector, JsonCodec, OutgoingRequest, Transport};

// Re-export commonly used types from wayfinder-types
pub use wayfinder_types::{
    Address, Code, ConnectivityState, Metadata, Status, Target, config::ChannelConfig,
};
