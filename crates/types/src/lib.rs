//! Core types and configuration for the wayfinder RPC client.
//!
//! This crate provides the plain data shared by every layer of the client:
//! - Endpoint addresses and `scheme:[//authority/]path` targets
//! - Connectivity states and their transition graph
//! - RPC status codes and call metadata
//! - Channel, load-balancing and service configuration
//! - Error types using snafu

#![deny(unsafe_code)]

pub mod address;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod metadata;
pub mod status;
pub mod target;

// Re-export commonly used types at crate root
pub use address::{Address, DEFAULT_PORT, HostPort};
pub use connectivity::ConnectivityState;
pub use error::{AddressError, MetadataError, TargetError};
pub use metadata::{Metadata, MetadataValue};
pub use status::{Code, Status};
pub use target::Target;
