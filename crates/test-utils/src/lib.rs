//! Shared test utilities for wayfinder crates.
//!
//! - [`wait_for_state`] - wait for a channel or subchannel to reach a state
//! - [`wait_for`] - wait for a background task to produce something
//! - [`strategies`] - Proptest generators for hosts, addresses and targets

#![deny(unsafe_code)]

mod wait;
pub use wait::{wait_for, wait_for_state};

pub mod strategies;
