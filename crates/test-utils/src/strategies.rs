//! Proptest strategies for wayfinder value types.
//!
//! Reusable generators for property-based testing across crates. Strategies
//! produce well-formed hosts, addresses and targets while exploring edge
//! cases through random variation.
//!
//! # Usage
//!
//! ```no_run
//! use wayfinder_test_utils::strategies;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn my_property(address in strategies::arb_tcp_address()) {
//!         // test invariant with a randomly generated address
//!     }
//! }
//! ```

use std::net::{Ipv4Addr, Ipv6Addr};

use proptest::prelude::*;
use wayfinder_types::Address;

/// Generates a DNS hostname of one to three labels, e.g. `a1.b-c.example`.
pub fn arb_hostname() -> impl Strategy<Value = String> {
    proptest::collection::vec("[a-z]([a-z0-9-]{0,14}[a-z0-9])?", 1..=3).prop_map(|l| l.join("."))
}

/// Generates any TCP port, including 0 and 65535.
pub fn arb_port() -> impl Strategy<Value = u16> {
    any::<u16>()
}

/// Generates an IPv4 literal.
pub fn arb_ipv4() -> impl Strategy<Value = Ipv4Addr> {
    any::<[u8; 4]>().prop_map(Ipv4Addr::from)
}

/// Generates an IPv6 literal.
pub fn arb_ipv6() -> impl Strategy<Value = Ipv6Addr> {
    any::<[u16; 8]>().prop_map(Ipv6Addr::from)
}

/// Generates a TCP address whose host is a hostname, an IPv4 literal or an
/// IPv6 literal.
pub fn arb_tcp_address() -> impl Strategy<Value = Address> {
    let host = prop_oneof![
        arb_hostname(),
        arb_ipv4().prop_map(|ip| ip.to_string()),
        arb_ipv6().prop_map(|ip| ip.to_string()),
    ];
    (host, arb_port()).prop_map(|(host, port)| Address::tcp(host, port))
}

/// Generates a Unix domain socket address, relative or absolute.
pub fn arb_unix_address() -> impl Strategy<Value = Address> {
    ("/?[a-z]{1,8}(/[a-z0-9_.]{1,8}){0,3}").prop_map(Address::unix)
}

/// Generates an address of either kind.
pub fn arb_address() -> impl Strategy<Value = Address> {
    prop_oneof![4 => arb_tcp_address(), 1 => arb_unix_address()]
}

/// Generates a list of 1-10 addresses that may contain repeats.
pub fn arb_address_list() -> impl Strategy<Value = Vec<Address>> {
    proptest::collection::vec(arb_address(), 1..=10)
}

/// Generates a `dns:///host[:port]` target string.
pub fn arb_dns_target() -> impl Strategy<Value = String> {
    (arb_hostname(), proptest::option::of(arb_port())).prop_map(|(host, port)| match port {
        Some(port) => format!("dns:///{host}:{port}"),
        None => format!("dns:///{host}"),
    })
}
