//! Literal IP-list targets: `ipv4:10.0.0.1,10.0.0.2:8080`,
//! `ipv6:[::1]:8080,::2`.

use std::{net::IpAddr, sync::Arc};

use snafu::ResultExt;
use wayfinder_types::{
    Address, AddressError, DEFAULT_PORT, HostPort, Target, error::NotAnIpLiteralSnafu,
};

use super::{ResolutionResult, Resolver, ResolverFactory, ResolverListener, ResolverOptions};
use crate::error::{InvalidAddressSnafu, Result};

/// Address family accepted by an [`IpResolver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    /// IPv4 literals.
    V4,
    /// IPv6 literals.
    V6,
}

impl IpFamily {
    fn name(self) -> &'static str {
        match self {
            Self::V4 => "ipv4",
            Self::V6 => "ipv6",
        }
    }

    fn matches(self, ip: IpAddr) -> bool {
        match self {
            Self::V4 => ip.is_ipv4(),
            Self::V6 => ip.is_ipv6(),
        }
    }
}

/// Parses a comma-separated list of IP literals with optional ports.
fn parse_list(family: IpFamily, path: &str) -> std::result::Result<Vec<Address>, AddressError> {
    path.split(',')
        .map(|entry| -> std::result::Result<Address, AddressError> {
            let host_port = HostPort::parse(entry)?;
            let is_family = host_port.host.parse::<IpAddr>().is_ok_and(|ip| family.matches(ip));
            if !is_family {
                return NotAnIpLiteralSnafu { input: entry, family: family.name() }.fail();
            }
            Ok(host_port.into_address(DEFAULT_PORT))
        })
        .collect()
}

/// Delivers a fixed address list once.
pub struct IpResolver {
    addresses: Vec<Address>,
    listener: Arc<dyn ResolverListener>,
    delivered: bool,
}

impl Resolver for IpResolver {
    fn update_resolution(&mut self) {
        if self.delivered {
            return;
        }
        self.delivered = true;
        self.listener.on_successful_resolution(ResolutionResult::from_addresses(self.addresses.clone()));
    }

    fn destroy(&mut self) {
        self.delivered = true;
    }
}

impl std::fmt::Debug for IpResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpResolver")
            .field("addresses", &self.addresses)
            .field("delivered", &self.delivered)
            .finish_non_exhaustive()
    }
}

/// Factory for the `ipv4` and `ipv6` schemes.
#[derive(Debug, Clone, Copy)]
pub struct IpResolverFactory {
    family: IpFamily,
}

impl IpResolverFactory {
    /// Creates a factory accepting `family` literals.
    #[must_use]
    pub fn new(family: IpFamily) -> Self {
        Self { family }
    }
}

impl ResolverFactory for IpResolverFactory {
    fn create(
        &self,
        target: &Target,
        listener: Arc<dyn ResolverListener>,
        _options: &ResolverOptions,
    ) -> Result<Box<dyn Resolver>> {
        let addresses = parse_list(self.family, target.path())
            .context(InvalidAddressSnafu { target: target.to_string() })?;
        Ok(Box::new(IpResolver { addresses, listener, delivered: false }))
    }

    fn default_authority(&self, target: &Target) -> String {
        target.path().split(',').next().unwrap_or_default().to_owned()
    }
}
