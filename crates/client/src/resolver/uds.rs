//! Unix domain socket targets.
//!
//! `unix:relative/path` keeps the path as written; `unix:///abs/path` has an
//! empty authority and names the absolute path `/abs/path`.

use std::sync::Arc;

use wayfinder_types::{Address, Target};

use super::{ResolutionResult, Resolver, ResolverFactory, ResolverListener, ResolverOptions};
use crate::error::Result;

/// Delivers the socket path once.
pub struct UdsResolver {
    address: Address,
    listener: Arc<dyn ResolverListener>,
    delivered: bool,
}

impl Resolver for UdsResolver {
    fn update_resolution(&mut self) {
        if std::mem::replace(&mut self.delivered, true) {
            return;
        }
        self.listener
            .on_successful_resolution(ResolutionResult::from_addresses(vec![self.address.clone()]));
    }

    fn destroy(&mut self) {
        self.delivered = true;
    }
}

impl std::fmt::Debug for UdsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdsResolver").field("address", &self.address).finish_non_exhaustive()
    }
}

/// Factory for the `unix` scheme.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdsResolverFactory;

fn socket_path(target: &Target) -> String {
    match target.authority() {
        Some("") => format!("/{}", target.path()),
        _ => target.path().to_owned(),
    }
}

impl ResolverFactory for UdsResolverFactory {
    fn create(
        &self,
        target: &Target,
        listener: Arc<dyn ResolverListener>,
        _options: &ResolverOptions,
    ) -> Result<Box<dyn Resolver>> {
        Ok(Box::new(UdsResolver {
            address: Address::unix(socket_path(target)),
            listener,
            delivered: false,
        }))
    }

    fn default_authority(&self, _target: &Target) -> String {
        "localhost".to_owned()
    }
}
