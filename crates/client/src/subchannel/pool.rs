//! Subchannel sharing.
//!
//! A pool hands out one subchannel per `(address, connector, settings)` so an
//! address that survives a load-balancer update, or that two channels target,
//! keeps its live connection. Entries are weak: a subchannel lives only as
//! long as somebody outside the pool holds it.

use std::{
    sync::{Arc, LazyLock, Weak},
    time::Duration,
};

use dashmap::DashMap;
use wayfinder_types::{
    Address, ConnectivityState,
    config::{BackoffConfig, ChannelConfig},
};

use super::{Subchannel, TransportSubchannel};
use crate::{metrics::ClientMetrics, transport::Connector};

/// Per-subchannel connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SubchannelSettings {
    /// Upper bound on a single connection attempt.
    pub connect_timeout: Duration,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
}

impl SubchannelSettings {
    /// Extracts the subchannel-relevant part of a channel config.
    #[must_use]
    pub fn from_config(config: &ChannelConfig) -> Self {
        Self { connect_timeout: config.connect_timeout, backoff: config.backoff.clone() }
    }
}

impl Default for SubchannelSettings {
    fn default() -> Self {
        Self::from_config(&ChannelConfig::default())
    }
}

struct PoolEntry {
    connector: Arc<dyn Connector>,
    settings: SubchannelSettings,
    subchannel: Weak<TransportSubchannel>,
}

impl PoolEntry {
    fn live(&self) -> Option<Arc<TransportSubchannel>> {
        self.subchannel.upgrade().filter(|sc| sc.state() != ConnectivityState::Shutdown)
    }
}

/// A map from address to the subchannels currently alive for it.
#[derive(Default)]
pub struct SubchannelPool {
    entries: DashMap<Address, Vec<PoolEntry>>,
}

impl SubchannelPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide pool shared by channels that do not ask for a local
    /// one.
    #[must_use]
    pub fn global() -> Arc<Self> {
        static GLOBAL: LazyLock<Arc<SubchannelPool>> = LazyLock::new(|| Arc::new(SubchannelPool::new()));
        Arc::clone(&GLOBAL)
    }

    /// Returns the live subchannel for `address` created with the same
    /// connector and settings, creating one when none exists. The returned
    /// subchannel carries one reference for the caller.
    pub fn get_or_create(
        &self,
        address: &Address,
        connector: &Arc<dyn Connector>,
        settings: &SubchannelSettings,
        metrics: &Arc<dyn ClientMetrics>,
    ) -> Arc<TransportSubchannel> {
        let mut entries = self.entries.entry(address.clone()).or_default();
        entries.retain(|entry| entry.live().is_some());

        let existing = entries
            .iter()
            .filter(|entry| Arc::ptr_eq(&entry.connector, connector) && entry.settings == *settings)
            .find_map(|entry| entry.live().filter(|subchannel| subchannel.try_add_ref()));
        if let Some(subchannel) = existing {
            tracing::trace!(subchannel = %subchannel.id(), %address, "reusing pooled subchannel");
            return subchannel;
        }

        let subchannel = TransportSubchannel::new(
            address.clone(),
            Arc::clone(connector),
            settings.clone(),
            Arc::clone(metrics),
        );
        subchannel.add_ref();
        entries.push(PoolEntry {
            connector: Arc::clone(connector),
            settings: settings.clone(),
            subchannel: Arc::downgrade(&subchannel),
        });
        subchannel
    }

    /// Number of live subchannels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| entry.value().iter().filter(|e| e.live().is_some()).count())
            .sum()
    }

    /// Returns true when no live subchannel is pooled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops entries whose subchannel is gone or shut down.
    pub fn sweep(&self) {
        self.entries.retain(|_, entries| {
            entries.retain(|entry| entry.live().is_some());
            !entries.is_empty()
        });
    }
}

impl std::fmt::Debug for SubchannelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubchannelPool").field("addresses", &self.entries.len()).finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::{metrics::default_metrics, mock::MockConnector};

    #[test]
    fn test_same_key_shares_subchannel() {
        let pool = SubchannelPool::new();
        let connector: Arc<dyn Connector> = MockConnector::new();
        let address = Address::tcp("10.0.0.1", 443);
        let settings = SubchannelSettings::default();
        let metrics = default_metrics();

        let a = pool.get_or_create(&address, &connector, &settings, &metrics);
        let b = pool.get_or_create(&address, &connector, &settings, &metrics);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_different_settings_or_connector_do_not_share() {
        let pool = SubchannelPool::new();
        let connector: Arc<dyn Connector> = MockConnector::new();
        let other: Arc<dyn Connector> = MockConnector::new();
        let address = Address::tcp("10.0.0.1", 443);
        let settings = SubchannelSettings::default();
        let slow = SubchannelSettings { connect_timeout: Duration::from_secs(60), ..settings.clone() };
        let metrics = default_metrics();

        let a = pool.get_or_create(&address, &connector, &settings, &metrics);
        let b = pool.get_or_create(&address, &connector, &slow, &metrics);
        let c = pool.get_or_create(&address, &other, &settings, &metrics);
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_dropped_subchannel_is_replaced() {
        let pool = SubchannelPool::new();
        let connector: Arc<dyn Connector> = MockConnector::new();
        let address = Address::tcp("10.0.0.1", 443);
        let settings = SubchannelSettings::default();
        let metrics = default_metrics();

        let first = pool.get_or_create(&address, &connector, &settings, &metrics);
        let first_id = first.id();
        drop(first);
        assert!(pool.is_empty());

        let second = pool.get_or_create(&address, &connector, &settings, &metrics);
        assert_ne!(second.id(), first_id);
    }

    #[test]
    fn test_shut_down_subchannel_is_not_reused() {
        let pool = SubchannelPool::new();
        let connector: Arc<dyn Connector> = MockConnector::new();
        let address = Address::tcp("10.0.0.1", 443);
        let settings = SubchannelSettings::default();
        let metrics = default_metrics();

        let first = pool.get_or_create(&address, &connector, &settings, &metrics);
        first.unref();
        assert_eq!(first.state(), ConnectivityState::Shutdown);

        let second = pool.get_or_create(&address, &connector, &settings, &metrics);
        assert!(!Arc::ptr_eq(&first, &second));
        pool.sweep();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_handed_out_subchannel_is_referenced() {
        let pool = SubchannelPool::new();
        let connector: Arc<dyn Connector> = MockConnector::new();
        let address = Address::tcp("10.0.0.1", 443);
        let settings = SubchannelSettings::default();
        let metrics = default_metrics();

        let a = pool.get_or_create(&address, &connector, &settings, &metrics);
        let b = pool.get_or_create(&address, &connector, &settings, &metrics);
        assert_eq!(a.ref_count(), 2);

        // The first owner leaving does not shut the subchannel down under
        // the second.
        a.unref();
        assert_eq!(b.state(), ConnectivityState::Idle);
        b.unref();
        assert_eq!(b.state(), ConnectivityState::Shutdown);
    }

    #[test]
    fn test_concurrent_owners_never_receive_shut_down_subchannel() {
        let pool = Arc::new(SubchannelPool::new());
        let connector: Arc<dyn Connector> = MockConnector::new();
        let address = Address::tcp("10.0.0.1", 443);

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let connector = Arc::clone(&connector);
                let address = address.clone();
                std::thread::spawn(move || {
                    let settings = SubchannelSettings::default();
                    let metrics = default_metrics();
                    for _ in 0..500 {
                        let subchannel = pool.get_or_create(&address, &connector, &settings, &metrics);
                        assert_ne!(subchannel.state(), ConnectivityState::Shutdown);
                        subchannel.unref();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
    }
}
