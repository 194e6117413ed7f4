// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Builder for [`RegenerativeCacheManager`].

use std::{sync::Arc, time::Duration};

use regen_cache_backend::{DistributedLockFactory, Error, ExternalCache, FanOutBus};

use crate::manager::RegenerativeCacheManager;

/// Configures and constructs a [`RegenerativeCacheManager`].
///
/// The defaults suit production-scale regeneration intervals (seconds to
/// minutes). Deployments with much shorter intervals — and tests — should
/// scale the tolerances and the scheduling floor down along with them.
#[must_use]
pub struct RegenerativeCacheManagerBuilder {
    pub(crate) keyspace: String,
    pub(crate) external: Arc<dyn ExternalCache>,
    pub(crate) lock_factory: Arc<dyn DistributedLockFactory>,
    pub(crate) bus: Arc<dyn FanOutBus>,
    pub(crate) cache_expiry_tolerance: Duration,
    pub(crate) farm_clock_tolerance: Duration,
    pub(crate) minimum_forward_scheduling: Duration,
    pub(crate) trigger_delay: Duration,
}

impl RegenerativeCacheManagerBuilder {
    pub(crate) fn new(
        keyspace: &str,
        external: Arc<dyn ExternalCache>,
        lock_factory: Arc<dyn DistributedLockFactory>,
        bus: Arc<dyn FanOutBus>,
    ) -> Self {
        Self {
            keyspace: keyspace.to_owned(),
            external,
            lock_factory,
            bus,
            cache_expiry_tolerance: Duration::from_secs(30),
            farm_clock_tolerance: Duration::from_secs(15),
            minimum_forward_scheduling: Duration::from_secs(5),
            trigger_delay: Duration::from_secs(1),
        }
    }

    /// Slack added to each stored entry's TTL beyond the regeneration
    /// interval, so a slightly overlong generation does not open a window
    /// where every node misses at once. Default: 30 seconds.
    pub fn cache_expiry_tolerance(mut self, tolerance: Duration) -> Self {
        self.cache_expiry_tolerance = tolerance;
        self
    }

    /// Assumed upper bound on wall-clock drift between nodes, discounted
    /// from freshness checks. Default: 15 seconds.
    pub fn farm_clock_tolerance(mut self, tolerance: Duration) -> Self {
        self.farm_clock_tolerance = tolerance;
        self
    }

    /// Floor on how soon after "now" a trigger may fire; stops a generation
    /// that keeps outrunning its interval from rescheduling itself into a
    /// tight loop. Default: 5 seconds.
    pub fn minimum_forward_scheduling(mut self, window: Duration) -> Self {
        self.minimum_forward_scheduling = window;
        self
    }

    /// Slack between a trigger's target time and the probe that forces the
    /// trigger map to observe the expiry. Default: 1 second.
    pub fn trigger_delay(mut self, delay: Duration) -> Self {
        self.trigger_delay = delay;
        self
    }

    /// Builds the manager and brings its bus subscription live.
    ///
    /// # Errors
    ///
    /// Returns a [`Error::Bus`] if the subscription could not be
    /// established.
    pub async fn build(self) -> Result<RegenerativeCacheManager, Error> {
        RegenerativeCacheManager::from_builder(self).await
    }
}
