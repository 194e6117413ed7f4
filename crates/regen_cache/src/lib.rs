// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Regenerative distributed cache coordination.
//!
//! This crate fronts a slow-to-produce value (a heavy query, an expensive
//! report) with a two-tier cache, per-process memory over a shared external
//! store, and proactively regenerates each entry in the background at a
//! fixed interval, coordinating across a farm of nodes so that at most one
//! of them recomputes a given key at a time.
//!
//! Consumers call [`RegenerativeCacheManager::get_or_add`] with a key, a
//! generation callback, a regeneration interval and an inactive-retention
//! window, and always receive the freshest cached value without two callers
//! ever blocking on the same expensive regeneration:
//!
//! - misses are deduplicated per process by a named lock and per farm by a
//!   distributed lock, with every waiting caller released by the winner's
//!   result notification;
//! - a per-key scheduled trigger regenerates the value once per interval in
//!   the background for as long as requests keep arriving, so steady-state
//!   readers never wait on generation at all;
//! - regenerations publish over a fan-out bus, and peers drop their local
//!   copies on arrival, bounding staleness by the interval plus the
//!   configured tolerances.
//!
//! The storage, locking and messaging backends are pluggable through the
//! traits in [`regen_cache_backend`]; anything with expiring string values,
//! a bounded-expiry try-lock and non-durable pub/sub can drive the engine.
//!
//! # Example
//!
//! ```
//! use std::{sync::Arc, time::Duration};
//!
//! use regen_cache::RegenerativeCacheManager;
//! use regen_cache_backend::testing::{
//!     InMemoryExternalCache, InMemoryFanOutBus, InMemoryLockService,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), regen_cache::Error> {
//! let manager = RegenerativeCacheManager::builder(
//!     "reports",
//!     Arc::new(InMemoryExternalCache::new()),
//!     Arc::new(InMemoryLockService::new()),
//!     Arc::new(InMemoryFanOutBus::new()),
//! )
//! .build()
//! .await?;
//!
//! let value = manager
//!     .get_or_add(
//!         "daily-summary",
//!         || async { Ok::<_, std::convert::Infallible>("expensive result".to_owned()) },
//!         Duration::from_secs(90),
//!         Duration::from_secs(30),
//!     )
//!     .await?;
//! assert_eq!(value, "expensive result");
//! # Ok(())
//! # }
//! ```

mod builder;
pub mod codec;
mod fronted;
mod manager;
mod notification;
mod scheduler;

pub use builder::RegenerativeCacheManagerBuilder;
pub use fronted::MemoryFrontedExternalCache;
pub use manager::{GenerateFn, RegenerativeCacheManager};
pub use notification::ResultNotification;
pub use scheduler::{TriggerCallback, TriggerScheduler};

pub use regen_cache_backend::{
    BoxError, DistributedLock, DistributedLockFactory, Error, ExternalCache, FanOutBus,
    MessageHandler, Result,
};
