// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Collaborator interfaces for the regenerative cache coordinator.
//!
//! The coordination engine in `regen_cache` is backend-agnostic: it talks to
//! a shared key/value store, a distributed lock service, and a non-durable
//! publish/subscribe bus exclusively through the traits in this crate. Any
//! storage, lock, or messaging system that can honor these contracts (Redis
//! is the canonical example, covering all three) plugs in by implementing
//! them.
//!
//! The crate also carries the shared [`Error`] type and, behind the
//! `test-util` feature, in-memory reference backends
//! ([`testing`]) that record their operations and support failure injection.

mod error;
mod external;

#[cfg(any(feature = "test-util", test))]
pub mod testing;

pub use error::{BoxError, Error, Result};
pub use external::{
    DistributedLock, DistributedLockFactory, ExternalCache, FanOutBus, MessageHandler,
};
