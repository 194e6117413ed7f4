// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The three collaborator traits the coordination engine layers over.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::Error;

/// A shared external key/value store with TTL support.
///
/// Keys arriving here are already fully namespaced by the caller. All three
/// operations are plain string operations so that any remote store with
/// expiring string values can implement them.
#[async_trait]
pub trait ExternalCache: Send + Sync {
    /// Upserts `value` under `key`, expiring after `ttl`.
    async fn string_set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error>;

    /// Reads the value and its remaining lifetime.
    ///
    /// Returns both or neither: an expired or absent key yields `None`, and a
    /// present value always comes with a positive remaining TTL.
    async fn string_get_with_expiry(&self, key: &str) -> Result<Option<(String, Duration)>, Error>;

    /// Reads the first `length` bytes of the stored string, or the whole
    /// string if it is shorter; `None` if the key is absent.
    ///
    /// This is the cheap "peek at the prefix" operation that lets callers
    /// recover a timestamp header without transferring the payload.
    async fn get_string_start(&self, key: &str, length: usize) -> Result<Option<String>, Error>;
}

/// Factory for farm-wide mutual exclusion.
#[async_trait]
pub trait DistributedLockFactory: Send + Sync {
    /// Attempts to take the lock named `lock_key`.
    ///
    /// Returns `Some(handle)` on acquisition and `None` when another holder
    /// has it; only infrastructure failures are errors. The lock must
    /// auto-expire after `expiry` regardless of the holder's liveness, so a
    /// crashed holder cannot block the farm for longer than one cycle.
    async fn acquire(
        &self,
        lock_key: &str,
        expiry: Duration,
    ) -> Result<Option<Box<dyn DistributedLock>>, Error>;
}

/// A held distributed lock.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Releases the lock. Skipping this is safe but keeps the lock until its
    /// expiry elapses.
    async fn release(self: Box<Self>) -> Result<(), Error>;
}

/// Handler invoked with the payload of each message delivered on a
/// subscribed topic.
pub type MessageHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// A non-durable fan-out publish/subscribe transport.
///
/// Every published message reaches every *current* subscriber at least once;
/// there is no replay for late subscribers and no delivery-order guarantee
/// across publishers. Duplicate deliveries must be tolerable for the
/// handlers, and the messages the engine sends are idempotent for exactly
/// that reason.
#[async_trait]
pub trait FanOutBus: Send + Sync {
    /// Registers `handler` for `topic`. Must not return until the
    /// subscription is live, so a caller that publishes right afterwards
    /// can rely on hearing its own message.
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), Error>;

    /// Publishes `payload` to every current subscriber of `topic`.
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), Error>;
}
