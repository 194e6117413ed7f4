// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-memory reference backends for tests and examples.
//!
//! All three types share their state across clones, so handing clones of one
//! store, one lock service and one bus to several manager instances inside a
//! single process exercises genuine multi-node behavior against one "farm".
//! Operations are recorded for later verification and the store supports
//! failure injection for error-path testing.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    DistributedLock, DistributedLockFactory, Error, ExternalCache, FanOutBus, MessageHandler,
};

/// Recorded external-store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// A value was written with the given TTL.
    Set { key: String, ttl: Duration },
    /// A value-with-expiry read was performed.
    GetWithExpiry(String),
    /// A prefix read was performed.
    GetStart { key: String, length: usize },
}

type FailPredicate = Box<dyn Fn(&StoreOp) -> bool + Send + Sync>;

struct StoredEntry {
    value: String,
    expires_at: Instant,
}

/// An [`ExternalCache`] backed by a process-local map with absolute expiries.
#[derive(Clone, Default)]
pub struct InMemoryExternalCache {
    entries: Arc<Mutex<HashMap<String, StoredEntry>>>,
    operations: Arc<Mutex<Vec<StoreOp>>>,
    fail_when: Arc<Mutex<Option<FailPredicate>>>,
}

impl InMemoryExternalCache {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a predicate that makes matching operations fail with an
    /// [`Error::ExternalStore`].
    pub fn fail_when<F>(&self, predicate: F)
    where
        F: Fn(&StoreOp) -> bool + Send + Sync + 'static,
    {
        *self.fail_when.lock() = Some(Box::new(predicate));
    }

    /// Clears the failure predicate.
    pub fn clear_failures(&self) {
        *self.fail_when.lock() = None;
    }

    /// Returns a clone of all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<StoreOp> {
        self.operations.lock().clone()
    }

    /// Number of writes performed so far.
    #[must_use]
    pub fn set_count(&self) -> usize {
        self.operations
            .lock()
            .iter()
            .filter(|op| matches!(op, StoreOp::Set { .. }))
            .count()
    }

    /// Number of value-with-expiry reads performed so far.
    #[must_use]
    pub fn get_count(&self) -> usize {
        self.operations
            .lock()
            .iter()
            .filter(|op| matches!(op, StoreOp::GetWithExpiry(_)))
            .count()
    }

    fn record(&self, op: StoreOp) {
        self.operations.lock().push(op);
    }

    fn should_fail(&self, op: &StoreOp) -> bool {
        self.fail_when.lock().as_ref().is_some_and(|predicate| predicate(op))
    }

    fn live_value(&self, key: &str) -> Option<(String, Duration)> {
        let mut entries = self.entries.lock();
        let entry = entries.get(key)?;
        let now = Instant::now();
        if entry.expires_at <= now {
            entries.remove(key);
            return None;
        }
        Some((entry.value.clone(), entry.expires_at - now))
    }
}

#[async_trait]
impl ExternalCache for InMemoryExternalCache {
    async fn string_set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error> {
        let op = StoreOp::Set { key: key.to_owned(), ttl };
        if self.should_fail(&op) {
            self.record(op);
            return Err(Error::external("injected: set failed"));
        }
        self.record(op);
        self.entries.lock().insert(
            key.to_owned(),
            StoredEntry {
                value: value.to_owned(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn string_get_with_expiry(&self, key: &str) -> Result<Option<(String, Duration)>, Error> {
        let op = StoreOp::GetWithExpiry(key.to_owned());
        if self.should_fail(&op) {
            self.record(op);
            return Err(Error::external("injected: get failed"));
        }
        self.record(op);
        Ok(self.live_value(key))
    }

    async fn get_string_start(&self, key: &str, length: usize) -> Result<Option<String>, Error> {
        let op = StoreOp::GetStart { key: key.to_owned(), length };
        if self.should_fail(&op) {
            self.record(op);
            return Err(Error::external("injected: prefix read failed"));
        }
        self.record(op);
        Ok(self.live_value(key).map(|(value, _)| head(&value, length)))
    }
}

fn head(value: &str, length: usize) -> String {
    if value.len() <= length {
        return value.to_owned();
    }
    let mut end = length;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_owned()
}

/// A [`DistributedLockFactory`] over a process-local lock table with
/// absolute expiries.
#[derive(Clone, Default)]
pub struct InMemoryLockService {
    held: Arc<Mutex<HashMap<String, Instant>>>,
    acquired: Arc<Mutex<Vec<String>>>,
    contended: Arc<AtomicUsize>,
}

impl InMemoryLockService {
    /// Creates an empty lock service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful acquisitions so far.
    #[must_use]
    pub fn acquired_count(&self) -> usize {
        self.acquired.lock().len()
    }

    /// Lock keys successfully acquired, in order.
    #[must_use]
    pub fn acquired_keys(&self) -> Vec<String> {
        self.acquired.lock().clone()
    }

    /// Number of attempts that found the lock already held.
    #[must_use]
    pub fn contended_count(&self) -> usize {
        self.contended.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DistributedLockFactory for InMemoryLockService {
    async fn acquire(
        &self,
        lock_key: &str,
        expiry: Duration,
    ) -> Result<Option<Box<dyn DistributedLock>>, Error> {
        let mut held = self.held.lock();
        let now = Instant::now();
        held.retain(|_, until| *until > now);

        if held.contains_key(lock_key) {
            self.contended.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        held.insert(lock_key.to_owned(), now + expiry);
        self.acquired.lock().push(lock_key.to_owned());
        Ok(Some(Box::new(HeldLock {
            key: lock_key.to_owned(),
            held: Arc::clone(&self.held),
        })))
    }
}

struct HeldLock {
    key: String,
    held: Arc<Mutex<HashMap<String, Instant>>>,
}

#[async_trait]
impl DistributedLock for HeldLock {
    async fn release(self: Box<Self>) -> Result<(), Error> {
        self.held.lock().remove(&self.key);
        Ok(())
    }
}

/// A [`FanOutBus`] that delivers each publish synchronously to every
/// current subscriber of the topic, the publisher's own subscription
/// included.
#[derive(Clone, Default)]
pub struct InMemoryFanOutBus {
    subscribers: Arc<Mutex<HashMap<String, Vec<MessageHandler>>>>,
    published: Arc<Mutex<Vec<(String, String)>>>,
    delivered: Arc<AtomicUsize>,
}

impl InMemoryFanOutBus {
    /// Creates a bus with no subscriptions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All published `(topic, payload)` pairs, in order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().clone()
    }

    /// Number of publishes so far.
    #[must_use]
    pub fn publish_count(&self) -> usize {
        self.published.lock().len()
    }

    /// Number of handler invocations so far, across all topics.
    #[must_use]
    pub fn delivered_count(&self) -> usize {
        self.delivered.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FanOutBus for InMemoryFanOutBus {
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), Error> {
        self.subscribers
            .lock()
            .entry(topic.to_owned())
            .or_default()
            .push(handler);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), Error> {
        self.published
            .lock()
            .push((topic.to_owned(), payload.to_owned()));
        // Handlers run outside the subscriber lock; one of them may well
        // subscribe or publish again.
        let handlers: Vec<MessageHandler> = self
            .subscribers
            .lock()
            .get(topic)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(payload.to_owned()).await;
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_round_trip_reports_remaining_ttl() {
        let store = InMemoryExternalCache::new();
        store
            .string_set("k", "value", Duration::from_secs(60))
            .await
            .unwrap();

        let (value, remaining) = store.string_get_with_expiry("k").await.unwrap().unwrap();
        assert_eq!(value, "value");
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(59));
    }

    #[tokio::test]
    async fn store_expires_values() {
        let store = InMemoryExternalCache::new();
        store
            .string_set("k", "value", Duration::from_millis(20))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.string_get_with_expiry("k").await.unwrap().is_none());
        assert!(store.get_string_start("k", 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_prefix_read_truncates() {
        let store = InMemoryExternalCache::new();
        store
            .string_set("k", "0123456789", Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(
            store.get_string_start("k", 4).await.unwrap().unwrap(),
            "0123"
        );
        assert_eq!(
            store.get_string_start("k", 64).await.unwrap().unwrap(),
            "0123456789"
        );
    }

    #[tokio::test]
    async fn store_failure_injection() {
        let store = InMemoryExternalCache::new();
        store.fail_when(|op| matches!(op, StoreOp::Set { key, .. } if key == "bad"));

        assert!(store.string_set("bad", "v", Duration::from_secs(1)).await.is_err());
        assert!(store.string_set("good", "v", Duration::from_secs(1)).await.is_ok());

        store.clear_failures();
        assert!(store.string_set("bad", "v", Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn lock_excludes_second_holder_until_release() {
        let locks = InMemoryLockService::new();

        let first = locks.acquire("l", Duration::from_secs(10)).await.unwrap();
        assert!(first.is_some());
        assert!(locks.acquire("l", Duration::from_secs(10)).await.unwrap().is_none());
        assert_eq!(locks.contended_count(), 1);

        first.unwrap().release().await.unwrap();
        assert!(locks.acquire("l", Duration::from_secs(10)).await.unwrap().is_some());
        assert_eq!(locks.acquired_count(), 2);
    }

    #[tokio::test]
    async fn lock_expires_on_its_own() {
        let locks = InMemoryLockService::new();

        let abandoned = locks.acquire("l", Duration::from_millis(20)).await.unwrap();
        assert!(abandoned.is_some());
        // Dropped without release; the expiry must clear it.
        drop(abandoned);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(locks.acquire("l", Duration::from_secs(1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn bus_fans_out_to_every_subscriber() {
        let bus = InMemoryFanOutBus::new();
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));

        for _ in 0..2 {
            let seen = Arc::clone(&seen);
            let handler: MessageHandler = Arc::new(move |payload| {
                let seen = Arc::clone(&seen);
                Box::pin(async move {
                    seen.lock().push(payload);
                })
            });
            bus.subscribe("topic", handler).await.unwrap();
        }

        bus.publish("topic", "m1").await.unwrap();
        bus.publish("other", "m2").await.unwrap();

        assert_eq!(seen.lock().as_slice(), ["m1", "m1"]);
        assert_eq!(bus.publish_count(), 2);
        assert_eq!(bus.delivered_count(), 2);
    }
}
