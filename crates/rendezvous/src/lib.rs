// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Correlated await: many waiters per key, one keyed notification.
//!
//! A [`Rendezvous`] lets any number of tasks park on a key and be released
//! together by a single [`notify`](Rendezvous::notify) carrying a message for
//! that key. Each waiter receives its own clone of the message over a
//! single-shot channel.
//!
//! Registration and notification are serialized by one internal lock:
//! `notify` atomically swaps the entire waiter set for the key out of the map
//! and completes the channels *outside* the lock, so user continuations never
//! run under it. A waiter registered before a notify is therefore never
//! missed, and a waiter registered after one waits for the next.
//!
//! [`Awaiter`]s are scoped: dropping one before fulfillment removes it from
//! the set, so an abandoned wait cannot leak an entry for the life of the
//! process.
//!
//! # Example
//!
//! ```
//! use rendezvous::Rendezvous;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let board: Rendezvous<String, u32> = Rendezvous::new();
//!
//! let awaiter = board.create_awaiter("job".to_string());
//! let released = board.notify("job", &7);
//! assert_eq!(released, 1);
//! assert_eq!(awaiter.wait().await.unwrap(), 7);
//! # }
//! ```

use std::{
    borrow::Borrow,
    collections::HashMap,
    fmt,
    hash::Hash,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex as SyncMutex;
use thiserror::Error;
use tokio::sync::oneshot;

type WaiterMap<K, M> = HashMap<K, HashMap<u64, oneshot::Sender<M>>>;

/// The notifying side went away before delivering a message.
///
/// In practice this means the [`Rendezvous`] (or whatever task was going to
/// call `notify`) was dropped while the awaiter was still parked.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("rendezvous dropped without a notification for the awaited key")]
pub struct Disconnected;

/// Map from key to the set of waiters parked on it.
pub struct Rendezvous<K, M> {
    waiters: Arc<SyncMutex<WaiterMap<K, M>>>,
    next_id: AtomicU64,
}

impl<K, M> Default for Rendezvous<K, M> {
    fn default() -> Self {
        Self {
            waiters: Arc::default(),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<K, M> fmt::Debug for Rendezvous<K, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rendezvous")
    }
}

impl<K, M> Rendezvous<K, M>
where
    K: Eq + Hash + Clone,
{
    /// Creates an empty rendezvous board.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `key`.
    ///
    /// The returned [`Awaiter`] must be consumed with [`Awaiter::wait`] or
    /// dropped; dropping it before fulfillment removes it from the set.
    pub fn create_awaiter(&self, key: K) -> Awaiter<K, M> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, channel) = oneshot::channel();
        self.waiters
            .lock()
            .entry(key.clone())
            .or_default()
            .insert(id, sender);
        Awaiter {
            key,
            id,
            waiters: Arc::clone(&self.waiters),
            channel: Some(channel),
        }
    }

    /// Releases every waiter currently parked on `key` with a clone of
    /// `message`, returning how many were released.
    ///
    /// The waiter set is swapped out atomically; waiters that register while
    /// the channels are being completed wait for the next notification.
    pub fn notify<Q>(&self, key: &Q, message: &M) -> usize
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
        M: Clone,
    {
        let Some(released) = self.waiters.lock().remove(key) else {
            return 0;
        };
        let mut count = 0;
        for (_, sender) in released {
            // A waiter dropped between the swap and this send is fine; the
            // channel just reports closed.
            if sender.send(message.clone()).is_ok() {
                count += 1;
            }
        }
        count
    }

    /// Number of waiters currently parked on `key`.
    #[must_use]
    pub fn pending<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.waiters.lock().get(key).map_or(0, HashMap::len)
    }
}

/// A single registration on a [`Rendezvous`] key.
#[derive(Debug)]
pub struct Awaiter<K: Eq + Hash, M> {
    key: K,
    id: u64,
    waiters: Arc<SyncMutex<WaiterMap<K, M>>>,
    channel: Option<oneshot::Receiver<M>>,
}

impl<K: Eq + Hash, M> Awaiter<K, M> {
    /// Waits for the notification that releases this awaiter.
    ///
    /// # Errors
    ///
    /// Returns [`Disconnected`] if the notifying side vanished first.
    pub async fn wait(mut self) -> Result<M, Disconnected> {
        let channel = self.channel.take().expect("awaiter channel taken twice");
        channel.await.map_err(|_| Disconnected)
    }
}

impl<K: Eq + Hash, M> Drop for Awaiter<K, M> {
    fn drop(&mut self) {
        // Idempotent: after a notify the set for this key is already gone,
        // and ids are never reused, so this cannot disturb later waiters.
        let mut waiters = self.waiters.lock();
        if let Some(set) = waiters.get_mut(&self.key) {
            set.remove(&self.id);
            if set.is_empty() {
                waiters.remove(&self.key);
            }
        }
    }
}
