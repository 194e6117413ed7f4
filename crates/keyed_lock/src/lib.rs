// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Process-local mutual exclusion keyed by name.
//!
//! [`KeyedLocks`] maps arbitrary string names to mutexes on demand. Callers
//! that need to serialize work on a dynamic identity (a cache key, a resource
//! path) acquire the lock for that name and hold a scoped [`KeyedLockGuard`];
//! the underlying mutex exists only while at least one caller references it,
//! so the table never grows with dead names.
//!
//! Two acquisition modes are provided:
//!
//! - [`KeyedLocks::acquire`] waits indefinitely.
//! - [`KeyedLocks::try_acquire`] waits up to a timeout; a zero timeout makes a
//!   single non-blocking attempt. The returned guard reports the outcome via
//!   [`KeyedLockGuard::is_locked`], which makes the "if somebody else already
//!   holds this name, do nothing" discard pattern a one-liner.
//!
//! The lock may be held across `.await` points. Fairness is not guaranteed.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use keyed_lock::KeyedLocks;
//!
//! # futures::executor::block_on(async {
//! let locks = KeyedLocks::new();
//!
//! let first = locks.acquire("user:42").await;
//! assert!(first.is_locked());
//!
//! // The name is busy, so a zero-timeout attempt comes back unlocked.
//! let second = locks.try_acquire("user:42", Duration::ZERO).await;
//! assert!(!second.is_locked());
//!
//! drop(first);
//! let third = locks.try_acquire("user:42", Duration::ZERO).await;
//! assert!(third.is_locked());
//! # });
//! ```

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type SlotMap = HashMap<String, Slot>;

#[derive(Debug)]
struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    /// Guards checked in against this name, locked or still waiting.
    holders: usize,
}

/// A table of name-keyed mutexes with automatic entry cleanup.
///
/// Cloning is cheap and all clones share the same table.
#[derive(Clone, Debug, Default)]
pub struct KeyedLocks {
    slots: Arc<SyncMutex<SlotMap>>,
}

impl KeyedLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `name`, waiting as long as it takes.
    pub async fn acquire(&self, name: &str) -> KeyedLockGuard {
        let mutex = self.check_in(name);
        let held = mutex.lock_owned().await;
        self.guard(name, Some(held))
    }

    /// Attempts to acquire the lock for `name` within `timeout`.
    ///
    /// A zero timeout performs a single non-blocking attempt. The returned
    /// guard's [`is_locked`](KeyedLockGuard::is_locked) tells whether the
    /// acquisition succeeded; an unlocked guard still cleans up its table
    /// entry on drop and holds nothing.
    pub async fn try_acquire(&self, name: &str, timeout: Duration) -> KeyedLockGuard {
        let mutex = self.check_in(name);
        let held = if timeout.is_zero() {
            mutex.try_lock_owned().ok()
        } else {
            tokio::time::timeout(timeout, mutex.lock_owned()).await.ok()
        };
        self.guard(name, held)
    }

    /// Number of names currently tracked by the table.
    ///
    /// Drops back to zero once every guard is released; useful for asserting
    /// that the table does not leak entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Returns `true` if no name is currently tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    fn check_in(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(name.to_owned()).or_insert_with(|| Slot {
            mutex: Arc::new(AsyncMutex::new(())),
            holders: 0,
        });
        slot.holders += 1;
        Arc::clone(&slot.mutex)
    }

    fn guard(&self, name: &str, held: Option<OwnedMutexGuard<()>>) -> KeyedLockGuard {
        KeyedLockGuard {
            name: name.to_owned(),
            slots: Arc::clone(&self.slots),
            held,
        }
    }
}

/// Scoped handle for a [`KeyedLocks`] acquisition.
///
/// Dropping the guard releases the mutex (if it was held) and removes the
/// table entry when the last interested caller leaves.
#[derive(Debug)]
pub struct KeyedLockGuard {
    name: String,
    slots: Arc<SyncMutex<SlotMap>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl KeyedLockGuard {
    /// Whether this guard actually holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.held.is_some()
    }
}

impl Drop for KeyedLockGuard {
    fn drop(&mut self) {
        // Release the mutex before the bookkeeping so a waiter that is
        // already checked in can proceed immediately.
        self.held.take();

        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&self.name) {
            slot.holders -= 1;
            if slot.holders == 0 {
                slots.remove(&self.name);
            }
        }
    }
}
