// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A per-process memory tier layered over the shared external store.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use keyed_lock::KeyedLocks;
use moka::{Expiry, future::Cache};
use regen_cache_backend::{Error, ExternalCache};

#[derive(Clone, Debug)]
struct FrontedEntry {
    value: String,
    ttl: Duration,
}

/// Expires each local entry after its own TTL, which mirrors the remaining
/// lifetime of the external copy it was taken from.
struct EntryTtl;

impl Expiry<String, FrontedEntry> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &FrontedEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &FrontedEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// A memory-fronted view of the external store.
///
/// Reads are served from a local TTL cache when possible; misses fetch from
/// the external store under a per-key guard so concurrent misses on one key
/// cost a single external round-trip. The local copy never outlives the
/// external one: it is stored with the remaining external TTL, adjusted for
/// the time the fetch itself took.
///
/// External keys are namespaced as
/// `MemoryFrontedExternalCache:{keyspace}:Item:{key}`.
pub struct MemoryFrontedExternalCache {
    keyspace: String,
    local: Cache<String, FrontedEntry>,
    external: Arc<dyn ExternalCache>,
    population_locks: KeyedLocks,
}

impl MemoryFrontedExternalCache {
    /// Creates a fronted view of `external` for `keyspace`.
    #[must_use]
    pub fn new(keyspace: &str, external: Arc<dyn ExternalCache>) -> Self {
        let local = Cache::builder()
            .name(&format!("MemoryFrontedExternalCache_{keyspace}"))
            .expire_after(EntryTtl)
            .build();
        Self {
            keyspace: keyspace.to_owned(),
            local,
            external,
            population_locks: KeyedLocks::new(),
        }
    }

    fn external_key(&self, key: &str) -> String {
        format!("MemoryFrontedExternalCache:{}:Item:{}", self.keyspace, key)
    }

    /// Writes `value` locally and to the external store, both expiring after
    /// `ttl`.
    ///
    /// # Errors
    ///
    /// External-store failures propagate; the local write cannot fail.
    pub async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), Error> {
        self.local
            .insert(key.to_owned(), FrontedEntry { value: value.clone(), ttl })
            .await;
        self.external.string_set(&self.external_key(key), &value, ttl).await
    }

    /// Reads `key`, preferring the local copy.
    ///
    /// Never returns a value whose remaining lifetime is already spent: the
    /// external store's reported TTL is discounted by the wall time the
    /// fetch took before the value is accepted.
    ///
    /// # Errors
    ///
    /// External-store failures propagate.
    pub async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        if let Some(entry) = self.local.get(key).await {
            return Ok(Some(entry.value));
        }

        let _populating = self.population_locks.acquire(key).await;
        if let Some(entry) = self.local.get(key).await {
            // Another miss on this key got here first and populated for us.
            return Ok(Some(entry.value));
        }

        let fetch_started = Instant::now();
        let Some((value, remaining)) = self
            .external
            .string_get_with_expiry(&self.external_key(key))
            .await?
        else {
            return Ok(None);
        };
        let remaining = remaining.saturating_sub(fetch_started.elapsed());
        if remaining.is_zero() {
            return Ok(None);
        }

        self.local
            .insert(
                key.to_owned(),
                FrontedEntry { value: value.clone(), ttl: remaining },
            )
            .await;
        Ok(Some(value))
    }

    /// Reads the first `length` bytes of the value, best-effort.
    ///
    /// A local hit is sliced in place; otherwise the external store is asked
    /// for the prefix only. No local population happens on this path.
    ///
    /// # Errors
    ///
    /// External-store failures propagate.
    pub async fn get_prefix(&self, key: &str, length: usize) -> Result<Option<String>, Error> {
        if let Some(entry) = self.local.get(key).await {
            return Ok(Some(head(&entry.value, length)));
        }
        self.external
            .get_string_start(&self.external_key(key), length)
            .await
    }

    /// Drops only the in-process copy; the next [`get`](Self::get) fetches
    /// from the external store again.
    pub async fn remove_local(&self, key: &str) {
        self.local.invalidate(key).await;
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
