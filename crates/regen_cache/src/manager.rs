// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The top-level cache manager: `get_or_add` and single-flight regeneration.

use std::{
    future::Future,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use keyed_lock::KeyedLocks;
use regen_cache_backend::{
    BoxError, DistributedLockFactory, Error, FanOutBus,
};
use rendezvous::Rendezvous;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    builder::RegenerativeCacheManagerBuilder,
    codec,
    fronted::MemoryFrontedExternalCache,
    notification::ResultNotification,
    scheduler::{TriggerCallback, TriggerScheduler, chrono_interval},
};

/// The boxed generation callback stored in scheduled triggers.
pub type GenerateFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<String, BoxError>> + Send + Sync>;

/// Coordinates a two-tier cache with farm-wide single-flight background
/// regeneration.
///
/// Every node that should cooperate on the same data constructs a manager
/// with the same keyspace against the same external store, lock service and
/// bus. [`get_or_add`](Self::get_or_add) then guarantees that at most one
/// node at a time regenerates a given key, that waiting callers on every
/// node are released by the one regeneration, and that each node's local
/// copy is invalidated as soon as a peer publishes a fresher value.
///
/// Cloning is cheap; clones share the same node identity.
#[derive(Clone)]
pub struct RegenerativeCacheManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    weak_self: Weak<ManagerInner>,
    keyspace: String,
    sender_id: String,
    topic: String,
    global_lock_prefix: String,
    /// Salted per instance so two managers in one process contend only
    /// through the distributed lock, like distinct nodes would.
    local_lock_prefix: String,
    cache_expiry_tolerance: Duration,
    farm_clock_tolerance: Duration,
    trigger_delay: Duration,
    fronted: MemoryFrontedExternalCache,
    scheduler: TriggerScheduler,
    awaiters: Rendezvous<String, ResultNotification>,
    regeneration_locks: KeyedLocks,
    lock_factory: Arc<dyn DistributedLockFactory>,
    bus: Arc<dyn FanOutBus>,
}

impl RegenerativeCacheManager {
    /// Starts configuring a manager for `keyspace` over the given backends.
    pub fn builder(
        keyspace: &str,
        external: Arc<dyn regen_cache_backend::ExternalCache>,
        lock_factory: Arc<dyn DistributedLockFactory>,
        bus: Arc<dyn FanOutBus>,
    ) -> RegenerativeCacheManagerBuilder {
        RegenerativeCacheManagerBuilder::new(keyspace, external, lock_factory, bus)
    }

    pub(crate) async fn from_builder(
        builder: RegenerativeCacheManagerBuilder,
    ) -> Result<Self, Error> {
        let keyspace = builder.keyspace;
        let instance = Uuid::new_v4();
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned());

        let global_lock_prefix =
            format!("RegenerativeCacheManager:RegenerateIfNotUnderway:{keyspace}:");
        let inner = Arc::new_cyclic(|weak_self: &Weak<ManagerInner>| ManagerInner {
            weak_self: weak_self.clone(),
            sender_id: format!("{host}-{keyspace}-{instance}"),
            topic: format!("RegenerativeCacheManager:ResultNotification:{keyspace}"),
            local_lock_prefix: format!("{global_lock_prefix}{instance}:"),
            global_lock_prefix,
            cache_expiry_tolerance: builder.cache_expiry_tolerance,
            farm_clock_tolerance: builder.farm_clock_tolerance,
            trigger_delay: builder.trigger_delay,
            fronted: MemoryFrontedExternalCache::new(&keyspace, builder.external),
            scheduler: TriggerScheduler::new(
                &keyspace,
                builder.minimum_forward_scheduling,
                builder.trigger_delay,
            ),
            awaiters: Rendezvous::new(),
            regeneration_locks: KeyedLocks::new(),
            lock_factory: builder.lock_factory,
            bus: builder.bus,
            keyspace,
        });

        // The subscription must be live before the first get_or_add so no
        // peer notification can be missed.
        let subscriber = inner.weak_self.clone();
        let handler: regen_cache_backend::MessageHandler = Arc::new(move |payload: String| {
            let subscriber = subscriber.clone();
            Box::pin(async move {
                if let Some(inner) = subscriber.upgrade() {
                    inner.on_notification(&payload).await;
                }
            })
        });
        inner.bus.subscribe(&inner.topic, handler).await?;

        Ok(Self { inner })
    }

    /// The keyspace this manager cooperates in.
    #[must_use]
    pub fn keyspace(&self) -> &str {
        &self.inner.keyspace
    }

    /// This process instance's identity on the bus.
    #[must_use]
    pub fn sender_id(&self) -> &str {
        &self.inner.sender_id
    }

    /// The bus topic this manager exchanges result notifications on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Returns the cached value for `key`, generating it if necessary.
    ///
    /// On a hit the value is served from the local memory tier or the
    /// external store. On a miss, one caller per process (and, through the
    /// distributed lock, one node per farm) runs `generate`; everyone else
    /// waits for that regeneration's notification and then reads the stored
    /// value.
    ///
    /// When `inactive_retention > regeneration_interval`, the key is also
    /// regenerated in the background once per interval for as long as
    /// requests keep arriving on this node within the retention window.
    /// Passing `inactive_retention <= regeneration_interval` opts this node
    /// out of background regeneration for the key.
    ///
    /// # Errors
    ///
    /// [`Error::GenerationFailed`] if the callback failed (on whichever node
    /// ran it), [`Error::GenerationRaced`] if the regenerated entry expired
    /// before it could be read back, or a collaborator error.
    pub async fn get_or_add<F, Fut, E>(
        &self,
        key: &str,
        generate: F,
        inactive_retention: Duration,
        regeneration_interval: Duration,
    ) -> Result<String, Error>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let generate: GenerateFn = Arc::new(move || {
            let generation = generate();
            Box::pin(async move { generation.await.map_err(Into::into) })
        });
        self.get_or_add_boxed(key, generate, inactive_retention, regeneration_interval)
            .await
    }

    async fn get_or_add_boxed(
        &self,
        key: &str,
        generate: GenerateFn,
        inactive_retention: Duration,
        interval: Duration,
    ) -> Result<String, Error> {
        let inner = &self.inner;
        let trigger_required = inactive_retention > interval;
        let trigger_existed = if trigger_required {
            inner.scheduler.update_last_activity(key).await
        } else {
            false
        };

        if let Some((created_at, value)) = inner.read_entry(key).await? {
            if trigger_required && !trigger_existed {
                inner
                    .ensure_trigger(key, generate, inactive_retention, interval, created_at)
                    .await;
            }
            return Ok(value);
        }

        // Full miss. Enroll for the result before starting the single-flight
        // attempt so the notification cannot slip past between probe and
        // wait; the awaiter un-registers itself if this scope unwinds.
        let awaiter = inner.awaiters.create_awaiter(key.to_owned());
        inner
            .regenerate_if_not_underway(key, Arc::clone(&generate), interval, false)
            .await?;
        let notification = awaiter
            .wait()
            .await
            .map_err(|_| Error::NotifierVanished { key: key.to_owned() })?;

        if !notification.success {
            return Err(Error::GenerationFailed {
                key: key.to_owned(),
                message: notification.error.unwrap_or_default(),
            });
        }

        let Some((created_at, value)) = inner.read_entry(key).await? else {
            return Err(Error::GenerationRaced { key: key.to_owned() });
        };
        if trigger_required {
            inner
                .ensure_trigger(key, generate, inactive_retention, interval, created_at)
                .await;
        }
        Ok(value)
    }
}

impl ManagerInner {
    async fn on_notification(&self, payload: &str) {
        let notification: ResultNotification = match serde_json::from_str(payload) {
            Ok(notification) => notification,
            Err(error) => {
                warn!(
                    keyspace = %self.keyspace,
                    %error,
                    "dropping malformed result notification"
                );
                return;
            }
        };

        if notification.success && notification.sender != self.sender_id {
            // Drop the local copy before releasing awaiters, so a released
            // caller that re-reads immediately sees the peer's fresh value.
            self.fronted.remove_local(&notification.key).await;
        }
        let released = self.awaiters.notify(&notification.key, &notification);
        debug!(
            keyspace = %self.keyspace,
            key = %notification.key,
            success = notification.success,
            released,
            "result notification processed"
        );
    }

    async fn read_entry(&self, key: &str) -> Result<Option<(DateTime<Utc>, String)>, Error> {
        match self.fronted.get(key).await? {
            Some(raw) => codec::decode(&raw).map(Some),
            None => Ok(None),
        }
    }

    async fn ensure_trigger(
        &self,
        key: &str,
        generate: GenerateFn,
        inactive_retention: Duration,
        interval: Duration,
        anchor: DateTime<Utc>,
    ) {
        let callback = self.regeneration_callback(key, generate, interval);
        let trace_id = Uuid::new_v4().simple().to_string();
        self.scheduler
            .ensure_scheduled(key, callback, inactive_retention, interval, anchor, Some(trace_id))
            .await;
    }

    fn regeneration_callback(
        &self,
        key: &str,
        generate: GenerateFn,
        interval: Duration,
    ) -> TriggerCallback {
        let weak = self.weak_self.clone();
        let key = key.to_owned();
        Arc::new(move || {
            let weak = weak.clone();
            let key = key.clone();
            let generate = Arc::clone(&generate);
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else { return };
                if let Err(error) = inner
                    .regenerate_if_not_underway(&key, generate, interval, true)
                    .await
                {
                    warn!(key = %key, %error, "background regeneration attempt failed");
                }
            })
        })
    }

    /// Runs at most one regeneration for `key` per process and, via the
    /// distributed lock, per farm. Callers that find the work already
    /// underway return immediately and rely on the eventual notification.
    async fn regenerate_if_not_underway(
        &self,
        key: &str,
        generate: GenerateFn,
        interval: Duration,
        is_background: bool,
    ) -> Result<(), Error> {
        // Background attempts bow out early when the entry is not yet due;
        // some other node regenerated it recently and will again.
        if is_background && self.regeneration_not_due(key, interval).await? {
            return Ok(());
        }

        let local = self
            .regeneration_locks
            .try_acquire(&format!("{}{}", self.local_lock_prefix, key), Duration::ZERO)
            .await;
        if !local.is_locked() {
            debug!(key, "regeneration already underway in this process");
            return Ok(());
        }

        let Some(farm_lock) = self
            .lock_factory
            .acquire(&format!("{}{}", self.global_lock_prefix, key), interval)
            .await?
        else {
            debug!(key, "regeneration already underway elsewhere in the farm");
            return Ok(());
        };

        let outcome = async {
            // Locked double-check: a peer may have regenerated between the
            // unlocked probe and our acquisition. Skipping the work still
            // produces a success notification; awaiters may be parked.
            let notification = if self.regeneration_not_due(key, interval).await? {
                debug!(key, "entry already fresh under the lock; skipping generation");
                ResultNotification::success(key, &self.sender_id)
            } else {
                self.generate_entry(key, &generate, interval).await
            };

            // Local awaiters first: releasing them costs nothing, while the
            // publish pays external latency.
            self.awaiters.notify(key, &notification);
            let payload = serde_json::to_string(&notification).map_err(Error::bus)?;
            self.bus.publish(&self.topic, &payload).await
        }
        .await;

        if let Err(error) = farm_lock.release().await {
            warn!(
                key,
                %error,
                "failed to release the farm regeneration lock; it expires on its own"
            );
        }
        drop(local);
        outcome
    }

    /// Whether the stored entry is recent enough that regeneration can be
    /// skipped, judged from its timestamp prefix alone.
    async fn regeneration_not_due(&self, key: &str, interval: Duration) -> Result<bool, Error> {
        let Some(prefix) = self
            .fronted
            .get_prefix(key, codec::TIMESTAMP_PREFIX_LEN)
            .await?
        else {
            return Ok(false);
        };
        let Ok(created_at) = codec::decode_timestamp(&prefix) else {
            // An unreadable entry counts as due; regenerating overwrites it.
            debug!(key, "stored entry has an unreadable timestamp prefix");
            return Ok(false);
        };
        let due_at = created_at + chrono_interval(interval)
            - chrono_interval(self.farm_clock_tolerance + self.trigger_delay);
        Ok(due_at > Utc::now())
    }

    async fn generate_entry(
        &self,
        key: &str,
        generate: &GenerateFn,
        interval: Duration,
    ) -> ResultNotification {
        let generation_started = Utc::now();
        let stopwatch = Instant::now();

        match generate().await {
            Err(error) => {
                let message = error.to_string();
                warn!(key, %message, "generation callback failed");
                ResultNotification::failure(key, &self.sender_id, message)
            }
            Ok(value) => {
                let elapsed = stopwatch.elapsed();
                if elapsed + self.farm_clock_tolerance > interval {
                    warn!(
                        key,
                        ?elapsed,
                        ?interval,
                        "generation ran longer than the interval absorbs; \
                         farm-wide cache misses become likely next cycle"
                    );
                }
                let encoded = codec::encode(generation_started, &value);
                match self
                    .fronted
                    .set(key, encoded, interval + self.cache_expiry_tolerance)
                    .await
                {
                    Ok(()) => ResultNotification::success(key, &self.sender_id),
                    Err(error) => {
                        // Awaiters on every node still need their release;
                        // the store failure travels in the notification.
                        warn!(key, %error, "failed to store the regenerated entry");
                        ResultNotification::failure(key, &self.sender_id, error.to_string())
                    }
                }
            }
        }
    }
}
