// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Expiry-driven per-key trigger scheduling.
//!
//! A [`TriggerScheduler`] holds at most one trigger per key in a local TTL
//! map whose entries expire exactly at their target callback time. Natural
//! expiry is the timer: an eviction listener hands the expired trigger to a
//! worker which re-arms it for the next interval (while the key is still
//! active) and fires its callback on a fresh task. TTL maps evict lazily, so
//! every scheduled trigger also gets a best-effort one-shot probe just past
//! its target that forces the map to notice the expiry.
//!
//! A trigger stays alive while requests keep touching its key
//! ([`update_last_activity`](TriggerScheduler::update_last_activity)); once
//! the key has been idle for its retention window, the expired trigger is
//! simply not re-armed and the schedule dies until the next request re-arms
//! it.

use std::{
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use moka::{Expiry, future::Cache, notification::RemovalCause};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Callback fired once per interval while a key stays active.
pub type TriggerCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Trigger {
    key: String,
    callback: TriggerCallback,
    inactive_retention: Duration,
    interval: Duration,
    /// The absolute instant this trigger fires; also its map expiry.
    target: DateTime<Utc>,
    last_active: Mutex<DateTime<Utc>>,
    trace_id: Option<String>,
}

/// Expires each trigger exactly at its target callback time.
struct TargetExpiry;

impl Expiry<String, Arc<Trigger>> for TargetExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        trigger: &Arc<Trigger>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(until(trigger.target))
    }
}

/// One self-perpetuating trigger per active key, driven by map expiry.
pub struct TriggerScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    weak_self: Weak<SchedulerInner>,
    triggers: Cache<String, Arc<Trigger>>,
    minimum_forward_scheduling: Duration,
    trigger_delay: Duration,
}

impl TriggerScheduler {
    /// Creates a scheduler for `keyspace`.
    ///
    /// Must be called from within a tokio runtime; the scheduler owns a
    /// worker task that serves expired triggers.
    #[must_use]
    pub fn new(
        keyspace: &str,
        minimum_forward_scheduling: Duration,
        trigger_delay: Duration,
    ) -> Self {
        let (expired_tx, mut expired_rx) = mpsc::unbounded_channel::<Arc<Trigger>>();

        let inner = Arc::new_cyclic(|weak_self: &Weak<SchedulerInner>| {
            let triggers = Cache::builder()
                .name(&format!("TriggerScheduler_{keyspace}"))
                .expire_after(TargetExpiry)
                .eviction_listener(move |_key, trigger: Arc<Trigger>, cause| {
                    // Natural expiry is the timer; explicit invalidation and
                    // replacement must not fire anything.
                    if cause == RemovalCause::Expired {
                        let _ = expired_tx.send(trigger);
                    }
                })
                .build();
            SchedulerInner {
                weak_self: weak_self.clone(),
                triggers,
                minimum_forward_scheduling,
                trigger_delay,
            }
        });

        let worker = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(trigger) = expired_rx.recv().await {
                let Some(inner) = worker.upgrade() else { break };
                tokio::spawn(async move { inner.serve_expired(trigger).await });
            }
        });

        Self { inner }
    }

    /// Schedules a trigger for `key` unless one already exists.
    ///
    /// The next fire time is `prev_callback_start + interval`, floored to
    /// now plus the minimum forward scheduling window. Returns whether this
    /// call installed the trigger (`false` if one existed or a concurrent
    /// inserter won).
    pub async fn ensure_scheduled(
        &self,
        key: &str,
        callback: TriggerCallback,
        inactive_retention: Duration,
        interval: Duration,
        prev_callback_start: DateTime<Utc>,
        trace_id: Option<String>,
    ) -> bool {
        self.inner
            .ensure(
                key,
                callback,
                inactive_retention,
                interval,
                prev_callback_start,
                None,
                trace_id,
            )
            .await
    }

    /// Marks `key` as active now, keeping its trigger re-arming.
    ///
    /// Returns `false` if no trigger exists for the key. The probe itself
    /// can push a just-due trigger through expiry-and-re-arm, so a miss is
    /// retried once after letting the map's housekeeping settle.
    pub async fn update_last_activity(&self, key: &str) -> bool {
        if self.touch(key).await {
            return true;
        }
        self.inner.triggers.run_pending_tasks().await;
        self.touch(key).await
    }

    /// Whether a trigger currently exists for `key`.
    #[must_use]
    pub async fn is_scheduled(&self, key: &str) -> bool {
        self.inner.triggers.get(key).await.is_some()
    }

    async fn touch(&self, key: &str) -> bool {
        let Some(trigger) = self.inner.triggers.get(key).await else {
            return false;
        };
        let now = Utc::now();
        let mut last_active = trigger.last_active.lock();
        if now > *last_active {
            *last_active = now;
        }
        true
    }
}

impl SchedulerInner {
    #[expect(clippy::too_many_arguments, reason = "internal fan-in for the public and re-arm paths")]
    async fn ensure(
        &self,
        key: &str,
        callback: TriggerCallback,
        inactive_retention: Duration,
        interval: Duration,
        prev_callback_start: DateTime<Utc>,
        last_active: Option<DateTime<Utc>>,
        trace_id: Option<String>,
    ) -> bool {
        if self.triggers.get(key).await.is_some() {
            return false;
        }

        let now = Utc::now();
        let mut target = prev_callback_start + chrono_interval(interval);
        let floor = now + chrono_interval(self.minimum_forward_scheduling);
        if target < floor {
            target = floor;
        }

        let trigger = Arc::new(Trigger {
            key: key.to_owned(),
            callback,
            inactive_retention,
            interval,
            target,
            last_active: Mutex::new(last_active.unwrap_or(now)),
            trace_id,
        });
        let entry = self
            .triggers
            .entry(key.to_owned())
            .or_insert_with(std::future::ready(Arc::clone(&trigger)))
            .await;
        if !entry.is_fresh() {
            return false;
        }

        debug!(key, target = %target, trace_id = ?trigger.trace_id, "trigger scheduled");
        self.spawn_expiry_probe(key.to_owned(), target);
        true
    }

    /// The map only observes expiry when touched, so poke it just past the
    /// target. Worst case the probe finds nothing to do.
    fn spawn_expiry_probe(&self, key: String, target: DateTime<Utc>) {
        let delay = until(target) + self.trigger_delay;
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                let _ = inner.triggers.get(&key).await;
                inner.triggers.run_pending_tasks().await;
            }
        });
    }

    async fn serve_expired(&self, trigger: Arc<Trigger>) {
        let now = Utc::now();
        let last_active = *trigger.last_active.lock();
        let idle = (now - last_active).to_std().unwrap_or(Duration::ZERO);

        if idle >= trigger.inactive_retention {
            debug!(
                key = %trigger.key,
                trace_id = ?trigger.trace_id,
                "trigger retired after inactivity"
            );
            return;
        }

        // Re-arm before firing, anchored at the nominal target and carrying
        // the original last_active so background work never extends the
        // trigger's own life.
        self.ensure(
            &trigger.key,
            Arc::clone(&trigger.callback),
            trigger.inactive_retention,
            trigger.interval,
            trigger.target,
            Some(last_active),
            trigger.trace_id.clone(),
        )
        .await;

        (trigger.callback)().await;
    }
}

pub(crate) fn chrono_interval(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

fn until(target: DateTime<Utc>) -> Duration {
    (target - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}
