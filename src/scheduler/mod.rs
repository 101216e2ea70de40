//! One-shot envelope scheduler.
//!
//! A single consumer task owns the timer: each pass ("tick") drains due
//! channel envelopes through the router, wakes agents whose inbox has due
//! work, then re-arms a timer for the nearest future `deliver_at`. Wake
//! requests while a tick is in flight collapse into exactly one follow-up
//! tick (the notify permit), so at most one tick ever executes at a time.

use crate::router::{AgentControl, Router};
use crate::router::events::EnvelopeEvents;
use crate::envelope::Envelope;
use crate::store::Store;
use crate::time::now_ms;
use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Max channel envelopes delivered per tick; a full batch re-queues an
/// immediate follow-up so large backlogs drain in order.
const DRAIN_CAP: usize = 100;
/// Largest representable one-shot timer (~24.8 days). Farther deadlines are
/// clamped; the wake re-arms until the real due time is reachable.
const MAX_TIMER_MS: i64 = i32::MAX as i64;
/// Floor applied when due work remains undeliverable after a tick, so a
/// dead adapter cannot hot-spin the loop.
const RETRY_FLOOR_MS: i64 = 5_000;

struct Inner {
    store: Arc<Store>,
    router: Arc<Router>,
    wake: Notify,
    agent_handler: RwLock<Option<Arc<dyn AgentControl>>>,
}

pub struct EnvelopeScheduler {
    inner: Arc<Inner>,
}

/// Event-hub subscriber handle: envelope creation re-arms the timer.
pub struct SchedulerEvents {
    inner: Arc<Inner>,
}

#[async_trait]
impl EnvelopeEvents for SchedulerEvents {
    async fn on_envelope_created(&self, _env: &Envelope) {
        self.inner.wake.notify_one();
    }
}

impl EnvelopeScheduler {
    pub fn new(store: Arc<Store>, router: Arc<Router>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                router,
                wake: Notify::new(),
                agent_handler: RwLock::new(None),
            }),
        }
    }

    pub fn set_agent_handler(&self, handler: Arc<dyn AgentControl>) {
        *self
            .inner
            .agent_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Subscriber handle for the event hub.
    pub fn events_handle(&self) -> Arc<SchedulerEvents> {
        Arc::new(SchedulerEvents {
            inner: self.inner.clone(),
        })
    }

    /// Request a tick (idempotent while one is already queued).
    pub fn request_wake(&self) {
        self.inner.wake.notify_one();
    }

    /// The next wake deadline in epoch ms, for status reporting.
    pub fn next_wake_at(&self) -> Option<i64> {
        self.inner.store.next_future_deliver_at(now_ms()).ok()?
    }

    /// Start the scheduler loop. The first tick runs immediately (startup
    /// drain); the task exits when `shutdown` flips to true.
    pub fn start(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            info!("envelope scheduler started");
            let mut reason = "startup";
            loop {
                let tick_started = now_ms();
                let full_batch = tick(&inner, tick_started, reason).await;
                if full_batch {
                    // Backlog: immediate follow-up, but yield first instead
                    // of recursing synchronously
                    reason = "backlog";
                    tokio::task::yield_now().await;
                    continue;
                }

                // Anchor the wake computation at the tick's start so an
                // envelope that became due mid-tick still counts as future
                // and re-arms an (almost) immediate timer
                let delay = next_delay(&inner, tick_started);
                debug!("scheduler sleeping {:?}", delay);
                tokio::select! {
                    () = inner.wake.notified() => reason = "wake",
                    () = tokio::time::sleep(delay) => reason = "timer",
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        reason = "wake";
                    }
                }
            }
            info!("envelope scheduler stopped");
        })
    }
}

/// One scheduler pass. Returns true when the drain cap was reached.
async fn tick(inner: &Inner, now: i64, reason: &str) -> bool {
    debug!("scheduler tick ({})", reason);

    let due = match inner.store.list_due_channel_envelopes(now, DRAIN_CAP) {
        Ok(due) => due,
        Err(e) => {
            warn!("tick: listing due channel envelopes failed: {}", e);
            return false;
        }
    };
    let drained = due.len();
    for env in due {
        if let Err(e) = inner.router.deliver_envelope(&env).await {
            // Recorded on the envelope by the router; the envelope stays
            // pending for a later retry
            warn!("tick: delivery of envelope {} failed: {}", env.id, e);
        }
    }

    match inner.store.list_agent_names_with_due_envelopes(now) {
        Ok(names) => {
            let handler = inner
                .agent_handler
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(handler) = handler {
                for name in names {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler.check_and_run(&name).await;
                    });
                }
            } else if !names.is_empty() {
                debug!("tick: {} agents due but no handler registered", names.len());
            }
        }
        Err(e) => warn!("tick: listing due agents failed: {}", e),
    }

    drained == DRAIN_CAP
}

/// Delay until the next wake: the nearest `deliver_at` after `anchor` (the
/// last tick's start), clamped; a retry floor when an undeliverable channel
/// backlog remains.
fn next_delay(inner: &Inner, anchor: i64) -> Duration {
    let now = now_ms();
    let backlog = inner.store.has_due_channel_backlog(now).unwrap_or(false);
    let next_future = inner.store.next_future_deliver_at(anchor).ok().flatten();

    let mut delay_ms = match next_future {
        Some(at) => (at - now).clamp(0, MAX_TIMER_MS),
        None => MAX_TIMER_MS,
    };
    if backlog {
        delay_ms = delay_ms.min(RETRY_FLOOR_MS);
    }
    Duration::from_millis(delay_ms as u64)
}

#[cfg(test)]
mod tests;
