//! Envelope lifecycle events.
//!
//! The router publishes; the one-shot and cron schedulers subscribe. This is
//! the seam that keeps router, scheduler, and cron from holding references
//! to each other.

use crate::envelope::Envelope;
use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};

/// Subscriber interface for envelope lifecycle events. Both hooks default to
/// no-ops so subscribers implement only what they care about.
#[async_trait]
pub trait EnvelopeEvents: Send + Sync {
    async fn on_envelope_created(&self, _env: &Envelope) {}
    async fn on_envelope_done(&self, _env: &Envelope) {}
}

/// Fan-out of envelope events to registered subscribers.
#[derive(Default)]
pub struct EventHub {
    subscribers: RwLock<Vec<Arc<dyn EnvelopeEvents>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EnvelopeEvents>) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscriber);
    }

    fn snapshot(&self) -> Vec<Arc<dyn EnvelopeEvents>> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn publish_created(&self, env: &Envelope) {
        for sub in self.snapshot() {
            sub.on_envelope_created(env).await;
        }
    }

    pub async fn publish_done(&self, env: &Envelope) {
        for sub in self.snapshot() {
            sub.on_envelope_done(env).await;
        }
    }
}
