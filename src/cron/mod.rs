//! Cron scheduling.
//!
//! Invariant: every enabled schedule has exactly one pending envelope whose
//! `deliver_at` is its next occurrence; disabled schedules have none. The
//! scheduler advances on envelope completion and reconciles on startup, and
//! both paths are guarded by the schedule's `pending_envelope_id` so a
//! doubly-reported completion cannot double-advance.

pub mod expr;
pub mod types;

use crate::envelope::{Address, Envelope, EnvelopeContent, EnvelopeMetadata, NewEnvelope};
use crate::errors::{HibossError, HibossResult};
use crate::ids::{new_id, short_id};
use crate::router::events::{EnvelopeEvents, EventHub};
use crate::store::Store;
use crate::time::{now_ms, parse_timezone};
use async_trait::async_trait;
use chrono_tz::Tz;
use std::sync::Arc;
use tracing::{debug, info, warn};
use types::{CronSchedule, NewCronSchedule};

/// Outcome of a startup reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Enabled schedules that got a fresh pending envelope.
    pub materialized: usize,
    /// Stray pending envelopes cancelled (disabled schedules, misfires).
    pub cleaned: usize,
}

pub struct CronScheduler {
    store: Arc<Store>,
    events: Arc<EventHub>,
}

impl CronScheduler {
    pub fn new(store: Arc<Store>, events: Arc<EventHub>) -> Self {
        Self { store, events }
    }

    fn boss_tz(&self) -> Tz {
        self.store
            .get_config("boss_timezone")
            .ok()
            .flatten()
            .and_then(|name| name.parse().ok())
            .unwrap_or(Tz::UTC)
    }

    /// Normalize a timezone input: `"local"` and empty inherit the boss
    /// timezone (stored as NULL); anything else must be a valid IANA name.
    fn normalize_timezone(&self, input: Option<&str>) -> HibossResult<Option<String>> {
        match input {
            None => Ok(None),
            Some(raw) if raw.is_empty() || raw == "local" => Ok(None),
            Some(raw) => {
                parse_timezone(raw)?;
                Ok(Some(raw.to_string()))
            }
        }
    }

    fn schedule_tz(&self, sched: &CronSchedule) -> Tz {
        sched
            .timezone
            .as_deref()
            .and_then(|name| name.parse().ok())
            .unwrap_or_else(|| self.boss_tz())
    }

    fn next_envelope(&self, sched: &CronSchedule, after: i64) -> HibossResult<NewEnvelope> {
        let tz = self.schedule_tz(sched);
        let next = expr::next_occurrence(&sched.cron, &tz, after)?.ok_or_else(|| {
            HibossError::validation(format!(
                "Cron expression '{}' has no future occurrence",
                sched.cron
            ))
        })?;
        Ok(NewEnvelope {
            from: Address::agent(&sched.agent_name),
            to: sched.to.clone(),
            from_boss: false,
            content: EnvelopeContent::text(&sched.content),
            deliver_at: Some(next),
            metadata: EnvelopeMetadata {
                cron_schedule_id: Some(sched.id.clone()),
                ..Default::default()
            },
        })
    }

    pub async fn create_schedule(&self, input: NewCronSchedule) -> HibossResult<CronSchedule> {
        if self.store.get_agent(&input.agent_name)?.is_none() {
            return Err(HibossError::NotFound {
                entity: "agent",
                id: input.agent_name.clone(),
            });
        }
        let normalized = expr::normalize_cron_expr(&input.cron)?;
        let timezone = self.normalize_timezone(input.timezone.as_deref())?;

        let now = now_ms();
        let sched = CronSchedule {
            id: new_id(),
            agent_name: input.agent_name,
            cron: normalized,
            timezone,
            enabled: input.enabled,
            to: input.to,
            content: input.content,
            metadata: input.metadata,
            pending_envelope_id: None,
            created_at: now,
            updated_at: None,
        };

        let first = if sched.enabled {
            Some(self.next_envelope(&sched, now)?)
        } else {
            None
        };
        let env = self.store.create_cron_schedule(&sched, first)?;
        if let Some(env) = &env {
            info!(
                "cron {} created, next occurrence at {}",
                short_id(&sched.id),
                env.deliver_at.unwrap_or_default()
            );
            self.events.publish_created(env).await;
        }
        self.get_schedule(&sched.id).await
    }

    pub async fn get_schedule(&self, id: &str) -> HibossResult<CronSchedule> {
        self.store
            .get_cron_schedule(id)?
            .ok_or_else(|| HibossError::NotFound {
                entity: "cron schedule",
                id: id.to_string(),
            })
    }

    pub async fn list_schedules(&self) -> HibossResult<Vec<CronSchedule>> {
        Ok(self.store.list_cron_schedules()?)
    }

    /// Enable a schedule: dispose any pending envelope, recompute, and
    /// materialize the next occurrence.
    pub async fn enable_schedule(&self, id: &str) -> HibossResult<CronSchedule> {
        let sched = self.get_schedule(id).await?;
        let now = now_ms();
        self.store.cancel_cron_pending(id, now)?;
        self.store.update_cron_enabled(id, true, now)?;
        let next = self.next_envelope(&sched, now)?;
        if let Some(env) = self.store.advance_cron_pending(id, None, next, now)? {
            self.events.publish_created(&env).await;
        }
        self.get_schedule(id).await
    }

    pub async fn disable_schedule(&self, id: &str) -> HibossResult<CronSchedule> {
        let now = now_ms();
        // Existence check before mutating
        self.get_schedule(id).await?;
        self.store.cancel_cron_pending(id, now)?;
        self.store.update_cron_enabled(id, false, now)?;
        self.get_schedule(id).await
    }

    pub async fn delete_schedule(&self, id: &str) -> HibossResult<()> {
        self.get_schedule(id).await?;
        self.store.cancel_cron_pending(id, now_ms())?;
        self.store.delete_cron_schedule(id)?;
        Ok(())
    }

    /// Advance after an occurrence envelope completes. No-op unless the
    /// envelope is the schedule's current pending one.
    async fn advance_after_done(&self, env: &Envelope) -> HibossResult<()> {
        let Some(schedule_id) = env.metadata.cron_schedule_id.clone() else {
            return Ok(());
        };
        let Some(sched) = self.store.get_cron_schedule(&schedule_id)? else {
            debug!(
                "envelope {} references deleted cron {}",
                short_id(&env.id),
                short_id(&schedule_id)
            );
            return Ok(());
        };
        if !sched.enabled {
            return Ok(());
        }
        if sched.pending_envelope_id.as_deref() != Some(env.id.as_str()) {
            return Ok(());
        }
        let now = now_ms();
        let next = self.next_envelope(&sched, now)?;
        if let Some(new_env) = self
            .store
            .advance_cron_pending(&schedule_id, Some(&env.id), next, now)?
        {
            info!(
                "cron {} advanced, next occurrence at {}",
                short_id(&schedule_id),
                new_env.deliver_at.unwrap_or_default()
            );
            self.events.publish_created(&new_env).await;
        }
        Ok(())
    }

    /// Startup reconcile. For each enabled schedule, re-materialize when the
    /// pending envelope is missing, already consumed, or (with
    /// `skip_misfires`) due in the past. Disabled schedules with stray
    /// pending envelopes are cleaned up. Idempotent.
    pub async fn reconcile_all_schedules(
        &self,
        skip_misfires: bool,
    ) -> HibossResult<ReconcileSummary> {
        let now = now_ms();
        let mut summary = ReconcileSummary::default();

        for sched in self.store.list_cron_schedules()? {
            if !sched.enabled {
                if sched.pending_envelope_id.is_some()
                    && self.store.cancel_cron_pending(&sched.id, now)?.is_some()
                {
                    warn!(
                        "cron {} disabled but had a pending envelope, cleaned up",
                        short_id(&sched.id)
                    );
                    summary.cleaned += 1;
                }
                continue;
            }

            let pending = match &sched.pending_envelope_id {
                Some(env_id) => self.store.get_envelope(env_id)?,
                None => None,
            };
            let healthy = pending.as_ref().is_some_and(|env| {
                env.status == crate::envelope::EnvelopeStatus::Pending
                    && (!skip_misfires || !env.is_due(now))
            });
            if healthy {
                continue;
            }

            if self.store.cancel_cron_pending(&sched.id, now)?.is_some() {
                summary.cleaned += 1;
            }
            let next = self.next_envelope(&sched, now)?;
            if let Some(env) = self.store.advance_cron_pending(&sched.id, None, next, now)? {
                info!(
                    "cron {} reconciled, next occurrence at {}",
                    short_id(&sched.id),
                    env.deliver_at.unwrap_or_default()
                );
                self.events.publish_created(&env).await;
                summary.materialized += 1;
            }
        }
        Ok(summary)
    }
}

#[async_trait]
impl EnvelopeEvents for CronScheduler {
    async fn on_envelope_done(&self, env: &Envelope) {
        if let Err(e) = self.advance_after_done(env).await {
            warn!("cron advancement failed for envelope {}: {}", env.id, e);
        }
    }
}

#[cfg(test)]
mod tests;
