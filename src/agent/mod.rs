//! Agent executor.
//!
//! One serialized run loop per agent. A run drains the agent's due inbox
//! into a single provider turn, persists the results, and reports envelope
//! completion. Concurrent wake requests while a run is live collapse into a
//! queued flag checked at the run boundary; no run ever overlaps another
//! for the same agent.

pub mod session;
pub mod types;
pub mod workspace;

use crate::config::{self, DataPaths};
use crate::envelope::render::render_inbox;
use crate::errors::HibossResult;
use crate::ids::new_id;
use crate::providers::{
    CancelToken, ProviderError, ProviderFactory, ProviderSession, SessionConfig, TurnUsage,
};
use crate::router::AgentControl;
use crate::router::events::EventHub;
use crate::store::Store;
use crate::time::now_ms;
use async_trait::async_trait;
use serde::Serialize;
use session::{SessionMeta, evaluate_refresh};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use types::{AgentRun, RunStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPhase {
    Idle,
    Running { queued: bool },
}

struct ActiveRun {
    run_id: String,
    cancel: CancelToken,
}

struct LiveSession {
    session: Arc<dyn ProviderSession>,
    meta: SessionMeta,
    usage: TurnUsage,
}

#[derive(Debug, Clone)]
struct RefreshRequest {
    reason: String,
    #[allow(dead_code)]
    requested_at: i64,
}

struct AgentState {
    phase: RunPhase,
    session: Option<LiveSession>,
    pending_refresh: Option<RefreshRequest>,
    active: Option<ActiveRun>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            phase: RunPhase::Idle,
            session: None,
            pending_refresh: None,
            active: None,
        }
    }
}

/// In-memory session facts surfaced by `agent.status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_context_length: Option<u64>,
    pub cumulative_usage: TurnUsage,
}

struct ExecutorInner {
    store: Arc<Store>,
    events: Arc<EventHub>,
    providers: Arc<dyn ProviderFactory>,
    paths: DataPaths,
    agents: Mutex<HashMap<String, AgentState>>,
}

pub struct AgentExecutor {
    inner: Arc<ExecutorInner>,
}

impl AgentExecutor {
    pub fn new(
        store: Arc<Store>,
        events: Arc<EventHub>,
        providers: Arc<dyn ProviderFactory>,
        paths: DataPaths,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                store,
                events,
                providers,
                paths,
                agents: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Wake an agent. If a run is live the wake is queued; otherwise a run
    /// task starts. Never blocks on the run itself.
    pub async fn check_and_run(&self, agent_name: &str) {
        let mut agents = self.inner.agents.lock().await;
        let state = agents.entry(agent_name.to_string()).or_default();
        match &mut state.phase {
            RunPhase::Running { queued } => {
                *queued = true;
            }
            RunPhase::Idle => {
                state.phase = RunPhase::Running { queued: false };
                let inner = self.inner.clone();
                let name = agent_name.to_string();
                tokio::spawn(async move {
                    run_loop(inner, name).await;
                });
            }
        }
    }

    /// Queue a session refresh for the next run boundary.
    pub async fn request_refresh(&self, agent_name: &str, reason: &str) {
        let mut agents = self.inner.agents.lock().await;
        let state = agents.entry(agent_name.to_string()).or_default();
        state.pending_refresh = Some(RefreshRequest {
            reason: reason.to_string(),
            requested_at: now_ms(),
        });
        info!("refresh queued for agent {}: {}", agent_name, reason);
    }

    /// Abort: cancel the active run (the provider child receives its
    /// termination signal), clear the due non-cron inbox with an audit
    /// marker, and dispose the session so the next run starts fresh.
    /// Returns whether a run was live.
    pub async fn abort(&self, agent_name: &str) -> HibossResult<bool> {
        let (had_active, session) = {
            let mut agents = self.inner.agents.lock().await;
            let state = agents.entry(agent_name.to_string()).or_default();
            let had = match &state.active {
                Some(active) => {
                    info!(
                        "aborting run {} of agent {}",
                        active.run_id, agent_name
                    );
                    active.cancel.cancel();
                    true
                }
                None => false,
            };
            state.pending_refresh = None;
            (had, state.session.take().map(|live| live.session))
        };
        if let Some(session) = session {
            session.close().await;
        }

        let cancelled = self
            .inner
            .store
            .cancel_due_agent_inbox(agent_name, now_ms())?;
        if !cancelled.is_empty() {
            info!(
                "abort cleared {} due envelope(s) for agent {}",
                cancelled.len(),
                agent_name
            );
        }
        for env in &cancelled {
            self.inner.events.publish_done(env).await;
        }
        Ok(had_active)
    }

    /// Drop all in-memory state for an agent (used on agent deletion).
    pub async fn forget_agent(&self, agent_name: &str) {
        let state = {
            let mut agents = self.inner.agents.lock().await;
            agents.remove(agent_name)
        };
        if let Some(state) = state {
            if let Some(active) = &state.active {
                active.cancel.cancel();
            }
            if let Some(live) = state.session {
                live.session.close().await;
            }
        }
    }

    pub async fn is_running(&self, agent_name: &str) -> bool {
        let agents = self.inner.agents.lock().await;
        agents
            .get(agent_name)
            .is_some_and(|s| matches!(s.phase, RunPhase::Running { .. }))
    }

    pub async fn session_snapshot(&self, agent_name: &str) -> Option<SessionSnapshot> {
        let agents = self.inner.agents.lock().await;
        agents.get(agent_name).and_then(|state| {
            state.session.as_ref().map(|live| SessionSnapshot {
                created_at: live.meta.created_at,
                last_run_completed_at: live.meta.last_run_completed_at,
                last_context_length: live.meta.last_context_length,
                cumulative_usage: live.usage,
            })
        })
    }

    pub async fn status_line(&self, agent_name: &str) -> String {
        let running = self.is_running(agent_name).await;
        let session = self.session_snapshot(agent_name).await;
        let pending = self
            .inner
            .store
            .list_pending_inbox(agent_name, Some(now_ms()))
            .map(|v| v.len())
            .unwrap_or(0);
        format!(
            "{}: {}, session {}, {} due envelope(s)",
            agent_name,
            if running { "running" } else { "idle" },
            if session.is_some() { "open" } else { "none" },
            pending
        )
    }
}

#[async_trait]
impl AgentControl for AgentExecutor {
    async fn check_and_run(&self, agent_name: &str) {
        AgentExecutor::check_and_run(self, agent_name).await;
    }

    async fn request_refresh(&self, agent_name: &str, reason: &str) {
        AgentExecutor::request_refresh(self, agent_name, reason).await;
    }

    async fn abort_run(&self, agent_name: &str) -> HibossResult<bool> {
        AgentExecutor::abort(self, agent_name).await
    }

    async fn status_line(&self, agent_name: &str) -> String {
        AgentExecutor::status_line(self, agent_name).await
    }
}

/// The run loop: repeat while wakes queued up during the previous run (or
/// fresh due work appeared after a successful turn), then return to idle.
async fn run_loop(inner: Arc<ExecutorInner>, agent_name: String) {
    loop {
        let turned = match run_once(&inner, &agent_name).await {
            Ok(turned) => turned,
            Err(e) => {
                error!("run for agent {} errored: {}", agent_name, e);
                false
            }
        };

        let mut agents = inner.agents.lock().await;
        let state = agents.entry(agent_name.clone()).or_default();
        let queued = matches!(state.phase, RunPhase::Running { queued: true });
        let more_due = turned
            && inner
                .store
                .list_pending_inbox(&agent_name, Some(now_ms()))
                .map(|v| !v.is_empty())
                .unwrap_or(false);
        if queued || more_due {
            state.phase = RunPhase::Running { queued: false };
            drop(agents);
            continue;
        }
        state.phase = RunPhase::Idle;
        return;
    }
}

/// One drain-and-turn attempt. Returns true only when a provider turn
/// completed successfully (failed turns must wait for the next wake rather
/// than hot-loop on still-pending envelopes).
async fn run_once(inner: &Arc<ExecutorInner>, agent_name: &str) -> HibossResult<bool> {
    let now = now_ms();
    let Some(agent) = inner.store.get_agent(agent_name)? else {
        debug!("agent {} no longer exists, dropping state", agent_name);
        let state = {
            let mut agents = inner.agents.lock().await;
            agents.remove(agent_name)
        };
        if let Some(state) = state {
            if let Some(live) = state.session {
                live.session.close().await;
            }
        }
        return Ok(false);
    };

    let inbox = inner.store.list_pending_inbox(agent_name, Some(now))?;
    if inbox.is_empty() {
        return Ok(false);
    }

    // Run-boundary session policy: dispose the session first if required
    let to_close = {
        let mut agents = inner.agents.lock().await;
        let state = agents.entry(agent_name.to_string()).or_default();
        let manual = state.pending_refresh.take().map(|r| r.reason);
        let refresh_reason = match &state.session {
            Some(live) => manual.or_else(|| {
                agent
                    .session_policy
                    .as_ref()
                    .and_then(|p| evaluate_refresh(p, &live.meta, now))
            }),
            // No session to refresh; a queued request is satisfied by the
            // fresh session about to open
            None => None,
        };
        match refresh_reason {
            Some(reason) => {
                info!("refreshing session for agent {}: {}", agent_name, reason);
                state.session.take().map(|live| live.session)
            }
            None => None,
        }
    };
    if let Some(session) = to_close {
        session.close().await;
    }

    // Session bootstrap
    let existing = {
        let agents = inner.agents.lock().await;
        agents
            .get(agent_name)
            .and_then(|s| s.session.as_ref().map(|live| live.session.clone()))
    };
    let session = match existing {
        Some(session) => session,
        None => {
            let bindings = inner.store.list_bindings(agent_name)?;
            workspace::bootstrap(&inner.paths, &agent, &bindings)?;
            let cfg = SessionConfig {
                agent_name: agent.name.clone(),
                workspace: agent.workspace.clone(),
                provider: agent.provider,
                model: agent.model.clone(),
                reasoning_effort: agent.reasoning_effort,
            };
            let opened: Arc<dyn ProviderSession> =
                Arc::from(inner.providers.open_session(&cfg).await?);
            let mut agents = inner.agents.lock().await;
            let state = agents.entry(agent_name.to_string()).or_default();
            state.session = Some(LiveSession {
                session: opened.clone(),
                meta: SessionMeta {
                    created_at: now_ms(),
                    last_run_completed_at: None,
                    last_context_length: None,
                },
                usage: TurnUsage::default(),
            });
            opened
        }
    };

    let envelope_ids: Vec<String> = inbox.iter().map(|e| e.id.clone()).collect();
    let run = AgentRun {
        id: new_id(),
        agent_name: agent_name.to_string(),
        started_at: now,
        completed_at: None,
        envelope_ids: envelope_ids.clone(),
        final_response: None,
        context_length: None,
        status: RunStatus::Running,
        error: None,
    };
    inner.store.create_run(&run)?;

    let cancel = CancelToken::new();
    {
        let mut agents = inner.agents.lock().await;
        let state = agents.entry(agent_name.to_string()).or_default();
        state.active = Some(ActiveRun {
            run_id: run.id.clone(),
            cancel: cancel.clone(),
        });
    }

    let tz = config::boss_timezone(&inner.store);
    let prompt = render_inbox(&inbox, &tz);
    info!(
        "agent {} run {} starting with {} envelope(s)",
        agent_name,
        run.id,
        inbox.len()
    );

    let result = session.run_turn(&prompt, &cancel).await;

    {
        let mut agents = inner.agents.lock().await;
        if let Some(state) = agents.get_mut(agent_name) {
            state.active = None;
        }
    }

    match result {
        Ok(outcome) => {
            inner.store.complete_run(
                &run.id,
                &envelope_ids,
                &outcome.final_response,
                Some(outcome.usage.context_length),
                now_ms(),
            )?;
            {
                let mut agents = inner.agents.lock().await;
                if let Some(live) = agents
                    .get_mut(agent_name)
                    .and_then(|s| s.session.as_mut())
                {
                    live.meta.last_run_completed_at = Some(now_ms());
                    live.meta.last_context_length = Some(outcome.usage.context_length);
                    live.usage.accumulate(&outcome.usage);
                }
            }
            info!(
                "agent {} run {} completed ({} chars)",
                agent_name,
                run.id,
                outcome.final_response.len()
            );
            for mut env in inbox {
                env.status = crate::envelope::EnvelopeStatus::Done;
                inner.events.publish_done(&env).await;
            }
            Ok(true)
        }
        Err(ProviderError::Cancelled) => {
            inner.store.cancel_run(&run.id, now_ms())?;
            info!("agent {} run {} cancelled", agent_name, run.id);
            // abort() already cleared the inbox and disposed the session;
            // make disposal certain even on provider-initiated cancellation
            let session = {
                let mut agents = inner.agents.lock().await;
                agents
                    .get_mut(agent_name)
                    .and_then(|s| s.session.take().map(|live| live.session))
            };
            if let Some(session) = session {
                session.close().await;
            }
            Ok(false)
        }
        Err(ProviderError::Failed(msg)) => {
            inner.store.fail_run(&run.id, &msg, now_ms())?;
            warn!(
                "agent {} run {} failed, envelopes stay pending: {}",
                agent_name, run.id, msg
            );
            Ok(false)
        }
    }
}
