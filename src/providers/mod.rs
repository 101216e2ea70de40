//! Provider session interface.
//!
//! The provider CLI (an opaque child process) lives outside the daemon; the
//! executor only needs a capability handle it can open, drive for one turn,
//! cancel, and close. Implementations are per-provider and injected at
//! daemon composition.

pub mod cli;

use crate::errors::HibossResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::Notify;

/// Which external LLM-CLI drives an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Claude,
    Codex,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Claude => "claude",
            ProviderKind::Codex => "codex",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "claude" => Some(ProviderKind::Claude),
            "codex" => Some(ProviderKind::Codex),
            _ => None,
        }
    }
}

/// Reasoning effort hint passed through to the provider. `None` on the agent
/// record means provider default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    None,
    Low,
    Medium,
    High,
    Xhigh,
}

impl ReasoningEffort {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasoningEffort::None => "none",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
            ReasoningEffort::Xhigh => "xhigh",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(ReasoningEffort::None),
            "low" => Some(ReasoningEffort::Low),
            "medium" => Some(ReasoningEffort::Medium),
            "high" => Some(ReasoningEffort::High),
            "xhigh" => Some(ReasoningEffort::Xhigh),
            _ => None,
        }
    }
}

/// Token accounting for one turn. Only `context_length` is persisted; the
/// rest feeds the session's cumulative audit counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TurnUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub context_length: u64,
}

impl TurnUsage {
    pub fn accumulate(&mut self, other: &TurnUsage) {
        self.input += other.input;
        self.output += other.output;
        self.total += other.total;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
        // Context length is a gauge, not a counter
        self.context_length = other.context_length;
    }
}

/// Result of one provider turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub final_response: String,
    pub usage: TurnUsage,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The turn was cancelled; the child received a termination signal.
    #[error("turn cancelled")]
    Cancelled,
    #[error("provider failed: {0}")]
    Failed(String),
}

/// Cooperative cancellation handle shared between the executor and a running
/// turn. `cancel()` is sticky.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves when `cancel()` is called. Safe to race with completion in a
    /// `select!`.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let wait = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        wait.await;
    }
}

/// Everything a provider needs to open a session for an agent.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub agent_name: String,
    pub workspace: PathBuf,
    pub provider: ProviderKind,
    pub model: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
}

/// One live provider session. A session owns whatever external state the
/// provider keeps (conversation handle, child process pool) and is disposed
/// on refresh.
#[async_trait]
pub trait ProviderSession: Send + Sync {
    /// Run one turn to completion. Implementations must observe `cancel`:
    /// signal the child (SIGTERM, then SIGKILL after a bounded grace) and
    /// return `ProviderError::Cancelled`.
    async fn run_turn(
        &self,
        prompt: &str,
        cancel: &CancelToken,
    ) -> Result<TurnOutcome, ProviderError>;

    /// Release external resources. Idempotent.
    async fn close(&self);
}

/// Opens provider sessions. The daemon composition root supplies the real
/// CLI-backed factory; tests supply fakes.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn open_session(&self, cfg: &SessionConfig) -> HibossResult<Box<dyn ProviderSession>>;
}

/// Environment variables that would redirect provider state away from the
/// canonical `~/.claude` / `~/.codex` homes. Cleared before spawning
/// provider children.
pub const PROVIDER_HOME_OVERRIDES: &[&str] = &["CLAUDE_CONFIG_DIR", "CODEX_HOME"];

/// Scrub provider home overrides from a child command's environment.
pub fn scrub_provider_env(cmd: &mut tokio::process::Command) {
    for var in PROVIDER_HOME_OVERRIDES {
        cmd.env_remove(var);
    }
}
