use crate::errors::{HibossError, HibossResult};
use crate::providers::{ProviderKind, ReasoningEffort};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Permission tiers, ordered. Comparison is the authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Restricted,
    Standard,
    Privileged,
    Boss,
}

impl PermissionLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionLevel::Restricted => "restricted",
            PermissionLevel::Standard => "standard",
            PermissionLevel::Privileged => "privileged",
            PermissionLevel::Boss => "boss",
        }
    }

    pub fn parse(s: &str) -> HibossResult<Self> {
        match s {
            "restricted" => Ok(PermissionLevel::Restricted),
            "standard" => Ok(PermissionLevel::Standard),
            "privileged" => Ok(PermissionLevel::Privileged),
            "boss" => Ok(PermissionLevel::Boss),
            other => Err(HibossError::validation(format!(
                "Unknown permission level '{}'",
                other
            ))),
        }
    }
}

/// Session refresh policy. All fields optional; absent means the session
/// lives until a manual refresh.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionPolicy {
    /// Host-local wall-clock time (`"HH:MM"`): refresh when the most recent
    /// occurrence falls inside the current session's lifetime.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_reset_at: Option<String>,
    /// Humantime duration (`"30m"`, `"2h"`): refresh when idle longer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<String>,
    /// Refresh before the next run once the last context length exceeds this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_context_length: Option<u64>,
}

impl SessionPolicy {
    /// Validate field formats without evaluating them.
    pub fn validate(&self) -> HibossResult<()> {
        if let Some(at) = &self.daily_reset_at {
            crate::time::parse_clock_time(at)?;
        }
        if let Some(idle) = &self.idle_timeout {
            humantime::parse_duration(idle).map_err(|e| {
                HibossError::validation(format!("Invalid idle timeout '{}': {}", idle, e))
            })?;
        }
        Ok(())
    }
}

/// A registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub name: String,
    /// Live secret. Exactly one per agent; rotated by re-registering.
    #[serde(skip_serializing)]
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub workspace: PathBuf,
    pub provider: ProviderKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    pub permission_level: PermissionLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_policy: Option<SessionPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<i64>,
}

/// Association of an agent with a channel adapter credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentBinding {
    pub agent_name: String,
    pub adapter_type: String,
    pub adapter_token: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> HibossResult<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(HibossError::validation(format!(
                "Unknown run status '{}'",
                other
            ))),
        }
    }
}

/// One provider invocation draining an agent's due inbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRun {
    pub id: String,
    pub agent_name: String,
    pub started_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    pub envelope_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u64>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
