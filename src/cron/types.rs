use crate::envelope::Address;
use serde::{Deserialize, Serialize};

/// A recurring schedule. While enabled, exactly one pending envelope
/// materializes its next occurrence; `pending_envelope_id` points at it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronSchedule {
    pub id: String,
    pub agent_name: String,
    /// Normalized 6-field expression as stored.
    pub cron: String,
    /// IANA timezone; `None` inherits the boss timezone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    pub enabled: bool,
    pub to: Address,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_envelope_id: Option<String>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

/// Input for `CronScheduler::create_schedule`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCronSchedule {
    pub agent_name: String,
    pub cron: String,
    #[serde(default)]
    pub timezone: Option<String>,
    pub to: Address,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}
