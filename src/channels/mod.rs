//! Channel adapter contract.
//!
//! The daemon never implements a chat platform itself; adapters are
//! supplied by the embedder and registered against the credentials that
//! agents bind to. The contract here is everything the router needs:
//! lifecycle, outbound send, and optional reactions. Platform constraints
//! (chunking, caption limits, album grouping, upload retries) are the
//! adapter's problem.

pub mod backoff;
pub mod registry;

use crate::envelope::EnvelopeContent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A message arriving from a chat platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    /// Platform-native message id.
    pub id: String,
    pub platform: String,
    pub author: ChannelAuthor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    pub chat: ChannelChat,
    pub content: EnvelopeContent,
    /// Raw platform payload, passed through untouched.
    #[serde(default)]
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAuthor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelChat {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Boss-only control command relayed by an adapter. Adapters MUST silently
/// drop commands from non-boss senders before they reach the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCommand {
    pub kind: CommandKind,
    pub author: ChannelAuthor,
    pub chat: ChannelChat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    /// `/new`: refresh the bound agent's session at the next run boundary.
    New,
    /// `/status`: report the bound agent's state.
    Status,
    /// `/abort`: cancel the bound agent's current run.
    Abort,
}

/// Options for an outbound send.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub parse_mode: Option<String>,
    /// Platform message id to thread the reply under.
    pub reply_to_message_id: Option<String>,
}

/// A send failure with platform details, surfaced through `anyhow` so the
/// router can classify it (e.g. Telegram `error_code` + description).
#[derive(Debug, Clone)]
pub struct AdapterSendError {
    pub code: Option<i64>,
    pub description: String,
}

impl fmt::Display for AdapterSendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "send failed ({}): {}", code, self.description),
            None => write!(f, "send failed: {}", self.description),
        }
    }
}

impl std::error::Error for AdapterSendError {}

/// The adapter contract. One instance serves one credential (bot token).
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Platform name, e.g. `"telegram"`.
    fn platform(&self) -> &str;

    /// Connect and begin relaying messages. Transient polling conflicts must
    /// be retried with bounded exponential backoff (see [`backoff`]).
    async fn start(&self) -> anyhow::Result<()>;

    /// Disconnect. Synchronous in effect and idempotent.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Send content to a chat. Returns the platform message id when the
    /// platform reports one.
    async fn send_message(
        &self,
        chat_id: &str,
        content: &EnvelopeContent,
        opts: &SendOptions,
    ) -> anyhow::Result<Option<String>>;

    /// Attach a reaction to a message. Optional; default is a no-op.
    async fn set_reaction(
        &self,
        _chat_id: &str,
        _channel_message_id: &str,
        _emoji: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
