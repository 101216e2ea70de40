//! Envelopes and addresses.
//!
//! An envelope is the sole unit of communication: a durable, addressable,
//! schedulable message record. Addresses are tagged strings naming either an
//! agent or a channel endpoint.

pub mod render;

use crate::errors::{DeliveryErrorKind, HibossError, HibossResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Validate an agent name: `[a-z0-9][a-z0-9-]{0,63}`.
pub fn validate_agent_name(name: &str) -> HibossResult<()> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if ok {
        Ok(())
    } else {
        Err(HibossError::validation(format!(
            "Invalid agent name '{}' (expected [a-z0-9][a-z0-9-]{{0,63}})",
            name
        )))
    }
}

fn validate_adapter_type(adapter: &str) -> HibossResult<()> {
    if !adapter.is_empty() && adapter.chars().all(|c| c.is_ascii_lowercase()) {
        Ok(())
    } else {
        Err(HibossError::validation(format!(
            "Invalid adapter type '{}' (expected lowercase letters)",
            adapter
        )))
    }
}

/// A routing address: `agent:<name>` or `channel:<adapter-type>:<chat-id>`.
///
/// Chat ids are opaque and may themselves contain `:`; only the first two
/// segments of a channel address are structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Agent(String),
    Channel { adapter: String, chat_id: String },
}

impl Address {
    pub fn agent(name: impl Into<String>) -> Self {
        Address::Agent(name.into())
    }

    pub fn channel(adapter: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Address::Channel {
            adapter: adapter.into(),
            chat_id: chat_id.into(),
        }
    }

    pub fn parse(input: &str) -> HibossResult<Self> {
        if let Some(name) = input.strip_prefix("agent:") {
            validate_agent_name(name)?;
            return Ok(Address::Agent(name.to_string()));
        }
        if let Some(rest) = input.strip_prefix("channel:") {
            let (adapter, chat_id) = rest.split_once(':').ok_or_else(|| {
                HibossError::validation(format!(
                    "Invalid channel address '{}' (expected channel:<adapter>:<chat-id>)",
                    input
                ))
            })?;
            validate_adapter_type(adapter)?;
            if chat_id.is_empty() {
                return Err(HibossError::validation(format!(
                    "Empty chat id in address '{}'",
                    input
                )));
            }
            return Ok(Address::Channel {
                adapter: adapter.to_string(),
                chat_id: chat_id.to_string(),
            });
        }
        Err(HibossError::validation(format!(
            "Invalid address '{}' (expected agent:<name> or channel:<adapter>:<chat-id>)",
            input
        )))
    }

    pub fn is_agent(&self) -> bool {
        matches!(self, Address::Agent(_))
    }

    pub fn is_channel(&self) -> bool {
        matches!(self, Address::Channel { .. })
    }

    pub fn agent_name(&self) -> Option<&str> {
        match self {
            Address::Agent(name) => Some(name),
            Address::Channel { .. } => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Agent(name) => write!(f, "agent:{}", name),
            Address::Channel { adapter, chat_id } => write!(f, "channel:{}:{}", adapter, chat_id),
        }
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Address::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Video,
    Audio,
    File,
}

const IMAGE_EXTS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "heic"];
const VIDEO_EXTS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm", "m4v"];
const AUDIO_EXTS: &[&str] = &["mp3", "wav", "ogg", "oga", "m4a", "flac", "opus"];

impl AttachmentKind {
    /// Infer the kind from a filename or source path extension.
    pub fn infer(name: &str) -> Self {
        let ext = name
            .rsplit('.')
            .next()
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if IMAGE_EXTS.contains(&ext.as_str()) {
            AttachmentKind::Image
        } else if VIDEO_EXTS.contains(&ext.as_str()) {
            AttachmentKind::Video
        } else if AUDIO_EXTS.contains(&ext.as_str()) {
            AttachmentKind::Audio
        } else {
            AttachmentKind::File
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Video => "video",
            AttachmentKind::Audio => "audio",
            AttachmentKind::File => "file",
        }
    }
}

/// A message attachment. `source` is a local path, URL, or platform file id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram_file_id: Option<String>,
}

impl Attachment {
    pub fn kind(&self) -> AttachmentKind {
        AttachmentKind::infer(self.filename.as_deref().unwrap_or(&self.source))
    }

    /// Best display name for the attachment.
    pub fn display_name(&self) -> &str {
        self.filename.as_deref().unwrap_or_else(|| {
            self.source
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or(&self.source)
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvelopeContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl EnvelopeContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            attachments: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.as_deref().map_or(true, str::is_empty) && self.attachments.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Pending,
    Done,
}

impl EnvelopeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeStatus::Pending => "pending",
            EnvelopeStatus::Done => "done",
        }
    }

    pub fn parse(s: &str) -> HibossResult<Self> {
        match s {
            "pending" => Ok(EnvelopeStatus::Pending),
            "done" => Ok(EnvelopeStatus::Done),
            other => Err(HibossError::validation(format!(
                "Unknown envelope status '{}'",
                other
            ))),
        }
    }
}

/// Message author, as reported by the channel platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorMeta {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMeta {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Recorded failure of the most recent delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryErrorMeta {
    pub kind: DeliveryErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub at: i64,
}

/// Envelope metadata: the known keys the router and executor act on, plus a
/// residual blob for anything callers attach. Opaque to the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvelopeMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<AuthorMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat: Option<ChatMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_envelope_id: Option<String>,
    /// Legacy key. Carried through storage untouched; the router does not
    /// honor it for reply threading.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron_schedule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_delivery_error: Option<DeliveryErrorMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl EnvelopeMetadata {
    pub fn is_empty(&self) -> bool {
        self.platform.is_none()
            && self.channel_message_id.is_none()
            && self.author.is_none()
            && self.chat.is_none()
            && self.in_reply_to.is_none()
            && self.reply_to_envelope_id.is_none()
            && self.reply_to_message_id.is_none()
            && self.parse_mode.is_none()
            && self.cron_schedule_id.is_none()
            && self.last_delivery_error.is_none()
            && self.cancelled.is_none()
            && self.extra.is_empty()
    }
}

/// A durable message record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    pub from: Address,
    pub to: Address,
    pub from_boss: bool,
    pub content: EnvelopeContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deliver_at: Option<i64>,
    pub status: EnvelopeStatus,
    pub created_at: i64,
    #[serde(skip_serializing_if = "EnvelopeMetadata::is_empty")]
    pub metadata: EnvelopeMetadata,
}

impl Envelope {
    /// Whether the envelope is due for delivery at `now`. A missing
    /// `deliver_at` means due immediately.
    pub fn is_due(&self, now: i64) -> bool {
        self.deliver_at.is_none_or(|at| at <= now)
    }

    pub fn is_cron_origin(&self) -> bool {
        self.metadata.cron_schedule_id.is_some()
    }
}

/// Input for creating an envelope. The store assigns id, status and
/// `created_at`.
#[derive(Debug, Clone)]
pub struct NewEnvelope {
    pub from: Address,
    pub to: Address,
    pub from_boss: bool,
    pub content: EnvelopeContent,
    pub deliver_at: Option<i64>,
    pub metadata: EnvelopeMetadata,
}
