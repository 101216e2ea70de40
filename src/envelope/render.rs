//! Agent-facing envelope rendering.
//!
//! Each inbound envelope is rendered into a plain-text block the provider
//! can read: a short header of routing facts, a blank line, then the body.

use crate::envelope::Envelope;
use crate::ids::short_id;
use crate::time::format_in_tz;
use chrono_tz::Tz;
use std::fmt::Write;

/// Render one envelope as an instruction block.
pub fn render_envelope(env: &Envelope, tz: &Tz) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "from: {}", env.from);

    if env.from.is_channel() {
        if let Some(author) = &env.metadata.author {
            let name = author
                .display_name
                .as_deref()
                .or(author.username.as_deref())
                .unwrap_or(&author.id);
            let boss = if env.from_boss { " [boss]" } else { "" };
            let place = match &env.metadata.chat {
                Some(chat) => match &chat.name {
                    Some(n) => format!("group \"{}\"", n),
                    None => "private chat".to_string(),
                },
                None => "private chat".to_string(),
            };
            let _ = writeln!(out, "sender: {}{} in {}", name, boss, place);
        }
        if let Some(msg_id) = &env.metadata.channel_message_id {
            let _ = writeln!(out, "channel-message-id: {}", msg_id);
        }
    }

    let _ = writeln!(out, "created-at: {}", format_in_tz(env.created_at, tz));
    if let Some(at) = env.deliver_at {
        let _ = writeln!(out, "deliver-at: {}", format_in_tz(at, tz));
    }
    if let Some(cron_id) = &env.metadata.cron_schedule_id {
        let _ = writeln!(out, "cron-id: {}", short_id(cron_id));
    }

    out.push('\n');
    match env.content.text.as_deref() {
        Some(text) if !text.is_empty() => out.push_str(text),
        _ => out.push_str("(none)"),
    }

    if !env.content.attachments.is_empty() {
        out.push_str("\nattachments:\n");
        for att in &env.content.attachments {
            let _ = writeln!(
                out,
                "- [{}] {} ({})",
                att.kind().as_str(),
                att.display_name(),
                att.source
            );
        }
        // Drop the trailing newline so blocks join cleanly
        out.truncate(out.trim_end_matches('\n').len());
    }

    out
}

/// Render a batch of envelopes into a single prompt body, separated by
/// rules. The order is the drain order.
pub fn render_inbox(envelopes: &[Envelope], tz: &Tz) -> String {
    envelopes
        .iter()
        .map(|e| render_envelope(e, tz))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}
