//! End-to-end message flow: channel inbound through agent turn, and agent
//! outbound back through the channel.

mod common;

use common::{Harness, wait_until};
use hiboss::agent::types::RunStatus;
use hiboss::channels::{ChannelAuthor, ChannelChat, ChannelMessage};
use hiboss::envelope::{Address, EnvelopeContent, EnvelopeMetadata, EnvelopeStatus, NewEnvelope};

fn boss_message(id: &str, text: &str) -> ChannelMessage {
    ChannelMessage {
        id: id.to_string(),
        platform: "telegram".to_string(),
        author: ChannelAuthor {
            id: "42".to_string(),
            username: Some("kky1024".to_string()),
            display_name: Some("Kevin".to_string()),
        },
        in_reply_to: None,
        chat: ChannelChat {
            id: "6447779930".to_string(),
            name: None,
        },
        content: EnvelopeContent::text(text),
        raw: serde_json::Value::Null,
    }
}

#[tokio::test]
async fn telegram_boss_message_drives_a_full_agent_turn() {
    let h = Harness::new();
    h.register_bound_agent("nex");
    h.provider.push_response("Hello Kevin!");

    let env = h
        .daemon
        .router
        .inbound_from_channel("telegram", "T1", boss_message("101", "hello"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(env.from, Address::channel("telegram", "6447779930"));
    assert_eq!(env.to, Address::agent("nex"));
    assert!(env.from_boss);
    assert_eq!(env.status, EnvelopeStatus::Pending);

    // The wake triggers a run that drains the envelope
    let done = wait_until(
        || {
            h.daemon
                .store
                .get_envelope(&env.id)
                .unwrap()
                .unwrap()
                .status
                == EnvelopeStatus::Done
        },
        3_000,
    )
    .await;
    assert!(done, "inbound envelope should be drained by the agent run");

    let runs = h.daemon.store.list_runs_for_agent("nex", 10).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Completed);
    assert_eq!(runs[0].envelope_ids, vec![env.id.clone()]);
    assert_eq!(runs[0].final_response.as_deref(), Some("Hello Kevin!"));
    assert_eq!(runs[0].context_length, Some(2_000));
}

#[tokio::test]
async fn agent_reply_threads_back_to_the_originating_chat() {
    let h = Harness::new();
    h.register_bound_agent("nex");

    let inbound = h
        .daemon
        .router
        .inbound_from_channel("telegram", "T1", boss_message("200", "question?"))
        .await
        .unwrap()
        .unwrap();
    wait_until(
        || h.daemon.store.count_pending_envelopes().unwrap() == 0,
        3_000,
    )
    .await;

    // The agent answers, threading under the inbound message
    let (outbound, deliver_error) = h
        .daemon
        .router
        .route_envelope(NewEnvelope {
            from: Address::agent("nex"),
            to: Address::channel("telegram", "6447779930"),
            from_boss: false,
            content: EnvelopeContent::text("the answer"),
            deliver_at: None,
            metadata: EnvelopeMetadata {
                reply_to_envelope_id: Some(inbound.id.clone()),
                ..Default::default()
            },
        })
        .await
        .unwrap();
    assert!(deliver_error.is_none());

    let sent = h.adapter.sent();
    let reply = sent.last().unwrap();
    assert_eq!(reply.chat_id, "6447779930");
    assert_eq!(reply.text, "the answer");
    assert_eq!(reply.reply_to_message_id.as_deref(), Some("200"));

    assert_eq!(
        h.daemon
            .store
            .get_envelope(&outbound.id)
            .unwrap()
            .unwrap()
            .status,
        EnvelopeStatus::Done
    );
}

#[tokio::test]
async fn workspace_is_bootstrapped_on_first_session() {
    let h = Harness::new();
    h.register_bound_agent("nex");

    h.daemon
        .router
        .inbound_from_channel("telegram", "T1", boss_message("300", "hi"))
        .await
        .unwrap()
        .unwrap();
    assert!(
        wait_until(
            || h.daemon.store.count_pending_envelopes().unwrap() == 0,
            3_000,
        )
        .await
    );

    let internal = h.daemon.paths.agent_internal_space("nex");
    assert!(internal.join("MEMORY.md").exists());
    assert!(internal.join("AGENT.md").exists());
    assert!(h.workspace("nex").is_dir());
}
