//! Scheduled (deliver-at) flow through the live scheduler.

mod common;

use common::{Harness, wait_until};
use hiboss::envelope::{Address, EnvelopeContent, EnvelopeMetadata, EnvelopeStatus, NewEnvelope};
use hiboss::time::now_ms;
use std::time::Duration;

#[tokio::test]
async fn future_channel_envelope_delivers_when_due() {
    let h = Harness::new();
    h.register_bound_agent("nex");
    let handle = h.daemon.scheduler.start(h.shutdown_tx.subscribe());

    let deliver_at = now_ms() + 400;
    let (env, deliver_error) = h
        .daemon
        .router
        .route_envelope(NewEnvelope {
            from: Address::agent("nex"),
            to: Address::channel("telegram", "123"),
            from_boss: false,
            content: EnvelopeContent::text("ping"),
            deliver_at: Some(deliver_at),
            metadata: EnvelopeMetadata::default(),
        })
        .await
        .unwrap();
    assert!(deliver_error.is_none(), "not due yet, nothing to deliver");

    // Before the due time: pending, and the scheduler's next wake targets it
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        h.daemon.store.get_envelope(&env.id).unwrap().unwrap().status,
        EnvelopeStatus::Pending
    );
    assert_eq!(h.daemon.scheduler.next_wake_at(), Some(deliver_at));
    assert!(h.adapter.sent().is_empty());

    // After: delivered
    let delivered = wait_until(
        || {
            h.daemon.store.get_envelope(&env.id).unwrap().unwrap().status
                == EnvelopeStatus::Done
        },
        3_000,
    )
    .await;
    assert!(delivered, "scheduler should deliver at the due time");
    assert_eq!(h.adapter.sent().len(), 1);

    h.shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn future_agent_envelope_wakes_executor_when_due() {
    let h = Harness::new();
    h.register_bound_agent("nex");
    h.provider.push_response("on it");
    let handle = h.daemon.scheduler.start(h.shutdown_tx.subscribe());

    let (env, _) = h
        .daemon
        .router
        .route_envelope(NewEnvelope {
            from: Address::agent("boss"),
            to: Address::agent("nex"),
            from_boss: true,
            content: EnvelopeContent::text("reminder"),
            deliver_at: Some(now_ms() + 300),
            metadata: EnvelopeMetadata::default(),
        })
        .await
        .unwrap();

    let done = wait_until(
        || {
            h.daemon.store.get_envelope(&env.id).unwrap().unwrap().status
                == EnvelopeStatus::Done
        },
        3_000,
    )
    .await;
    assert!(done, "agent envelope should be drained after deliver-at");

    let runs = h.daemon.store.list_runs_for_agent("nex", 10).unwrap();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].envelope_ids.contains(&env.id));

    h.shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
