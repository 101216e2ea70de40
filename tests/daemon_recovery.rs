//! Startup recovery: stale runs, orphan envelopes, cron reconcile.

mod common;

use common::Harness;
use hiboss::agent::types::{AgentRun, RunStatus};
use hiboss::cron::types::NewCronSchedule;
use hiboss::envelope::{Address, EnvelopeContent, EnvelopeMetadata, EnvelopeStatus, NewEnvelope};
use hiboss::ids::new_id;

#[tokio::test]
async fn recover_repairs_all_crash_leftovers() {
    let h = Harness::new();
    h.register_bound_agent("nex");

    // 1. A run left `running` by a dead daemon
    let stale_run = AgentRun {
        id: new_id(),
        agent_name: "nex".to_string(),
        started_at: 1_000,
        completed_at: None,
        envelope_ids: vec![],
        final_response: None,
        context_length: None,
        status: RunStatus::Running,
        error: None,
    };
    h.daemon.store.create_run(&stale_run).unwrap();

    // 2. A due channel envelope whose sender lost its binding
    let orphan = h
        .daemon
        .store
        .create_envelope(NewEnvelope {
            from: Address::agent("ghost"),
            to: Address::channel("telegram", "1"),
            from_boss: false,
            content: EnvelopeContent::text("stranded"),
            deliver_at: None,
            metadata: EnvelopeMetadata::default(),
        })
        .unwrap();

    // 3. An enabled cron whose pending envelope was consumed
    let sched = h
        .daemon
        .cron
        .create_schedule(NewCronSchedule {
            agent_name: "nex".to_string(),
            cron: "@daily".to_string(),
            timezone: None,
            to: Address::agent("nex"),
            content: "tick".to_string(),
            metadata: None,
            enabled: true,
        })
        .await
        .unwrap();
    let lost = sched.pending_envelope_id.clone().unwrap();
    h.daemon
        .store
        .update_envelope_status(&lost, EnvelopeStatus::Done)
        .unwrap();

    h.daemon.recover().await.unwrap();

    let run = h.daemon.store.get_run(&stale_run.id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    let orphan = h.daemon.store.get_envelope(&orphan.id).unwrap().unwrap();
    assert_eq!(orphan.status, EnvelopeStatus::Done);
    assert!(orphan.metadata.last_delivery_error.is_some());

    let sched = h.daemon.cron.get_schedule(&sched.id).await.unwrap();
    let pending_id = sched.pending_envelope_id.expect("re-materialized");
    assert_ne!(pending_id, lost);
    assert_eq!(
        h.daemon
            .store
            .get_envelope(&pending_id)
            .unwrap()
            .unwrap()
            .status,
        EnvelopeStatus::Pending
    );

    // Recovery is idempotent
    h.daemon.recover().await.unwrap();
    let again = h.daemon.cron.get_schedule(&sched.id).await.unwrap();
    assert_eq!(again.pending_envelope_id.as_deref(), Some(pending_id.as_str()));
}

#[tokio::test]
async fn bound_due_envelope_survives_the_orphan_sweep() {
    let h = Harness::new();
    h.register_bound_agent("nex");

    let good = h
        .daemon
        .store
        .create_envelope(NewEnvelope {
            from: Address::agent("nex"),
            to: Address::channel("telegram", "1"),
            from_boss: false,
            content: EnvelopeContent::text("deliver me later"),
            deliver_at: None,
            metadata: EnvelopeMetadata::default(),
        })
        .unwrap();

    h.daemon.recover().await.unwrap();
    assert_eq!(
        h.daemon.store.get_envelope(&good.id).unwrap().unwrap().status,
        EnvelopeStatus::Pending
    );
}
