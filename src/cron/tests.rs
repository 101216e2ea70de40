use super::*;
use crate::agent::types::{Agent, PermissionLevel};
use crate::envelope::EnvelopeStatus;
use crate::providers::ProviderKind;
use crate::store::EnvelopeFilter;
use std::path::PathBuf;

fn setup() -> (Arc<Store>, CronScheduler) {
    let store = Arc::new(Store::open_in_memory().unwrap());
    store
        .create_agent(&Agent {
            name: "nex".into(),
            token: "tok-nex".into(),
            description: None,
            workspace: PathBuf::from("/tmp/nex"),
            provider: ProviderKind::Claude,
            model: None,
            reasoning_effort: None,
            permission_level: PermissionLevel::Standard,
            session_policy: None,
            metadata: None,
            created_at: 0,
            last_seen_at: None,
        })
        .unwrap();
    let events = Arc::new(EventHub::new());
    let cron = CronScheduler::new(store.clone(), events);
    (store, cron)
}

fn new_schedule(to: Address) -> NewCronSchedule {
    NewCronSchedule {
        agent_name: "nex".into(),
        cron: "0 9 * * *".into(),
        timezone: Some("Asia/Tokyo".into()),
        to,
        content: "standup".into(),
        metadata: None,
        enabled: true,
    }
}

fn pending_for_schedule(store: &Store, schedule_id: &str) -> Vec<Envelope> {
    store
        .list_envelopes(&EnvelopeFilter {
            status: Some(EnvelopeStatus::Pending),
            limit: Some(100),
            ..Default::default()
        })
        .unwrap()
        .into_iter()
        .filter(|e| e.metadata.cron_schedule_id.as_deref() == Some(schedule_id))
        .collect()
}

#[tokio::test]
async fn create_enabled_materializes_one_future_envelope() {
    let (store, cron) = setup();
    let sched = cron
        .create_schedule(new_schedule(Address::channel("telegram", "-100")))
        .await
        .unwrap();

    assert_eq!(sched.cron, "0 0 9 * * *", "5-field input is normalized");
    let pending = pending_for_schedule(&store, &sched.id);
    assert_eq!(pending.len(), 1);
    let env = &pending[0];
    assert_eq!(sched.pending_envelope_id.as_deref(), Some(env.id.as_str()));
    assert_eq!(env.from, Address::agent("nex"));
    assert_eq!(env.to, Address::channel("telegram", "-100"));
    assert_eq!(env.content.text.as_deref(), Some("standup"));
    assert!(env.deliver_at.unwrap() > now_ms());
}

#[tokio::test]
async fn create_disabled_materializes_nothing() {
    let (store, cron) = setup();
    let mut input = new_schedule(Address::agent("nex"));
    input.enabled = false;
    let sched = cron.create_schedule(input).await.unwrap();
    assert!(sched.pending_envelope_id.is_none());
    assert!(pending_for_schedule(&store, &sched.id).is_empty());
}

#[tokio::test]
async fn create_rejects_unknown_agent_and_bad_inputs() {
    let (_store, cron) = setup();

    let mut input = new_schedule(Address::agent("nex"));
    input.agent_name = "ghost".into();
    assert!(matches!(
        cron.create_schedule(input).await,
        Err(HibossError::NotFound { .. })
    ));

    let mut input = new_schedule(Address::agent("nex"));
    input.cron = "not a cron".into();
    assert!(matches!(
        cron.create_schedule(input).await,
        Err(HibossError::Validation(_))
    ));

    let mut input = new_schedule(Address::agent("nex"));
    input.timezone = Some("Mars/Olympus".into());
    assert!(matches!(
        cron.create_schedule(input).await,
        Err(HibossError::Validation(_))
    ));
}

#[tokio::test]
async fn local_timezone_inherits_boss() {
    let (_store, cron) = setup();
    let mut input = new_schedule(Address::agent("nex"));
    input.timezone = Some("local".into());
    let sched = cron.create_schedule(input).await.unwrap();
    assert!(sched.timezone.is_none());
}

#[tokio::test]
async fn done_advances_exactly_once() {
    let (store, cron) = setup();
    let sched = cron
        .create_schedule(new_schedule(Address::channel("telegram", "-100")))
        .await
        .unwrap();
    let first = store
        .get_envelope(sched.pending_envelope_id.as_deref().unwrap())
        .unwrap()
        .unwrap();

    store
        .update_envelope_status(&first.id, EnvelopeStatus::Done)
        .unwrap();
    cron.on_envelope_done(&first).await;

    let pending = pending_for_schedule(&store, &sched.id);
    assert_eq!(pending.len(), 1);
    assert!(pending[0].deliver_at.unwrap() >= first.deliver_at.unwrap());
    assert_ne!(pending[0].id, first.id);

    // A duplicate completion report must not double-advance
    cron.on_envelope_done(&first).await;
    let after_replay = pending_for_schedule(&store, &sched.id);
    assert_eq!(after_replay.len(), 1);
    assert_eq!(after_replay[0].id, pending[0].id);
}

#[tokio::test]
async fn disable_cancels_pending_and_enable_rematerializes() {
    let (store, cron) = setup();
    let sched = cron
        .create_schedule(new_schedule(Address::agent("nex")))
        .await
        .unwrap();
    let first_id = sched.pending_envelope_id.clone().unwrap();

    let disabled = cron.disable_schedule(&sched.id).await.unwrap();
    assert!(!disabled.enabled);
    assert!(disabled.pending_envelope_id.is_none());
    assert_eq!(
        store.get_envelope(&first_id).unwrap().unwrap().status,
        EnvelopeStatus::Done
    );
    assert!(pending_for_schedule(&store, &sched.id).is_empty());

    let enabled = cron.enable_schedule(&sched.id).await.unwrap();
    assert!(enabled.enabled);
    let pending = pending_for_schedule(&store, &sched.id);
    assert_eq!(pending.len(), 1);
    assert_eq!(
        enabled.pending_envelope_id.as_deref(),
        Some(pending[0].id.as_str())
    );
}

#[tokio::test]
async fn delete_cancels_pending_and_removes_row() {
    let (store, cron) = setup();
    let sched = cron
        .create_schedule(new_schedule(Address::agent("nex")))
        .await
        .unwrap();
    cron.delete_schedule(&sched.id).await.unwrap();
    assert!(store.get_cron_schedule(&sched.id).unwrap().is_none());
    assert!(pending_for_schedule(&store, &sched.id).is_empty());
    assert!(matches!(
        cron.delete_schedule(&sched.id).await,
        Err(HibossError::NotFound { .. })
    ));
}

#[tokio::test]
async fn reconcile_restores_missing_pending_and_is_idempotent() {
    let (store, cron) = setup();
    let sched = cron
        .create_schedule(new_schedule(Address::agent("nex")))
        .await
        .unwrap();
    let first_id = sched.pending_envelope_id.clone().unwrap();

    // Simulate a lost pending envelope (consumed without advancement)
    store
        .update_envelope_status(&first_id, EnvelopeStatus::Done)
        .unwrap();

    let summary = cron.reconcile_all_schedules(true).await.unwrap();
    assert_eq!(summary.materialized, 1);
    let pending = pending_for_schedule(&store, &sched.id);
    assert_eq!(pending.len(), 1);

    // Second pass changes nothing
    let summary = cron.reconcile_all_schedules(true).await.unwrap();
    assert_eq!(summary, ReconcileSummary::default());
    let pending_after = pending_for_schedule(&store, &sched.id);
    assert_eq!(pending_after.len(), 1);
    assert_eq!(pending_after[0].id, pending[0].id);
}

#[tokio::test]
async fn reconcile_cleans_stray_pending_on_disabled_schedule() {
    let (store, cron) = setup();
    let sched = cron
        .create_schedule(new_schedule(Address::agent("nex")))
        .await
        .unwrap();
    // Disable behind the scheduler's back, leaving the pending envelope
    store.update_cron_enabled(&sched.id, false, now_ms()).unwrap();

    let summary = cron.reconcile_all_schedules(true).await.unwrap();
    assert_eq!(summary.cleaned, 1);
    assert!(pending_for_schedule(&store, &sched.id).is_empty());
}
