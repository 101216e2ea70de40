use super::*;
use crate::agent::types::{Agent, AgentBinding, PermissionLevel};
use crate::channels::registry::AdapterRegistry;
use crate::channels::{ChannelAdapter, SendOptions};
use crate::envelope::{Address, EnvelopeContent, EnvelopeMetadata, EnvelopeStatus, NewEnvelope};
use crate::errors::HibossResult;
use crate::providers::ProviderKind;
use crate::router::events::EventHub;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct CountingAdapter {
    sends: AtomicUsize,
}

#[async_trait]
impl ChannelAdapter for CountingAdapter {
    fn platform(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send_message(
        &self,
        _chat_id: &str,
        _content: &EnvelopeContent,
        _opts: &SendOptions,
    ) -> anyhow::Result<Option<String>> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }
}

#[derive(Default)]
struct RecordingControl {
    woken: Mutex<Vec<String>>,
}

#[async_trait]
impl AgentControl for RecordingControl {
    async fn check_and_run(&self, agent_name: &str) {
        self.woken.lock().unwrap().push(agent_name.to_string());
    }

    async fn request_refresh(&self, _agent_name: &str, _reason: &str) {}

    async fn abort_run(&self, _agent_name: &str) -> HibossResult<bool> {
        Ok(false)
    }

    async fn status_line(&self, _agent_name: &str) -> String {
        String::new()
    }
}

struct Fixture {
    store: Arc<Store>,
    scheduler: EnvelopeScheduler,
    adapter: Arc<CountingAdapter>,
    control: Arc<RecordingControl>,
    shutdown_tx: watch::Sender<bool>,
}

fn fixture() -> Fixture {
    let store = Arc::new(Store::open_in_memory().unwrap());
    store
        .create_agent(&Agent {
            name: "nex".into(),
            token: "tok".into(),
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
    store
        .upsert_binding(&AgentBinding {
            agent_name: "nex".into(),
            adapter_type: "telegram".into(),
            adapter_token: "T1".into(),
            created_at: 0,
        })
        .unwrap();

    let adapters = Arc::new(AdapterRegistry::new());
    let adapter = Arc::new(CountingAdapter::default());
    adapters.register("telegram", "T1", adapter.clone());

    let events = Arc::new(EventHub::new());
    let router = Arc::new(Router::new(store.clone(), adapters, events.clone()));
    let scheduler = EnvelopeScheduler::new(store.clone(), router);
    events.subscribe(scheduler.events_handle());
    let control = Arc::new(RecordingControl::default());
    scheduler.set_agent_handler(control.clone());

    let (shutdown_tx, _) = watch::channel(false);
    Fixture {
        store,
        scheduler,
        adapter,
        control,
        shutdown_tx,
    }
}

fn channel_envelope(deliver_at: Option<i64>) -> NewEnvelope {
    NewEnvelope {
        from: Address::agent("nex"),
        to: Address::channel("telegram", "123"),
        from_boss: false,
        content: EnvelopeContent::text("scheduled"),
        deliver_at,
        metadata: EnvelopeMetadata::default(),
    }
}

async fn wait_until(mut probe: impl FnMut() -> bool, timeout_ms: u64) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    probe()
}

#[tokio::test]
async fn startup_tick_drains_due_channel_envelopes() {
    let f = fixture();
    let env = f.store.create_envelope(channel_envelope(None)).unwrap();

    let handle = f.scheduler.start(f.shutdown_tx.subscribe());
    let delivered = wait_until(
        || {
            f.store.get_envelope(&env.id).unwrap().unwrap().status == EnvelopeStatus::Done
        },
        2_000,
    )
    .await;
    assert!(delivered, "startup tick should deliver the due envelope");
    assert_eq!(f.adapter.sends.load(Ordering::SeqCst), 1);

    f.shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn future_envelope_waits_for_its_deliver_at() {
    let f = fixture();
    let env = f
        .store
        .create_envelope(channel_envelope(Some(now_ms() + 300)))
        .unwrap();

    let handle = f.scheduler.start(f.shutdown_tx.subscribe());

    // Not yet due: give the startup tick a moment, then confirm pending
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        f.store.get_envelope(&env.id).unwrap().unwrap().status,
        EnvelopeStatus::Pending
    );

    let delivered = wait_until(
        || {
            f.store.get_envelope(&env.id).unwrap().unwrap().status == EnvelopeStatus::Done
        },
        3_000,
    )
    .await;
    assert!(delivered, "timer should fire at deliver_at");

    f.shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn envelope_created_event_rearms_the_timer() {
    let f = fixture();
    let handle = f.scheduler.start(f.shutdown_tx.subscribe());
    // Let the startup tick finish and the loop go idle on a long sleep
    tokio::time::sleep(Duration::from_millis(100)).await;

    let env = f
        .store
        .create_envelope(channel_envelope(Some(now_ms() + 200)))
        .unwrap();
    f.scheduler.events_handle().on_envelope_created(&env).await;

    let delivered = wait_until(
        || {
            f.store.get_envelope(&env.id).unwrap().unwrap().status == EnvelopeStatus::Done
        },
        3_000,
    )
    .await;
    assert!(delivered, "created event should re-arm the sleeping timer");

    f.shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn due_agent_inbox_wakes_executor() {
    let f = fixture();
    let mut input = channel_envelope(None);
    input.to = Address::agent("nex");
    f.store.create_envelope(input).unwrap();

    let handle = f.scheduler.start(f.shutdown_tx.subscribe());
    let woken = wait_until(
        || f.control.woken.lock().unwrap().contains(&"nex".to_string()),
        2_000,
    )
    .await;
    assert!(woken, "scheduler should wake agents with due inbox");

    f.shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn idle_tick_makes_no_mutation() {
    let f = fixture();
    // One future envelope, nothing due
    let env = f
        .store
        .create_envelope(channel_envelope(Some(now_ms() + 60_000)))
        .unwrap();

    let handle = f.scheduler.start(f.shutdown_tx.subscribe());
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(f.adapter.sends.load(Ordering::SeqCst), 0);
    assert_eq!(
        f.store.get_envelope(&env.id).unwrap().unwrap().status,
        EnvelopeStatus::Pending
    );

    f.shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
