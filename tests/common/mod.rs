#![allow(dead_code)]

use async_trait::async_trait;
use hiboss::HibossResult;
use hiboss::agent::types::{Agent, AgentBinding, PermissionLevel};
use hiboss::channels::{ChannelAdapter, SendOptions};
use hiboss::config::DataPaths;
use hiboss::daemon::Daemon;
use hiboss::daemon::methods::Methods;
use hiboss::envelope::EnvelopeContent;
use hiboss::providers::{
    CancelToken, ProviderError, ProviderFactory, ProviderKind, ProviderSession, SessionConfig,
    TurnOutcome, TurnUsage,
};
use hiboss::store::hash_boss_token;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::watch;

pub const BOSS_TOKEN: &str = "boss-secret-token";

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub chat_id: String,
    pub text: String,
    pub parse_mode: Option<String>,
    pub reply_to_message_id: Option<String>,
}

#[derive(Default)]
pub struct RecordingAdapter {
    pub sent: Mutex<Vec<SentMessage>>,
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
}

impl RecordingAdapter {
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelAdapter for RecordingAdapter {
    fn platform(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_message(
        &self,
        chat_id: &str,
        content: &EnvelopeContent,
        opts: &SendOptions,
    ) -> anyhow::Result<Option<String>> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(SentMessage {
            chat_id: chat_id.to_string(),
            text: content.text.clone().unwrap_or_default(),
            parse_mode: opts.parse_mode.clone(),
            reply_to_message_id: opts.reply_to_message_id.clone(),
        });
        Ok(Some(format!("m{}", sent.len())))
    }
}

/// Scripted provider: responses pop in order; empty script answers "ok".
pub struct ScriptedProvider {
    responses: Arc<Mutex<VecDeque<Result<String, String>>>>,
    pub opened: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            opened: AtomicUsize::new(0),
        }
    }

    pub fn push_response(&self, text: &str) {
        self.responses.lock().unwrap().push_back(Ok(text.to_string()));
    }

    pub fn push_failure(&self, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }
}

struct ScriptedSession {
    responses: Arc<Mutex<VecDeque<Result<String, String>>>>,
}

#[async_trait]
impl ProviderSession for ScriptedSession {
    async fn run_turn(
        &self,
        _prompt: &str,
        cancel: &CancelToken,
    ) -> Result<TurnOutcome, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        let next = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok("ok".to_string()));
        match next {
            Ok(text) => Ok(TurnOutcome {
                final_response: text,
                usage: TurnUsage {
                    input: 100,
                    output: 20,
                    total: 120,
                    cache_read: 0,
                    cache_write: 0,
                    context_length: 2_000,
                },
            }),
            Err(message) => Err(ProviderError::Failed(message)),
        }
    }

    async fn close(&self) {}
}

#[async_trait]
impl ProviderFactory for ScriptedProvider {
    async fn open_session(&self, _cfg: &SessionConfig) -> HibossResult<Box<dyn ProviderSession>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            responses: self.responses.clone(),
        }))
    }
}

pub struct Harness {
    pub tmp: TempDir,
    pub daemon: Daemon,
    pub adapter: Arc<RecordingAdapter>,
    pub provider: Arc<ScriptedProvider>,
    pub shutdown_tx: watch::Sender<bool>,
}

impl Harness {
    /// A composed daemon on a temp data dir: setup completed, boss identity
    /// configured for Telegram, one recording adapter loaded as credential
    /// `T1`.
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let paths = DataPaths::from_root(tmp.path().to_path_buf());
        let provider = Arc::new(ScriptedProvider::new());
        let daemon = Daemon::build(paths, provider.clone()).unwrap();

        daemon
            .store
            .set_config("setup_completed", "true")
            .unwrap();
        daemon.store.set_config("boss_name", "Kevin").unwrap();
        daemon
            .store
            .set_config("boss_timezone", "Asia/Tokyo")
            .unwrap();
        daemon
            .store
            .set_config("boss_token_hash", &hash_boss_token(BOSS_TOKEN))
            .unwrap();
        daemon
            .store
            .set_config("adapter_boss_id_telegram", "kky1024")
            .unwrap();

        let adapter = Arc::new(RecordingAdapter::default());
        daemon.adapters.register("telegram", "T1", adapter.clone());

        let shutdown_tx = daemon.shutdown_sender();
        Self {
            tmp,
            daemon,
            adapter,
            provider,
            shutdown_tx,
        }
    }

    /// Register an agent named `name` with a Telegram binding on `T1`.
    pub fn register_bound_agent(&self, name: &str) -> Agent {
        let agent = Agent {
            name: name.to_string(),
            token: format!("tok-{}", name),
            description: None,
            workspace: self.tmp.path().join(name).join("ws"),
            provider: ProviderKind::Claude,
            model: None,
            reasoning_effort: None,
            permission_level: PermissionLevel::Standard,
            session_policy: None,
            metadata: None,
            created_at: 0,
            last_seen_at: None,
        };
        self.daemon.store.create_agent(&agent).unwrap();
        self.daemon
            .store
            .upsert_binding(&AgentBinding {
                agent_name: name.to_string(),
                adapter_type: "telegram".to_string(),
                adapter_token: "T1".to_string(),
                created_at: 0,
            })
            .unwrap();
        agent
    }

    /// RPC dispatcher over this daemon's components (no socket involved;
    /// the transport has its own tests).
    pub fn methods(&self) -> Methods {
        Methods {
            store: self.daemon.store.clone(),
            auth: self.daemon.authorizer(),
            router: self.daemon.router.clone(),
            cron: self.daemon.cron.clone(),
            executor: self.daemon.executor.clone(),
            adapters: self.daemon.adapters.clone(),
            scheduler: self.daemon.scheduler.clone(),
            paths: self.daemon.paths.clone(),
            started_at: Instant::now(),
            shutdown: self.shutdown_tx.clone(),
        }
    }

    pub fn workspace(&self, name: &str) -> PathBuf {
        self.tmp.path().join(name).join("ws")
    }
}

pub async fn wait_until(mut probe: impl FnMut() -> bool, timeout_ms: u64) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    probe()
}
