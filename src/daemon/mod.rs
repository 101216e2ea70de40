//! Daemon shell: composition, startup recovery, graceful shutdown.
//!
//! Wiring order matters: the store and event hub come first, the router and
//! both schedulers attach to them, the executor registers as the agent
//! handler last. Recovery (stale runs, orphan envelopes, cron reconcile)
//! runs before the first scheduler tick so the tick starts from a clean
//! state.

pub mod methods;

use crate::agent::AgentExecutor;
use crate::auth::Authorizer;
use crate::channels::registry::AdapterRegistry;
use crate::config::DataPaths;
use crate::cron::CronScheduler;
use crate::errors::{HibossError, HibossResult};
use crate::providers::ProviderFactory;
use crate::providers::cli::CliProviderFactory;
use crate::router::Router;
use crate::router::events::EventHub;
use crate::rpc::RpcServer;
use crate::scheduler::EnvelopeScheduler;
use crate::store::Store;
use crate::time::now_ms;
use fs2::FileExt;
use methods::Methods;
use std::fs::File;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{info, warn};

/// Bound on the startup orphan-envelope sweep.
const ORPHAN_SWEEP_CAP: usize = 500;

pub struct Daemon {
    pub paths: DataPaths,
    pub store: Arc<Store>,
    pub adapters: Arc<AdapterRegistry>,
    pub events: Arc<EventHub>,
    pub router: Arc<Router>,
    pub cron: Arc<CronScheduler>,
    pub scheduler: Arc<EnvelopeScheduler>,
    pub executor: Arc<AgentExecutor>,
    auth: Arc<Authorizer>,
    shutdown_tx: watch::Sender<bool>,
    started_at: Instant,
}

impl Daemon {
    /// Compose the daemon. No I/O beyond opening the store; call [`run`] to
    /// take the instance lock and serve.
    pub fn build(paths: DataPaths, providers: Arc<dyn ProviderFactory>) -> HibossResult<Self> {
        paths.ensure_layout()?;
        let store = Arc::new(Store::open(&paths.db_path)?);
        let auth = Arc::new(Authorizer::new(store.clone()));

        let adapters = Arc::new(AdapterRegistry::new());
        let events = Arc::new(EventHub::new());
        let router = Arc::new(Router::new(store.clone(), adapters.clone(), events.clone()));

        let cron = Arc::new(CronScheduler::new(store.clone(), events.clone()));
        events.subscribe(cron.clone());

        let scheduler = Arc::new(EnvelopeScheduler::new(store.clone(), router.clone()));
        events.subscribe(scheduler.events_handle());

        let executor = Arc::new(AgentExecutor::new(
            store.clone(),
            events.clone(),
            providers,
            paths.clone(),
        ));
        router.set_agent_handler(executor.clone());
        scheduler.set_agent_handler(executor.clone());

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            paths,
            store,
            adapters,
            events,
            router,
            cron,
            scheduler,
            executor,
            auth,
            shutdown_tx,
            started_at: Instant::now(),
        })
    }

    /// Build with the CLI-backed provider factory and resolved data paths.
    pub fn build_default() -> HibossResult<Self> {
        Daemon::build(DataPaths::resolve()?, Arc::new(CliProviderFactory))
    }

    pub fn shutdown_sender(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    pub fn authorizer(&self) -> Arc<Authorizer> {
        self.auth.clone()
    }

    /// Startup recovery: orphaned runs fail, undeliverable channel
    /// envelopes are swept (bounded), cron schedules reconcile with
    /// misfires skipped.
    pub async fn recover(&self) -> HibossResult<()> {
        let now = now_ms();
        let stale = self.store.fail_stale_running_runs(now)?;
        if stale > 0 {
            warn!("marked {} stale running run(s) as failed", stale);
        }
        let orphans = self.store.clear_orphan_channel_envelopes(now, ORPHAN_SWEEP_CAP)?;
        if orphans > 0 {
            warn!("cleared {} orphan channel envelope(s)", orphans);
        }
        let summary = self.cron.reconcile_all_schedules(true).await?;
        if summary.materialized > 0 || summary.cleaned > 0 {
            info!(
                "cron reconcile: {} materialized, {} cleaned",
                summary.materialized, summary.cleaned
            );
        }
        Ok(())
    }

    /// Run until a shutdown signal (SIGINT, SIGTERM, or `daemon.stop`).
    pub async fn run(self) -> HibossResult<()> {
        // Instance lock first: everything after this is ours exclusively
        let _lock = acquire_pid_lock(&self.paths)?;

        // Socket next, so a second daemon fails fast even if it skipped the
        // lock (stale-socket probing happens inside bind)
        let server = RpcServer::new(self.paths.socket_path.clone());
        let listener = server.bind().await?;

        self.recover().await?;
        self.adapters.start_all().await;

        let scheduler_task = self.scheduler.start(self.shutdown_tx.subscribe());

        let handler = Arc::new(Methods {
            store: self.store.clone(),
            auth: self.auth.clone(),
            router: self.router.clone(),
            cron: self.cron.clone(),
            executor: self.executor.clone(),
            adapters: self.adapters.clone(),
            scheduler: self.scheduler.clone(),
            paths: self.paths.clone(),
            started_at: self.started_at,
            shutdown: self.shutdown_tx.clone(),
        });
        let rpc_task = tokio::spawn(RpcServer::serve(
            listener,
            handler,
            self.shutdown_tx.subscribe(),
        ));

        info!("daemon ready (data dir {})", self.paths.root.display());
        wait_for_shutdown(self.shutdown_tx.subscribe()).await;
        let _ = self.shutdown_tx.send(true);

        info!("shutting down...");
        self.adapters.stop_all().await;
        let _ = scheduler_task.await;
        let _ = rpc_task.await;

        if self.paths.socket_path.exists() {
            let _ = std::fs::remove_file(&self.paths.socket_path);
        }
        if self.paths.pid_path.exists() {
            let _ = std::fs::remove_file(&self.paths.pid_path);
        }
        info!("daemon stopped");
        Ok(())
    }
}

/// Exclusive lock + PID record. The lock releases when the handle drops.
fn acquire_pid_lock(paths: &DataPaths) -> HibossResult<File> {
    // Avoid truncating before the lock is held: a running daemon's PID must
    // survive a failed second start
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&paths.pid_path)?;
    file.try_lock_exclusive()
        .map_err(|_| HibossError::Conflict("Daemon already running".to_string()))?;
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(file)
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            warn!("failed to install SIGTERM handler: {}", e);
            // Fall back to ctrl-c + rpc stop only
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => return,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        }
    };
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT");
                return;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                return;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
