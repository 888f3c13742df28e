//! Lead queue: the single owner of a database's persistent connection.
//!
//! One Lead queue exists per enabled configured database and lives for the
//! process lifetime. It makes the first connection attempt synchronously at
//! startup, signals the outcome exactly once, runs the bootstrap canary and
//! any pending migrations after the very first successful connection, and
//! then supervises the connection from a fixed-interval heartbeat task that
//! also grows and shrinks the child-worker population.
//!
//! States: `Created -> Connecting -> Connected <-> Degraded -> Connecting
//! (retry) ...`, with `Stopping -> Stopped` reachable from any state on
//! shutdown.

use crate::config::{DEFAULT_BOOTSTRAP_TIMEOUT_SECS, DatabaseEntry};
use crate::engine::{ConnectParams, ConnectionHandle, Engine};
use crate::migrate::{
    self, MigrationCatalog, MigrationRunner, MigrationSource, ScriptInterpreter, ScriptParams,
    TemplateInterpreter,
};
use crate::models::{QueryRequest, QueryResult};
use crate::queue::child::{ChildQueue, WorkItem};
use crate::queue::signal::OnceSignal;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// How much backlog justifies one child worker.
const SPAWN_BACKLOG_PER_CHILD: usize = 8;

/// Lead queue lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Created,
    Connecting,
    Connected,
    Degraded,
    Stopping,
    Stopped,
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        write!(f, "{label}")
    }
}

/// Point-in-time queue snapshot for readiness reports and logs.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub database: String,
    pub engine: String,
    pub state: String,
    pub is_connected: bool,
    pub child_count: usize,
    pub pending_work: usize,
    pub consecutive_failures: u32,
    pub reconnect_attempts: u32,
    pub last_heartbeat_age_secs: Option<u64>,
}

pub struct LeadQueue {
    database_name: String,
    engine: Arc<dyn Engine>,
    entry: DatabaseEntry,
    catalog: Arc<MigrationCatalog>,

    /// The persistent connection. Exclusively owned here; children borrow it
    /// only through this mutex.
    connection: Arc<Mutex<Option<ConnectionHandle>>>,
    state: std::sync::Mutex<QueueState>,
    is_connected: AtomicBool,
    last_heartbeat: std::sync::Mutex<Option<Instant>>,
    last_connection_attempt: std::sync::Mutex<Option<Instant>>,
    reconnect_attempts: AtomicU32,

    /// Set once when the first connection attempt finishes, success or not.
    initial_connection: OnceSignal,
    /// Set once when bootstrap finishes, success or not.
    bootstrap_completed: OnceSignal,
    bootstrap_ran: AtomicBool,

    work_tx: mpsc::Sender<WorkItem>,
    work_rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    children: Mutex<Vec<ChildQueue>>,
    child_seq: AtomicUsize,

    shutdown_tx: watch::Sender<bool>,
    heartbeat_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LeadQueue {
    /// Create a queue for one configured database. No connection is made
    /// until [`start`](Self::start).
    pub fn new(
        entry: DatabaseEntry,
        engine: Arc<dyn Engine>,
        catalog: Arc<MigrationCatalog>,
    ) -> Arc<Self> {
        let (work_tx, work_rx) = mpsc::channel(entry.work_queue_depth_or_default());
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            database_name: entry.name.clone(),
            engine,
            entry,
            catalog,
            connection: Arc::new(Mutex::new(None)),
            state: std::sync::Mutex::new(QueueState::Created),
            is_connected: AtomicBool::new(false),
            last_heartbeat: std::sync::Mutex::new(None),
            last_connection_attempt: std::sync::Mutex::new(None),
            reconnect_attempts: AtomicU32::new(0),
            initial_connection: OnceSignal::new(),
            bootstrap_completed: OnceSignal::new(),
            bootstrap_ran: AtomicBool::new(false),
            work_tx,
            work_rx: Arc::new(Mutex::new(work_rx)),
            children: Mutex::new(Vec::new()),
            child_seq: AtomicUsize::new(0),
            shutdown_tx,
            heartbeat_task: std::sync::Mutex::new(None),
        })
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    /// Queue role label. Children carry "child".
    pub fn queue_type(&self) -> &'static str {
        "lead"
    }

    pub fn is_lead_queue(&self) -> bool {
        true
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    pub fn state(&self) -> QueueState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: QueueState) {
        let mut state = self.state.lock().unwrap();
        if *state != next {
            debug!(database = %self.database_name, from = %*state, to = %next, "Queue state change");
            *state = next;
        }
    }

    /// Make the first connection attempt, signal its outcome, run
    /// first-connection tasks, and hand supervision to the heartbeat task.
    /// Returns whether the initial attempt connected.
    pub async fn start(self: &Arc<Self>) -> bool {
        self.set_state(QueueState::Connecting);
        info!(
            database = %self.database_name,
            engine = %self.engine.kind(),
            "Starting lead queue"
        );

        let connected = {
            let mut guard = self.connection.lock().await;
            self.try_connect_locked(&mut guard).await
        };
        self.is_connected.store(connected, Ordering::Release);
        self.set_state(if connected {
            QueueState::Connected
        } else {
            QueueState::Degraded
        });

        // The launch sequence may be blocked on this; deliver the outcome
        // exactly once whether or not the attempt succeeded
        self.initial_connection.set();

        if connected {
            info!(database = %self.database_name, "Initial connection established");
            self.first_connection_tasks().await;
        } else {
            warn!(
                database = %self.database_name,
                "Initial connection failed; heartbeat will retry"
            );
        }

        self.spawn_heartbeat();
        connected
    }

    /// Block until the first connection attempt completes (either way).
    /// Returns immediately when called after completion.
    pub async fn wait_for_initial_connection(&self, timeout: Duration) -> bool {
        self.initial_connection.wait(timeout).await
    }

    /// Block until bootstrap has finished (either way).
    pub async fn wait_for_bootstrap(&self, timeout: Duration) -> bool {
        self.bootstrap_completed.wait(timeout).await
    }

    /// Submit a request for execution on the child-worker pool.
    pub async fn submit(&self, mut request: QueryRequest) -> QueryResult {
        if *self.shutdown_tx.borrow() {
            return QueryResult::failure("queue is stopped", 0);
        }
        if !self.is_connected() {
            return QueryResult::failure(
                format!("database '{}' is not connected", self.database_name),
                0,
            );
        }
        // Requests without their own timeout inherit the database's
        if request.timeout_secs.is_none() {
            request.timeout_secs = Some(self.entry.query_timeout().as_secs() as u32);
        }
        self.ensure_worker().await;

        let (reply_tx, reply_rx) = oneshot::channel();
        let item = WorkItem {
            request,
            reply: reply_tx,
        };
        if self.work_tx.send(item).await.is_err() {
            return QueryResult::failure("work queue is closed", 0);
        }
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => QueryResult::failure("worker dropped the request", 0),
        }
    }

    /// Snapshot queue health.
    pub async fn stats(&self) -> QueueStats {
        let child_count = {
            let children = self.children.lock().await;
            children.iter().filter(|c| !c.is_finished()).count()
        };
        let consecutive_failures = {
            let guard = self.connection.lock().await;
            guard.as_ref().map(|h| h.consecutive_failures).unwrap_or(0)
        };
        let last_heartbeat_age_secs = self
            .last_heartbeat
            .lock()
            .unwrap()
            .map(|at| at.elapsed().as_secs());
        QueueStats {
            database: self.database_name.clone(),
            engine: self.engine.kind().to_string(),
            state: self.state().to_string(),
            is_connected: self.is_connected(),
            child_count,
            pending_work: self.work_tx.max_capacity() - self.work_tx.capacity(),
            consecutive_failures,
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Acquire),
            last_heartbeat_age_secs,
        }
    }

    /// Stop the heartbeat, retire children, and close the connection.
    pub async fn shutdown(&self) {
        self.set_state(QueueState::Stopping);
        info!(database = %self.database_name, "Stopping lead queue");
        let _ = self.shutdown_tx.send(true);

        if let Some(task) = self.heartbeat_task.lock().unwrap().take() {
            task.abort();
        }
        {
            let mut children = self.children.lock().await;
            for child in children.drain(..) {
                child.abort();
            }
        }
        {
            let mut guard = self.connection.lock().await;
            if let Some(mut handle) = guard.take() {
                if let Err(e) = self.engine.disconnect(&mut handle).await {
                    warn!(database = %self.database_name, error = %e, "Disconnect failed");
                }
            }
        }
        self.is_connected.store(false, Ordering::Release);
        self.set_state(QueueState::Stopped);
    }

    /// Attempt a connection into the locked slot. Records attempt
    /// bookkeeping either way.
    async fn try_connect_locked(&self, slot: &mut Option<ConnectionHandle>) -> bool {
        *self.last_connection_attempt.lock().unwrap() = Some(Instant::now());
        let params = ConnectParams::from_entry(&self.entry);
        let designator = format!("db:{}", self.database_name);
        match self
            .engine
            .connect(
                &params,
                &designator,
                self.entry.statement_cache_capacity_or_default(),
            )
            .await
        {
            Ok(handle) => {
                *slot = Some(handle);
                self.reconnect_attempts.store(0, Ordering::Release);
                true
            }
            Err(e) => {
                let attempts = self.reconnect_attempts.fetch_add(1, Ordering::AcqRel) + 1;
                warn!(
                    database = %self.database_name,
                    error = %e,
                    attempts,
                    "Connection attempt failed"
                );
                false
            }
        }
    }

    /// Bootstrap and migrations, run once after the very first successful
    /// connection (never on reconnects).
    async fn first_connection_tasks(&self) {
        if self.bootstrap_ran.swap(true, Ordering::AcqRel) {
            return;
        }
        self.run_bootstrap().await;
        if self.entry.auto_migration {
            self.run_migrations().await;
        }
    }

    /// Execute the canary query under a short timeout. Failure is logged and
    /// does not tear down the connection; the completion signal fires either
    /// way so dependents never block forever.
    async fn run_bootstrap(&self) {
        let query = self.entry.bootstrap_query_or_default().to_string();
        let request =
            QueryRequest::new(query).with_timeout(DEFAULT_BOOTSTRAP_TIMEOUT_SECS as u32);
        let outcome = {
            let mut guard = self.connection.lock().await;
            match guard.as_mut() {
                Some(handle) if handle.is_connected() => {
                    Some(self.engine.execute_query(handle, &request).await)
                }
                _ => None,
            }
        };
        match outcome {
            Some(result) if result.success => {
                info!(database = %self.database_name, "Bootstrap query succeeded");
            }
            Some(result) => {
                warn!(
                    database = %self.database_name,
                    error = ?result.error_message,
                    "Bootstrap query failed"
                );
            }
            None => {
                warn!(database = %self.database_name, "Bootstrap skipped: connection not live");
            }
        }
        self.bootstrap_completed.set();
    }

    async fn run_migrations(&self) {
        let Some(configured) = self.entry.migration_source.as_deref() else {
            warn!(database = %self.database_name, "auto_migration set but no migration_source");
            return;
        };
        let source = MigrationSource::parse(configured);
        let scripts = match migrate::discover(&source, &self.catalog) {
            Ok(scripts) => scripts,
            Err(e) => {
                warn!(database = %self.database_name, error = %e, "Migration discovery failed");
                return;
            }
        };
        if scripts.is_empty() {
            info!(database = %self.database_name, source = %source, "No migration scripts found");
            return;
        }

        let engine_name = self.engine.kind().display_name().to_lowercase();
        let schema = self
            .entry
            .database
            .clone()
            .unwrap_or_else(|| self.database_name.clone());
        let params = ScriptParams {
            engine: &engine_name,
            design: &self.database_name,
            schema: &schema,
        };
        let interpreter = TemplateInterpreter;
        let runner = MigrationRunner::new(self.engine.as_ref(), &interpreter);

        if self.entry.test_migration && !self.dry_run(&runner, &scripts, &params).await {
            warn!(database = %self.database_name, "Migration dry run failed; real run skipped");
            return;
        }

        let mut guard = self.connection.lock().await;
        let Some(handle) = guard.as_mut() else {
            warn!(database = %self.database_name, "Migration skipped: connection not live");
            return;
        };
        match runner.run(handle, &scripts, &params).await {
            Ok(applied) => {
                info!(database = %self.database_name, applied, "Migration run complete");
            }
            Err(e) => {
                warn!(database = %self.database_name, error = %e, "Migration run failed");
            }
        }
    }

    /// Rehearse the migration run before touching the real database. Every
    /// script is rendered to catch interpreter errors; for SQLite the whole
    /// run additionally executes against a scratch in-memory copy.
    async fn dry_run(
        &self,
        runner: &MigrationRunner<'_>,
        scripts: &[crate::migrate::MigrationScript],
        params: &ScriptParams<'_>,
    ) -> bool {
        let interpreter = TemplateInterpreter;
        for script in scripts {
            if let Err(e) = interpreter.render(&script.contents, params) {
                warn!(
                    database = %self.database_name,
                    script = %script.name,
                    error = %e,
                    "Script failed to render"
                );
                return false;
            }
        }
        if self.engine.kind() != crate::models::EngineKind::SQLite {
            // No cheap scratch copy for server engines; rendering is the
            // extent of the rehearsal
            return true;
        }
        let scratch_params = ConnectParams::parse(crate::models::EngineKind::SQLite, "sqlite://");
        let mut scratch = match self
            .engine
            .connect(&scratch_params, "migration-dry-run", 1)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(database = %self.database_name, error = %e, "Cannot open scratch database");
                return false;
            }
        };
        let outcome = runner.run(&mut scratch, scripts, params).await;
        let _ = self.engine.disconnect(&mut scratch).await;
        match outcome {
            Ok(_) => true,
            Err(e) => {
                warn!(database = %self.database_name, error = %e, "Dry run failed");
                false
            }
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.entry.heartbeat_interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it, start() just ran
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.wait_for(|stop| *stop) => return,
                }
                // Exit when the queue is dropped; never keep it alive
                let Some(queue) = weak.upgrade() else { return };
                queue.heartbeat_tick().await;
            }
        });
        *self.heartbeat_task.lock().unwrap() = Some(task);
    }

    /// One supervision pass: verify or repair the connection, record the
    /// transition, and rebalance the child population.
    async fn heartbeat_tick(self: &Arc<Self>) {
        let was_connected = self.is_connected.load(Ordering::Acquire);
        let threshold = self.entry.failure_threshold_or_default();
        let mut first_success = false;

        let now_connected = {
            let mut guard = self.connection.lock().await;

            enum Verdict {
                Healthy,
                Transient,
                Recover,
                Reconnect,
            }

            let verdict = match guard.as_mut() {
                Some(handle) => {
                    if self.engine.health_check(handle).await {
                        Verdict::Healthy
                    } else if handle.consecutive_failures >= threshold {
                        warn!(
                            database = %self.database_name,
                            failures = handle.consecutive_failures,
                            "Failure threshold reached; attempting recovery"
                        );
                        Verdict::Recover
                    } else {
                        Verdict::Transient
                    }
                }
                None => Verdict::Reconnect,
            };

            match verdict {
                Verdict::Healthy => true,
                Verdict::Transient => false,
                Verdict::Recover => {
                    let reset_ok = match guard.as_mut() {
                        Some(handle) => self.engine.reset_connection(handle).await.is_ok(),
                        None => false,
                    };
                    if reset_ok {
                        match guard.as_mut() {
                            Some(handle) => self.engine.health_check(handle).await,
                            None => false,
                        }
                    } else {
                        // No in-place recovery: discard the suspect handle
                        // outright and reconnect fresh
                        if let Some(mut stale) = guard.take() {
                            drop(stale.mark_errored());
                        }
                        let ok = self.try_connect_locked(&mut guard).await;
                        first_success = ok;
                        ok
                    }
                }
                Verdict::Reconnect => {
                    let ok = self.try_connect_locked(&mut guard).await;
                    first_success = ok;
                    ok
                }
            }
        };

        *self.last_heartbeat.lock().unwrap() = Some(Instant::now());
        // Always observable at trace level; transitions get their own lines
        trace!(database = %self.database_name, connected = now_connected, "Heartbeat");
        if was_connected != now_connected {
            if now_connected {
                info!(database = %self.database_name, "Database connection established");
            } else {
                warn!(database = %self.database_name, "Database connection lost");
            }
        }
        self.is_connected.store(now_connected, Ordering::Release);
        self.set_state(if now_connected {
            QueueState::Connected
        } else {
            QueueState::Degraded
        });

        if now_connected && first_success {
            // No-op unless this was the very first successful connection
            self.first_connection_tasks().await;
        }

        self.manage_children().await;
    }

    /// Reap finished children and size the pool to the backlog, bounded by
    /// the configured maximum.
    async fn manage_children(&self) {
        let mut children = self.children.lock().await;
        children.retain(|c| !c.is_finished());
        if !self.is_connected() || *self.shutdown_tx.borrow() {
            return;
        }
        let backlog = self.work_tx.max_capacity() - self.work_tx.capacity();
        let desired = (backlog / SPAWN_BACKLOG_PER_CHILD + 1)
            .clamp(1, self.entry.max_child_queues_or_default());
        while children.len() < desired {
            let child = self.spawn_child();
            debug!(database = %self.database_name, child = %child.name(), "Spawned child queue");
            children.push(child);
        }
    }

    /// Guarantee at least one live worker before enqueueing.
    async fn ensure_worker(&self) {
        let mut children = self.children.lock().await;
        children.retain(|c| !c.is_finished());
        if children.is_empty() {
            children.push(self.spawn_child());
        }
    }

    fn spawn_child(&self) -> ChildQueue {
        let seq = self.child_seq.fetch_add(1, Ordering::Relaxed);
        ChildQueue::spawn(
            format!("{}-child-{}", self.database_name, seq),
            Arc::clone(&self.engine),
            Arc::clone(&self.connection),
            Arc::clone(&self.work_rx),
            self.entry.child_idle_timeout(),
        )
    }
}

impl std::fmt::Debug for LeadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeadQueue")
            .field("database", &self.database_name)
            .field("engine", &self.engine.kind())
            .field("state", &self.state())
            .field("is_connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}
