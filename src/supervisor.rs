use crate::config::{Service, ServiceStatus};
use crate::health::{self, WaitOutcome};
use crate::log::{LOG_CAPACITY, LogBuffer, LogEntry, LogLevel, ServiceLog};
use crate::port::{self, Negotiation, PortClaim, PortOptions};
use crate::process::{
    self, CrashDecision, CrashPolicy, CrashRecord, LockCleanup, ProcessEvent, SpawnRequest,
};
use crate::registry::Registry;
use crate::stats::{self, StatsCollector, StatsSnapshot};
use crate::sys::{self, ProcessControl};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

pub const KILL_GRACE: Duration = Duration::from_secs(3);
pub const KILL_TIMEOUT: Duration = Duration::from_secs(5);
pub const NO_PORT_GRACE: Duration = Duration::from_secs(1);
const TREE_POLL_INTERVAL: Duration = Duration::from_millis(50);

const LOG_BROADCAST_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Time a terminated process gets before it is force killed.
    pub kill_grace: Duration,
    /// Upper bound on waiting for a tree kill to take effect.
    pub kill_timeout: Duration,
    pub ready_poll_interval: Duration,
    pub ready_timeout: Duration,
    /// Services without a port are promoted to running after this long.
    pub no_port_grace: Duration,
    pub crash: CrashPolicy,
    pub port: PortOptions,
    pub log_capacity: usize,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            kill_grace: KILL_GRACE,
            kill_timeout: KILL_TIMEOUT,
            ready_poll_interval: health::READY_POLL_INTERVAL,
            ready_timeout: health::READY_TIMEOUT,
            no_port_grace: NO_PORT_GRACE,
            crash: CrashPolicy::default(),
            port: PortOptions::default(),
            log_capacity: LOG_CAPACITY,
        }
    }
}

// ---------------------------------------------------------------------------
// Ready hook
// ---------------------------------------------------------------------------

/// Called once a service's port starts accepting connections.
pub trait ReadyHook: Send + Sync {
    fn on_ready(&self, service: &Service, port: u16);
}

pub struct NoopReadyHook;

impl ReadyHook for NoopReadyHook {
    fn on_ready(&self, _service: &Service, _port: u16) {}
}

// ---------------------------------------------------------------------------
// Runtime state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ProcessHandle {
    pid: u32,
    generation: u64,
    exited: watch::Receiver<bool>,
}

struct PendingRestart {
    token: u64,
    task: JoinHandle<()>,
}

struct RuntimeState {
    handle: Option<ProcessHandle>,
    started_at: Option<Instant>,
    crashes: Option<CrashRecord>,
    manually_stopped: bool,
    active_port: Option<u16>,
    logs: LogBuffer,
    last_stats: Option<StatsSnapshot>,
    pending_restart: Option<PendingRestart>,
}

impl RuntimeState {
    fn new(log_capacity: usize) -> Self {
        Self {
            handle: None,
            started_at: None,
            crashes: None,
            manually_stopped: false,
            active_port: None,
            logs: LogBuffer::new(log_capacity),
            last_stats: None,
            pending_restart: None,
        }
    }

    fn cancel_pending_restart(&mut self) {
        if let Some(pending) = self.pending_restart.take() {
            pending.task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Owns the lifecycle of every service process.
///
/// Public operations never fail across their boundary: they return a plain
/// success flag and record what went wrong in the service's own log.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<Registry>,
    options: SupervisorOptions,
    control: Arc<dyn ProcessControl>,
    // Lock order: `runtime` may be held while taking registry locks, never
    // the other way round.
    runtime: RwLock<HashMap<String, RuntimeState>>,
    transitions: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    log_tx: broadcast::Sender<ServiceLog>,
    collector: Mutex<StatsCollector>,
    ready_hook: Arc<dyn ReadyHook>,
    next_id: AtomicU64,
}

impl Supervisor {
    pub fn new(registry: Arc<Registry>, options: SupervisorOptions) -> Self {
        Self::with_parts(registry, options, sys::native(), Arc::new(NoopReadyHook))
    }

    pub fn with_ready_hook(
        registry: Arc<Registry>,
        options: SupervisorOptions,
        ready_hook: Arc<dyn ReadyHook>,
    ) -> Self {
        Self::with_parts(registry, options, sys::native(), ready_hook)
    }

    /// Must be called from within a tokio runtime.
    pub fn with_parts(
        registry: Arc<Registry>,
        options: SupervisorOptions,
        control: Arc<dyn ProcessControl>,
        ready_hook: Arc<dyn ReadyHook>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (log_tx, _) = broadcast::channel(LOG_BROADCAST_CAPACITY);
        let inner = Arc::new(Inner {
            registry,
            options,
            control,
            runtime: RwLock::new(HashMap::new()),
            transitions: Mutex::new(HashMap::new()),
            events: events_tx,
            log_tx,
            collector: Mutex::new(StatsCollector::new()),
            ready_hook,
            next_id: AtomicU64::new(1),
        });
        tokio::spawn(run_event_loop(Arc::downgrade(&inner), events_rx));
        Self { inner }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Begin starting a service. True means the start was accepted, not
    /// that the service is already running.
    pub async fn start(&self, id: &str) -> bool {
        let lock = self.inner.transition_lock(id).await;
        let _guard = lock.lock().await;
        self.inner.start_locked(id).await
    }

    /// Stop a service and wait for its process tree to exit. True when the
    /// service is no longer running.
    pub async fn stop(&self, id: &str) -> bool {
        let lock = self.inner.transition_lock(id).await;
        let _guard = lock.lock().await;
        self.inner.stop_locked(id).await
    }

    pub async fn restart(&self, id: &str) -> bool {
        let lock = self.inner.transition_lock(id).await;
        let _guard = lock.lock().await;
        if self.inner.registry.get_service(id).await.is_none() {
            return false;
        }
        self.inner.stop_locked(id).await;
        self.inner.start_locked(id).await
    }

    /// Stop every service with a live process, in parallel.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = {
            let runtime = self.inner.runtime.read().await;
            runtime
                .iter()
                .filter(|(_, state)| state.handle.is_some() || state.pending_restart.is_some())
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut set = JoinSet::new();
        for id in ids {
            let supervisor = self.clone();
            set.spawn(async move {
                if !supervisor.stop(&id).await {
                    tracing::warn!(service = %id, "failed to stop during shutdown");
                }
            });
        }
        while set.join_next().await.is_some() {}
    }

    /// Stop a service, forget its runtime state and remove it from the
    /// registry.
    pub async fn delete_service(&self, id: &str) -> bool {
        let lock = self.inner.transition_lock(id).await;
        let _guard = lock.lock().await;
        if self.inner.registry.get_service(id).await.is_none() {
            return false;
        }
        self.inner.stop_locked(id).await;

        if let Some(mut state) = self.inner.runtime.write().await.remove(id) {
            state.cancel_pending_restart();
        }
        self.inner.collector.lock().await.forget(id);
        self.inner.transitions.lock().await.remove(id);

        if let Err(e) = self.inner.registry.delete_service(id).await {
            tracing::warn!(service = %id, "service removed but not persisted: {e}");
        }
        true
    }

    /// Start every service flagged for auto start. Returns the ids that
    /// were accepted.
    pub async fn start_auto_services(&self) -> Vec<String> {
        let mut started = Vec::new();
        for service in self.inner.registry.get_all_services().await {
            if service.auto_start && self.start(&service.id).await {
                started.push(service.id);
            }
        }
        started
    }

    /// Oldest first; empty for unknown services.
    pub async fn get_logs(&self, id: &str) -> Vec<LogEntry> {
        let runtime = self.inner.runtime.read().await;
        runtime
            .get(id)
            .map(|state| state.logs.snapshot())
            .unwrap_or_default()
    }

    pub async fn clear_logs(&self, id: &str) {
        if let Some(state) = self.inner.runtime.write().await.get_mut(id) {
            state.logs.clear();
        }
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<ServiceLog> {
        self.inner.log_tx.subscribe()
    }

    pub async fn status(&self, id: &str) -> Option<ServiceStatus> {
        self.inner
            .registry
            .get_service(id)
            .await
            .map(|service| service.status)
    }

    /// Refresh uptime, CPU and memory display fields for every service.
    pub async fn update_service_stats(&self) {
        let inner = &self.inner;
        let services = inner.registry.get_all_services().await;
        let live: HashMap<String, (u32, Option<Instant>)> = {
            let runtime = inner.runtime.read().await;
            runtime
                .iter()
                .filter_map(|(id, state)| {
                    state
                        .handle
                        .as_ref()
                        .map(|handle| (id.clone(), (handle.pid, state.started_at)))
                })
                .collect()
        };

        let mut collector = inner.collector.lock().await;
        if services.iter().any(|s| s.status == ServiceStatus::Running) {
            collector.refresh().await;
        }

        for service in services {
            let id = service.id.as_str();
            let (pid, started_at) = match live.get(id) {
                Some((pid, started_at)) => (Some(*pid), *started_at),
                None => (None, None),
            };
            let uptime = match started_at {
                Some(at) if service.status.is_active() => stats::format_uptime(at.elapsed().as_secs()),
                _ => stats::format_uptime(0),
            };

            let snapshot = match pid {
                Some(pid) if service.status == ServiceStatus::Running => {
                    let sampled = collector.sample(id, pid, inner.control.as_ref()).await;
                    let mut runtime = inner.runtime.write().await;
                    let state = runtime.get_mut(id);
                    match (sampled, state) {
                        (Some(sample), Some(state)) => {
                            state.last_stats = Some(sample);
                            sample
                        }
                        (Some(sample), None) => sample,
                        (None, Some(state)) => state.last_stats.unwrap_or_default(),
                        (None, None) => StatsSnapshot::default(),
                    }
                }
                _ => {
                    collector.forget(id);
                    if let Some(state) = inner.runtime.write().await.get_mut(id) {
                        state.last_stats = None;
                    }
                    StatsSnapshot::default()
                }
            };

            inner
                .registry
                .update_display(id, |s| {
                    s.uptime = uptime;
                    s.cpu = stats::format_cpu(snapshot.cpu_percent);
                    s.memory = stats::format_memory(snapshot.memory_mb);
                })
                .await;
        }
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

impl Inner {
    async fn transition_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.transitions.lock().await;
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Append to the service's buffer and publish to live subscribers.
    fn record(&self, state: &mut RuntimeState, id: &str, level: LogLevel, message: String) {
        let entry = LogEntry::new(level, message);
        state.logs.push(entry.clone());
        let _ = self.log_tx.send(ServiceLog {
            service_id: id.to_string(),
            entry,
        });
    }

    /// Supervisor decision: goes to the service log and to tracing.
    fn note(&self, state: &mut RuntimeState, id: &str, level: LogLevel, message: String) {
        tracing::debug!(service = %id, %level, "{message}");
        self.record(state, id, level, message);
    }

    async fn log(&self, id: &str, level: LogLevel, message: String) {
        let mut runtime = self.runtime.write().await;
        let state = runtime
            .entry(id.to_string())
            .or_insert_with(|| RuntimeState::new(self.options.log_capacity));
        self.note(state, id, level, message);
    }

    async fn start_locked(self: &Arc<Self>, id: &str) -> bool {
        let Some(service) = self.registry.get_service(id).await else {
            return false;
        };

        let live = {
            let runtime = self.runtime.read().await;
            runtime.get(id).is_some_and(|state| state.handle.is_some())
        };
        if live || service.status == ServiceStatus::Running {
            self.log(id, LogLevel::Warn, "Service is already running".to_string())
                .await;
            return false;
        }

        self.registry
            .update_display(id, |s| s.status = ServiceStatus::Starting)
            .await;
        {
            let mut runtime = self.runtime.write().await;
            let state = runtime
                .entry(id.to_string())
                .or_insert_with(|| RuntimeState::new(self.options.log_capacity));
            state.manually_stopped = false;
            state.cancel_pending_restart();
            self.note(
                state,
                id,
                LogLevel::Info,
                format!("Starting: {}", service.command),
            );
        }

        if !service.cwd.is_empty() {
            for result in process::cleanup_stale_locks(Path::new(&service.cwd)) {
                match result {
                    LockCleanup::Removed(path) => {
                        self.log(
                            id,
                            LogLevel::Info,
                            format!("Removed stale lock file {}", path.display()),
                        )
                        .await;
                    }
                    LockCleanup::Failed(path, e) => {
                        self.log(
                            id,
                            LogLevel::Warn,
                            format!("Could not remove stale lock file {}: {e}", path.display()),
                        )
                        .await;
                    }
                }
            }
        }

        let mut env = Vec::new();
        let mut active_port = None;
        if let Some(configured) = service.port {
            let claims = self.managed_port_claims(id).await;
            let negotiation =
                port::negotiate(id, configured, &claims, &self.options.port).await;
            match &negotiation {
                Negotiation::Configured(_) => {}
                Negotiation::Substitute {
                    configured,
                    port,
                    blocker,
                } => {
                    self.log(
                        id,
                        LogLevel::Warn,
                        format!("Port {configured} is in use by {blocker}, using port {port}"),
                    )
                    .await;
                }
                Negotiation::Exhausted {
                    configured,
                    blocker,
                } => {
                    self.log(
                        id,
                        LogLevel::Warn,
                        format!(
                            "Port {configured} is in use by {blocker} and no free port was found nearby; starting anyway"
                        ),
                    )
                    .await;
                }
            }
            if let Some(port) = negotiation.override_port() {
                env.push((self.options.port.env_var.clone(), port.to_string()));
            }
            active_port = Some(negotiation.active_port());
        }

        let generation = self.next_id();

        // Spawn under the runtime lock so the exit of an instantly failing
        // process cannot be handled before its handle is recorded.
        let mut runtime = self.runtime.write().await;
        let spawned = process::spawn_service(
            self.control.as_ref(),
            SpawnRequest {
                service_id: id,
                generation,
                command: &service.command,
                cwd: &service.cwd,
                env,
            },
            self.events.clone(),
        );
        let state = runtime
            .entry(id.to_string())
            .or_insert_with(|| RuntimeState::new(self.options.log_capacity));

        match spawned {
            Ok(spawned) => {
                let pid = spawned.pid;
                state.handle = Some(ProcessHandle {
                    pid,
                    generation,
                    exited: spawned.exited,
                });
                state.started_at = Some(Instant::now());
                state.active_port = active_port;
                self.note(state, id, LogLevel::Info, format!("Started (pid {pid})"));
                self.registry
                    .update_display(id, |s| {
                        s.pid = Some(pid);
                        s.active_port = active_port;
                    })
                    .await;
                drop(runtime);

                let inner = Arc::clone(self);
                let id = id.to_string();
                tokio::spawn(async move {
                    inner.promote_when_ready(id, generation, active_port).await;
                });
                true
            }
            Err(e) => {
                state.active_port = None;
                self.note(state, id, LogLevel::Error, format!("Failed to start: {e}"));
                self.registry
                    .update_display(id, |s| {
                        s.status = ServiceStatus::Crashed;
                        s.pid = None;
                        s.active_port = None;
                    })
                    .await;
                false
            }
        }
    }

    /// Ports held by other managed services that are starting or running.
    async fn managed_port_claims(&self, id: &str) -> Vec<PortClaim> {
        let runtime = self.runtime.read().await;
        let mut claims = Vec::new();
        for (other_id, state) in runtime.iter() {
            let Some(claimed) = state.active_port else {
                continue;
            };
            if other_id == id || state.handle.is_none() {
                continue;
            }
            if let Some(other) = self.registry.get_service(other_id).await
                && other.status.is_active()
            {
                claims.push(PortClaim {
                    service_id: other.id,
                    service_name: other.name,
                    port: claimed,
                });
            }
        }
        claims
    }

    async fn promote_when_ready(self: Arc<Self>, id: String, generation: u64, port: Option<u16>) {
        let Some(port) = port else {
            tokio::time::sleep(self.options.no_port_grace).await;
            self.promote(&id, generation).await;
            return;
        };

        let outcome = health::wait_for_port(
            port,
            self.options.ready_poll_interval,
            self.options.ready_timeout,
            || {
                let inner = Arc::clone(&self);
                let id = id.clone();
                async move { inner.is_starting(&id, generation).await }
            },
        )
        .await;

        match outcome {
            WaitOutcome::Passed => {
                if self.promote(&id, generation).await {
                    self.log(&id, LogLevel::Info, format!("Ready on port {port}"))
                        .await;
                    if let Some(service) = self.registry.get_service(&id).await {
                        self.ready_hook.on_ready(&service, port);
                    }
                }
            }
            WaitOutcome::TimedOut => {
                if self.promote(&id, generation).await {
                    self.log(
                        &id,
                        LogLevel::Warn,
                        format!(
                            "Port {port} did not accept connections within {}s; marking as running",
                            self.options.ready_timeout.as_secs()
                        ),
                    )
                    .await;
                }
            }
            WaitOutcome::Aborted => {}
        }
    }

    async fn is_starting(&self, id: &str, generation: u64) -> bool {
        let runtime = self.runtime.read().await;
        let current = runtime
            .get(id)
            .and_then(|state| state.handle.as_ref())
            .is_some_and(|handle| handle.generation == generation);
        if !current {
            return false;
        }
        self.registry
            .get_service(id)
            .await
            .is_some_and(|s| s.status == ServiceStatus::Starting)
    }

    /// Move `starting` to `running` if `generation` is still the live
    /// process. The runtime lock is held across the check and the write so
    /// an exit cannot slip in between.
    async fn promote(&self, id: &str, generation: u64) -> bool {
        let runtime = self.runtime.read().await;
        let current = runtime
            .get(id)
            .and_then(|state| state.handle.as_ref())
            .is_some_and(|handle| handle.generation == generation);
        if !current {
            return false;
        }
        let mut promoted = false;
        self.registry
            .update_display(id, |s| {
                if s.status == ServiceStatus::Starting {
                    s.status = ServiceStatus::Running;
                    promoted = true;
                }
            })
            .await;
        promoted
    }

    async fn stop_locked(&self, id: &str) -> bool {
        if self.registry.get_service(id).await.is_none() {
            return false;
        }

        let handle = {
            let mut runtime = self.runtime.write().await;
            let state = runtime
                .entry(id.to_string())
                .or_insert_with(|| RuntimeState::new(self.options.log_capacity));
            state.manually_stopped = true;
            state.crashes = None;
            state.cancel_pending_restart();
            if state.handle.is_none() {
                state.started_at = None;
                state.active_port = None;
            }
            state.handle.clone()
        };

        let Some(handle) = handle else {
            self.registry
                .update_display(id, |s| {
                    s.status = ServiceStatus::Stopped;
                    s.pid = None;
                    s.active_port = None;
                })
                .await;
            return true;
        };

        self.log(id, LogLevel::Info, format!("Stopping (pid {})", handle.pid))
            .await;
        let exited = self.terminate_and_wait(id, &handle).await;

        let mut runtime = self.runtime.write().await;
        if let Some(state) = runtime.get_mut(id) {
            if state
                .handle
                .as_ref()
                .is_some_and(|h| h.generation == handle.generation)
            {
                state.handle = None;
            }
            state.started_at = None;
            state.active_port = None;
            if exited {
                self.note(state, id, LogLevel::Info, "Stopped".to_string());
            } else {
                self.note(
                    state,
                    id,
                    LogLevel::Error,
                    format!("Process {} did not exit after kill", handle.pid),
                );
            }
        }
        self.registry
            .update_display(id, |s| {
                s.status = ServiceStatus::Stopped;
                s.pid = None;
                s.active_port = None;
            })
            .await;
        exited
    }

    /// Terminate the tree, escalating to a forced kill after the grace
    /// period. True once the root has been reaped and no member of its
    /// tree is left running.
    async fn terminate_and_wait(&self, id: &str, handle: &ProcessHandle) -> bool {
        let mut exited = handle.exited.clone();
        let already_exited = *exited.borrow();
        if already_exited && !self.control.tree_alive(handle.pid).await {
            return true;
        }

        let grace_ends = Instant::now() + self.options.kill_grace;
        if let Err(e) = self
            .control
            .terminate(handle.pid, self.options.kill_timeout)
            .await
        {
            self.log(id, LogLevel::Warn, format!("Terminate failed: {e}"))
                .await;
        }
        let root_exited = wait_exited(&mut exited, self.options.kill_grace).await;
        if root_exited && self.wait_tree_gone(handle.pid, grace_ends).await {
            return true;
        }

        let message = if root_exited {
            format!(
                "Process {} exited but its children are still running after {}ms, killing",
                handle.pid,
                self.options.kill_grace.as_millis()
            )
        } else {
            format!(
                "Process {} still running after {}ms, killing",
                handle.pid,
                self.options.kill_grace.as_millis()
            )
        };
        self.log(id, LogLevel::Warn, message).await;
        if let Err(e) = self
            .control
            .force_kill(handle.pid, self.options.kill_timeout)
            .await
        {
            self.log(id, LogLevel::Error, format!("Kill failed: {e}"))
                .await;
        }

        let kill_ends = Instant::now() + self.options.kill_timeout;
        let root_exited =
            root_exited || wait_exited(&mut exited, self.options.kill_timeout).await;
        root_exited && self.wait_tree_gone(handle.pid, kill_ends).await
    }

    async fn wait_tree_gone(&self, pid: u32, deadline: Instant) -> bool {
        loop {
            if !self.control.tree_alive(pid).await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(TREE_POLL_INTERVAL).await;
        }
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    async fn handle_event(self: &Arc<Self>, event: ProcessEvent) {
        match event {
            ProcessEvent::Output {
                service_id,
                level,
                line,
                ..
            } => {
                let mut runtime = self.runtime.write().await;
                if let Some(state) = runtime.get_mut(&service_id) {
                    self.record(state, &service_id, level, line);
                }
            }
            ProcessEvent::Exited {
                service_id,
                generation,
                code,
            } => {
                let reason = match code {
                    Some(code) => format!("exit code {code}"),
                    None => "terminated by signal".to_string(),
                };
                self.handle_exit(&service_id, generation, code == Some(0), reason)
                    .await;
            }
            ProcessEvent::Failed {
                service_id,
                generation,
                error,
            } => {
                self.handle_exit(&service_id, generation, false, format!("wait failed: {error}"))
                    .await;
            }
        }
    }

    async fn handle_exit(self: &Arc<Self>, id: &str, generation: u64, success: bool, reason: String) {
        let mut runtime = self.runtime.write().await;
        let Some(state) = runtime.get_mut(id) else {
            return;
        };
        if !state
            .handle
            .as_ref()
            .is_some_and(|h| h.generation == generation)
        {
            tracing::debug!(service = %id, generation, "ignoring exit of replaced process");
            return;
        }
        state.handle = None;
        state.started_at = None;
        state.active_port = None;

        let Some(service) = self.registry.get_service(id).await else {
            return;
        };

        let status = if state.manually_stopped {
            self.note(state, id, LogLevel::Info, format!("Process exited ({reason})"));
            ServiceStatus::Stopped
        } else if success {
            self.note(state, id, LogLevel::Info, format!("Process exited ({reason})"));
            ServiceStatus::Stopped
        } else {
            self.note(state, id, LogLevel::Error, format!("Process crashed ({reason})"));
            ServiceStatus::Crashed
        };

        self.registry
            .update_display(id, |s| {
                s.status = status;
                s.pid = None;
                s.active_port = None;
            })
            .await;

        if status != ServiceStatus::Crashed || !service.auto_restart {
            return;
        }

        let policy = &self.options.crash;
        match process::register_crash(&mut state.crashes, Instant::now(), policy) {
            CrashDecision::Restart { attempt, delay } => {
                self.note(
                    state,
                    id,
                    LogLevel::Warn,
                    format!(
                        "Restarting in {}ms (attempt {attempt}/{})",
                        delay.as_millis(),
                        policy.max_restarts
                    ),
                );
                let token = self.next_id();
                let inner = Arc::clone(self);
                let restart_id = id.to_string();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.run_scheduled_restart(&restart_id, token).await;
                });
                state.pending_restart = Some(PendingRestart { token, task });
            }
            CrashDecision::GiveUp { crashes } => {
                self.note(
                    state,
                    id,
                    LogLevel::Error,
                    format!(
                        "Crashed {crashes} times within {}s; not restarting. The service must be fixed and started manually",
                        policy.window.as_secs()
                    ),
                );
            }
        }
    }

    async fn run_scheduled_restart(self: &Arc<Self>, id: &str, token: u64) {
        let lock = self.transition_lock(id).await;
        let _guard = lock.lock().await;
        {
            let mut runtime = self.runtime.write().await;
            let Some(state) = runtime.get_mut(id) else {
                return;
            };
            match &state.pending_restart {
                Some(pending) if pending.token == token => state.pending_restart = None,
                _ => return,
            }
        }
        self.start_locked(id).await;
    }
}

async fn wait_exited(exited: &mut watch::Receiver<bool>, timeout: Duration) -> bool {
    let waited = tokio::time::timeout(timeout, exited.wait_for(|done| *done))
        .await
        .map(|result| result.is_ok());
    match waited {
        Ok(true) => true,
        // Sender dropped; trust the last value it published.
        Ok(false) => *exited.borrow(),
        Err(_) => false,
    }
}

async fn run_event_loop(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<ProcessEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_event(event).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
