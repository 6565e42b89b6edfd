use crate::log::{self, LogLevel};
use crate::sys::ProcessControl;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const CRASH_WINDOW: Duration = Duration::from_secs(60);
pub const MAX_CRASH_RESTARTS: u32 = 3;
pub const RESTART_BACKOFF_UNIT: Duration = Duration::from_secs(5);

/// How long the monitor waits for buffered output after the child exits.
pub const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Lock files that dev tools leave behind in their build cache when killed
/// mid-run, relative to the service's working directory.
pub const STALE_LOCK_FILES: &[&str] = &[".next/dev/lock"];

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("failed to spawn process: {0}")]
    SpawnFailed(#[from] std::io::Error),
    #[error("spawned process has no pid")]
    MissingPid,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Everything a running child reports back to the supervisor. `generation`
/// identifies the spawn so late events from a replaced process are ignored.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Output {
        service_id: String,
        generation: u64,
        level: LogLevel,
        line: String,
    },
    Exited {
        service_id: String,
        generation: u64,
        code: Option<i32>,
    },
    Failed {
        service_id: String,
        generation: u64,
        error: String,
    },
}

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

pub struct SpawnRequest<'a> {
    pub service_id: &'a str,
    pub generation: u64,
    pub command: &'a str,
    pub cwd: &'a str,
    pub env: Vec<(String, String)>,
}

/// A successfully spawned child. `exited` flips to true once the OS has
/// reaped it.
#[derive(Debug, Clone)]
pub struct Spawned {
    pub pid: u32,
    pub exited: watch::Receiver<bool>,
}

pub fn spawn_service(
    control: &dyn ProcessControl,
    request: SpawnRequest<'_>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> Result<Spawned, ProcessError> {
    if request.command.trim().is_empty() {
        return Err(ProcessError::InvalidCommand("command is empty".to_string()));
    }

    let mut cmd = control.shell_command(request.command);
    if !request.cwd.is_empty() {
        cmd.current_dir(request.cwd);
    }
    cmd.envs(request.env);
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    control.prepare(&mut cmd);

    let mut child = cmd.spawn()?;
    let Some(pid) = child.id() else {
        return Err(ProcessError::MissingPid);
    };

    let service_id = request.service_id.to_string();
    let generation = request.generation;
    let mut readers = Vec::new();

    if let Some(stdout) = child.stdout.take() {
        readers.push(log::spawn_output_reader(
            service_id.clone(),
            generation,
            LogLevel::Info,
            stdout,
            events.clone(),
        ));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(log::spawn_output_reader(
            service_id.clone(),
            generation,
            LogLevel::Error,
            stderr,
            events.clone(),
        ));
    }

    let (exited_tx, exited_rx) = watch::channel(false);

    tokio::spawn(async move {
        let status = child.wait().await;
        let _ = exited_tx.send(true);

        // Let the readers flush what the child wrote before it died. A
        // grandchild holding the pipe open must not delay the exit event.
        for reader in readers {
            let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await;
        }

        let event = match status {
            Ok(status) => ProcessEvent::Exited {
                service_id,
                generation,
                code: status.code(),
            },
            Err(e) => ProcessEvent::Failed {
                service_id,
                generation,
                error: e.to_string(),
            },
        };
        let _ = events.send(event);
    });

    Ok(Spawned {
        pid,
        exited: exited_rx,
    })
}

// ---------------------------------------------------------------------------
// Stale lock cleanup
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum LockCleanup {
    Removed(PathBuf),
    Failed(PathBuf, std::io::Error),
}

/// Remove known stale lock files under `cwd`. Best effort: failures are
/// reported, never raised.
pub fn cleanup_stale_locks(cwd: &Path) -> Vec<LockCleanup> {
    let mut results = Vec::new();
    for relative in STALE_LOCK_FILES {
        let path = cwd.join(relative);
        if !path.exists() {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => results.push(LockCleanup::Removed(path)),
            Err(e) => results.push(LockCleanup::Failed(path, e)),
        }
    }
    results
}

// ---------------------------------------------------------------------------
// Crash backoff
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CrashPolicy {
    /// Crashes further apart than this start a fresh count.
    pub window: Duration,
    pub max_restarts: u32,
    /// Restart delay is `attempt * backoff_unit`.
    pub backoff_unit: Duration,
}

impl Default for CrashPolicy {
    fn default() -> Self {
        Self {
            window: CRASH_WINDOW,
            max_restarts: MAX_CRASH_RESTARTS,
            backoff_unit: RESTART_BACKOFF_UNIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrashRecord {
    pub count: u32,
    pub first_crash: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashDecision {
    Restart { attempt: u32, delay: Duration },
    GiveUp { crashes: u32 },
}

/// Count a crash against the window and decide whether to restart.
pub fn register_crash(
    record: &mut Option<CrashRecord>,
    now: Instant,
    policy: &CrashPolicy,
) -> CrashDecision {
    let count = match record {
        Some(r) if now.saturating_duration_since(r.first_crash) <= policy.window => {
            r.count += 1;
            r.count
        }
        _ => {
            *record = Some(CrashRecord {
                count: 1,
                first_crash: now,
            });
            1
        }
    };

    if count <= policy.max_restarts {
        CrashDecision::Restart {
            attempt: count,
            delay: policy.backoff_unit.saturating_mul(count),
        }
    } else {
        CrashDecision::GiveUp { crashes: count }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
