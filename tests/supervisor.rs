#![cfg(unix)]

use devdash::config::{Service, ServiceConfig, ServiceStatus};
use devdash::log::{LogEntry, LogLevel};
use devdash::port::PortOptions;
use devdash::process::CrashPolicy;
use devdash::registry::Registry;
use devdash::supervisor::{ReadyHook, Supervisor, SupervisorOptions};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, sleep};

const WAIT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(25);

fn fast_options() -> SupervisorOptions {
    SupervisorOptions {
        kill_grace: Duration::from_millis(500),
        kill_timeout: Duration::from_secs(2),
        ready_poll_interval: Duration::from_millis(50),
        ready_timeout: Duration::from_secs(10),
        no_port_grace: Duration::from_millis(100),
        crash: CrashPolicy {
            window: Duration::from_secs(60),
            max_restarts: 3,
            backoff_unit: Duration::from_millis(50),
        },
        port: PortOptions {
            retries: 1,
            retry_delay: Duration::from_millis(10),
            ..PortOptions::default()
        },
        log_capacity: 500,
    }
}

struct Fixture {
    supervisor: Supervisor,
    registry: Arc<Registry>,
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self::with_options(fast_options())
    }

    fn with_options(options: SupervisorOptions) -> Self {
        let registry = Arc::new(Registry::in_memory());
        Self {
            supervisor: Supervisor::new(Arc::clone(&registry), options),
            registry,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn path(&self, name: &str) -> String {
        self.dir.path().join(name).to_string_lossy().into_owned()
    }

    async fn add(&self, name: &str, command: &str, port: Option<u16>, auto_restart: bool) -> String {
        self.registry
            .add_service(ServiceConfig {
                name: name.to_string(),
                command: command.to_string(),
                cwd: self.dir.path().to_string_lossy().into_owned(),
                port,
                auto_restart: Some(auto_restart),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn service(&self, id: &str) -> Service {
        self.registry.get_service(id).await.unwrap()
    }

    async fn wait_status(&self, id: &str, want: ServiceStatus) {
        let deadline = Instant::now() + WAIT;
        loop {
            let status = self.supervisor.status(id).await;
            if status == Some(want) {
                return;
            }
            if Instant::now() >= deadline {
                panic!("{id} never became {want}, last status {status:?}");
            }
            sleep(POLL).await;
        }
    }

    async fn wait_log(&self, id: &str, needle: &str) -> LogEntry {
        let deadline = Instant::now() + WAIT;
        loop {
            let logs = self.supervisor.get_logs(id).await;
            if let Some(entry) = logs.iter().find(|e| e.message.contains(needle)) {
                return entry.clone();
            }
            if Instant::now() >= deadline {
                panic!("no log containing {needle:?} for {id}: {logs:#?}");
            }
            sleep(POLL).await;
        }
    }

    async fn has_log(&self, id: &str, needle: &str) -> bool {
        self.supervisor
            .get_logs(id)
            .await
            .iter()
            .any(|e| e.message.contains(needle))
    }
}

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}

fn count_lines(path: &str) -> usize {
    std::fs::read_to_string(path)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

/// Alive and not a zombie waiting for a reaper.
fn process_alive(pid: u32) -> bool {
    let Ok(output) = std::process::Command::new("ps")
        .args(["-o", "stat=", "-p", &pid.to_string()])
        .output()
    else {
        return false;
    };
    let stat = String::from_utf8_lossy(&output.stdout);
    let stat = stat.trim();
    !stat.is_empty() && !stat.starts_with('Z')
}

async fn wait_dead(pid: u32) {
    let deadline = Instant::now() + WAIT;
    while process_alive(pid) {
        if Instant::now() >= deadline {
            panic!("pid {pid} still alive");
        }
        sleep(POLL).await;
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_clean_exit_settles_to_stopped() {
    let fx = Fixture::new();
    let id = fx.add("once", "echo hello", None, false).await;

    assert!(fx.supervisor.start(&id).await);
    fx.wait_log(&id, "exit code 0").await;
    fx.wait_status(&id, ServiceStatus::Stopped).await;

    let hello = fx.wait_log(&id, "hello").await;
    assert_eq!(hello.level, LogLevel::Info);
    let service = fx.service(&id).await;
    assert_eq!(service.pid, None);

    // The no-port promotion must not resurrect an exited process.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(fx.supervisor.status(&id).await, Some(ServiceStatus::Stopped));
}

#[tokio::test]
async fn test_start_while_running_is_refused() {
    let fx = Fixture::new();
    let id = fx.add("sleeper", "sleep 30", None, false).await;

    assert!(fx.supervisor.start(&id).await);
    fx.wait_status(&id, ServiceStatus::Running).await;
    let pid = fx.service(&id).await.pid;
    assert!(pid.is_some());

    assert!(!fx.supervisor.start(&id).await);
    assert_eq!(fx.service(&id).await.pid, pid);
    assert!(fx.has_log(&id, "already running").await);

    assert!(fx.supervisor.stop(&id).await);
}

#[tokio::test]
async fn test_start_while_starting_is_refused() {
    let fx = Fixture::new();
    let port = free_port().await;
    let id = fx.add("web", "sleep 30", Some(port), false).await;

    assert!(fx.supervisor.start(&id).await);
    assert_eq!(fx.supervisor.status(&id).await, Some(ServiceStatus::Starting));
    assert!(!fx.supervisor.start(&id).await);

    assert!(fx.supervisor.stop(&id).await);
}

#[tokio::test]
async fn test_stop_without_process() {
    let fx = Fixture::new();
    let id = fx.add("idle", "sleep 30", None, false).await;
    assert!(fx.supervisor.stop(&id).await);
    assert_eq!(fx.supervisor.status(&id).await, Some(ServiceStatus::Stopped));
}

#[tokio::test]
async fn test_no_port_service_promoted_after_grace() {
    let fx = Fixture::new();
    let id = fx.add("worker", "sleep 30", None, false).await;

    assert!(fx.supervisor.start(&id).await);
    assert_eq!(fx.supervisor.status(&id).await, Some(ServiceStatus::Starting));
    fx.wait_status(&id, ServiceStatus::Running).await;

    fx.supervisor.stop(&id).await;
}

#[tokio::test]
async fn test_restart_spawns_new_process() {
    let fx = Fixture::new();
    let id = fx.add("sleeper", "sleep 30", None, true).await;

    assert!(fx.supervisor.start(&id).await);
    fx.wait_status(&id, ServiceStatus::Running).await;
    let first = fx.service(&id).await.pid.unwrap();

    assert!(fx.supervisor.restart(&id).await);
    let second = fx.service(&id).await.pid.unwrap();
    assert_ne!(first, second);
    wait_dead(first).await;

    // The old process was stopped on purpose; nothing may be rescheduled.
    sleep(Duration::from_millis(300)).await;
    assert!(!fx.has_log(&id, "Restarting in").await);
    assert_eq!(fx.service(&id).await.pid, Some(second));

    fx.supervisor.stop(&id).await;
}

#[tokio::test]
async fn test_manual_stop_suppresses_auto_restart() {
    let fx = Fixture::new();
    let id = fx.add("sleeper", "sleep 30", None, true).await;

    assert!(fx.supervisor.start(&id).await);
    fx.wait_status(&id, ServiceStatus::Running).await;
    assert!(fx.supervisor.stop(&id).await);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(fx.supervisor.status(&id).await, Some(ServiceStatus::Stopped));
    assert!(!fx.has_log(&id, "Restarting in").await);
    assert!(!fx.has_log(&id, "crashed").await);
}

// ---------------------------------------------------------------------------
// Crash recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_crash_backoff_gives_up_after_three_restarts() {
    let fx = Fixture::new();
    let marker = fx.path("runs");
    let id = fx
        .add("broken", &format!("echo run >> '{marker}'; exit 1"), None, true)
        .await;

    assert!(fx.supervisor.start(&id).await);
    let give_up = fx.wait_log(&id, "must be fixed and started manually").await;
    assert_eq!(give_up.level, LogLevel::Error);

    sleep(Duration::from_millis(500)).await;
    assert_eq!(count_lines(&marker), 4);
    assert_eq!(fx.supervisor.status(&id).await, Some(ServiceStatus::Crashed));

    let logs = fx.supervisor.get_logs(&id).await;
    let restarts = logs
        .iter()
        .filter(|e| e.message.starts_with("Restarting in"))
        .count();
    assert_eq!(restarts, 3);
    assert!(logs.iter().any(|e| e.message.contains("attempt 3/3")));
}

#[tokio::test]
async fn test_crash_without_auto_restart_stays_crashed() {
    let fx = Fixture::new();
    let marker = fx.path("runs");
    let id = fx
        .add("broken", &format!("echo run >> '{marker}'; exit 2"), None, false)
        .await;

    assert!(fx.supervisor.start(&id).await);
    fx.wait_status(&id, ServiceStatus::Crashed).await;
    let crash = fx.wait_log(&id, "exit code 2").await;
    assert_eq!(crash.level, LogLevel::Error);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(count_lines(&marker), 1);
}

#[tokio::test]
async fn test_stop_cancels_pending_restart() {
    let mut options = fast_options();
    options.crash.backoff_unit = Duration::from_secs(1);
    let fx = Fixture::with_options(options);
    let marker = fx.path("runs");
    let id = fx
        .add("broken", &format!("echo run >> '{marker}'; exit 1"), None, true)
        .await;

    assert!(fx.supervisor.start(&id).await);
    fx.wait_log(&id, "Restarting in").await;
    assert!(fx.supervisor.stop(&id).await);

    sleep(Duration::from_millis(1500)).await;
    assert_eq!(count_lines(&marker), 1);
    assert_eq!(fx.supervisor.status(&id).await, Some(ServiceStatus::Stopped));
}

#[tokio::test]
async fn test_delete_cancels_pending_restart() {
    let mut options = fast_options();
    options.crash.backoff_unit = Duration::from_millis(500);
    let fx = Fixture::with_options(options);
    let marker = fx.path("runs");
    let id = fx
        .add("broken", &format!("echo run >> '{marker}'; exit 1"), None, true)
        .await;

    assert!(fx.supervisor.start(&id).await);
    fx.wait_log(&id, "Restarting in").await;
    assert!(fx.supervisor.delete_service(&id).await);

    sleep(Duration::from_millis(1000)).await;
    assert_eq!(count_lines(&marker), 1);
    assert!(fx.registry.get_service(&id).await.is_none());
    assert!(fx.supervisor.get_logs(&id).await.is_empty());
}

// ---------------------------------------------------------------------------
// Stopping process trees
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stop_kills_whole_tree() {
    let fx = Fixture::new();
    let child_file = fx.path("child.pid");
    let id = fx
        .add(
            "tree",
            &format!("sleep 30 & echo $! > '{child_file}'; wait"),
            None,
            false,
        )
        .await;

    assert!(fx.supervisor.start(&id).await);
    let deadline = Instant::now() + WAIT;
    let child: u32 = loop {
        if let Ok(text) = std::fs::read_to_string(&child_file)
            && let Ok(pid) = text.trim().parse()
        {
            break pid;
        }
        assert!(Instant::now() < deadline, "child pid never written");
        sleep(POLL).await;
    };
    assert!(process_alive(child));

    assert!(fx.supervisor.stop(&id).await);
    wait_dead(child).await;
    let service = fx.service(&id).await;
    assert_eq!(service.status, ServiceStatus::Stopped);
    assert_eq!(service.pid, None);
}

#[tokio::test]
async fn test_stop_force_kills_after_grace() {
    let fx = Fixture::new();
    let id = fx.add("stubborn", "trap '' TERM; sleep 30", None, false).await;

    assert!(fx.supervisor.start(&id).await);
    fx.wait_status(&id, ServiceStatus::Running).await;
    let pid = fx.service(&id).await.pid.unwrap();

    let started = Instant::now();
    assert!(fx.supervisor.stop(&id).await);
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(fx.has_log(&id, "killing").await);
    wait_dead(pid).await;
}

#[tokio::test]
async fn test_stop_kills_group_member_that_ignores_term() {
    let fx = Fixture::new();
    let child_file = fx.path("child.pid");
    let id = fx
        .add(
            "orphan",
            &format!("(trap '' TERM; exec sleep 30) & echo $! > '{child_file}'; wait"),
            None,
            false,
        )
        .await;

    assert!(fx.supervisor.start(&id).await);
    let deadline = Instant::now() + WAIT;
    let child: u32 = loop {
        if let Ok(text) = std::fs::read_to_string(&child_file)
            && let Ok(pid) = text.trim().parse()
        {
            break pid;
        }
        assert!(Instant::now() < deadline, "child pid never written");
        sleep(POLL).await;
    };
    assert!(process_alive(child));

    assert!(fx.supervisor.stop(&id).await);
    assert!(!process_alive(child), "child {child} survived stop");
    assert!(fx.has_log(&id, "killing").await);
    assert_eq!(fx.service(&id).await.status, ServiceStatus::Stopped);
}

#[tokio::test]
async fn test_stop_all_stops_everything() {
    let fx = Fixture::new();
    let a = fx.add("a", "sleep 30", None, true).await;
    let b = fx.add("b", "sleep 30", None, true).await;
    let idle = fx.add("idle", "sleep 30", None, true).await;

    assert!(fx.supervisor.start(&a).await);
    assert!(fx.supervisor.start(&b).await);
    let pids = [
        fx.service(&a).await.pid.unwrap(),
        fx.service(&b).await.pid.unwrap(),
    ];

    fx.supervisor.stop_all().await;
    for id in [&a, &b, &idle] {
        let service = fx.service(id).await;
        assert_eq!(service.status, ServiceStatus::Stopped);
        assert_eq!(service.pid, None);
    }
    for pid in pids {
        wait_dead(pid).await;
    }
}

#[tokio::test]
async fn test_delete_running_service() {
    let fx = Fixture::new();
    let id = fx.add("sleeper", "sleep 30", None, false).await;

    assert!(fx.supervisor.start(&id).await);
    let pid = fx.service(&id).await.pid.unwrap();
    assert!(fx.supervisor.delete_service(&id).await);

    wait_dead(pid).await;
    assert!(fx.registry.get_service(&id).await.is_none());
    assert!(!fx.supervisor.delete_service(&id).await);
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stdout_is_info_stderr_is_error() {
    let fx = Fixture::new();
    let id = fx
        .add("noisy", "echo to-stdout; echo to-stderr >&2", None, false)
        .await;

    assert!(fx.supervisor.start(&id).await);
    assert_eq!(fx.wait_log(&id, "to-stdout").await.level, LogLevel::Info);
    assert_eq!(fx.wait_log(&id, "to-stderr").await.level, LogLevel::Error);

    fx.supervisor.clear_logs(&id).await;
    assert!(fx.supervisor.get_logs(&id).await.is_empty());
}

#[tokio::test]
async fn test_log_buffer_is_bounded() {
    let mut options = fast_options();
    options.log_capacity = 20;
    let fx = Fixture::with_options(options);
    let id = fx
        .add("chatty", "i=0; while [ $i -lt 50 ]; do echo line$i; i=$((i+1)); done", None, false)
        .await;

    assert!(fx.supervisor.start(&id).await);
    fx.wait_log(&id, "exit code 0").await;
    let logs = fx.supervisor.get_logs(&id).await;
    assert_eq!(logs.len(), 20);
    assert_eq!(logs.last().unwrap().message, "Process exited (exit code 0)");
}

#[tokio::test]
async fn test_subscribers_receive_entries() {
    let fx = Fixture::new();
    let mut rx = fx.supervisor.subscribe_logs();
    let id = fx.add("once", "echo hi", None, false).await;

    assert!(fx.supervisor.start(&id).await);
    let deadline = Instant::now() + WAIT;
    loop {
        let log = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("no broadcast entry")
            .unwrap();
        assert_eq!(log.service_id, id);
        if log.entry.message == "hi" {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingHook {
    calls: Mutex<Vec<(String, u16)>>,
}

impl ReadyHook for RecordingHook {
    fn on_ready(&self, service: &Service, port: u16) {
        self.calls.lock().unwrap().push((service.id.clone(), port));
    }
}

#[tokio::test]
async fn test_port_conflict_between_managed_services() {
    let fx = Fixture::new();
    let port = free_port().await;
    let a = fx.add("a", "sleep 30", Some(port), false).await;
    let b = fx
        .add("b", "echo port=$PORT; sleep 30", Some(port), false)
        .await;

    assert!(fx.supervisor.start(&a).await);
    let a_pid = fx.service(&a).await.pid;
    assert_eq!(fx.service(&a).await.active_port, Some(port));

    assert!(fx.supervisor.start(&b).await);
    let line = fx.wait_log(&b, "port=").await;
    let substitute: u16 = line.message.trim_start_matches("port=").parse().unwrap();
    assert!(substitute > port);
    assert_eq!(fx.service(&b).await.active_port, Some(substitute));
    assert!(fx.has_log(&b, "in use by service 'a'").await);

    let a_service = fx.service(&a).await;
    assert_eq!(a_service.active_port, Some(port));
    assert_eq!(a_service.pid, a_pid);
    assert!(a_service.status.is_active());

    fx.supervisor.stop_all().await;
    assert_eq!(fx.service(&b).await.active_port, None);
}

#[tokio::test]
async fn test_unbound_substitute_is_not_handed_out_twice() {
    let fx = Fixture::new();
    let port = free_port().await;
    let a = fx.add("a", "sleep 30", Some(port), false).await;
    let b = fx.add("b", "sleep 30", Some(port), false).await;
    let c = fx.add("c", "sleep 30", Some(port), false).await;

    assert!(fx.supervisor.start(&a).await);
    assert!(fx.supervisor.start(&b).await);
    assert!(fx.supervisor.start(&c).await);

    let b_port = fx.service(&b).await.active_port.unwrap();
    let c_port = fx.service(&c).await.active_port.unwrap();
    assert!(b_port > port);
    assert!(c_port > port);
    assert_ne!(b_port, c_port);

    fx.supervisor.stop_all().await;
}

#[tokio::test]
async fn test_external_port_holder_is_avoided() {
    let fx = Fixture::new();
    let holder = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = holder.local_addr().unwrap().port();
    let id = fx
        .add("web", "echo port=$PORT; sleep 30", Some(port), false)
        .await;

    assert!(fx.supervisor.start(&id).await);
    let line = fx.wait_log(&id, "port=").await;
    let substitute: u16 = line.message.trim_start_matches("port=").parse().unwrap();
    assert!(substitute > port);
    assert!(fx.has_log(&id, "in use by another process").await);

    fx.supervisor.stop(&id).await;
}

#[tokio::test]
async fn test_free_port_gets_no_override() {
    let fx = Fixture::new();
    let port = free_port().await;
    let id = fx
        .add("web", "echo port=${PORT:-unset}; sleep 30", Some(port), false)
        .await;

    assert!(fx.supervisor.start(&id).await);
    fx.wait_log(&id, "port=unset").await;
    assert_eq!(fx.service(&id).await.active_port, Some(port));

    fx.supervisor.stop(&id).await;
}

#[tokio::test]
async fn test_ready_when_port_accepts_connections() {
    let registry = Arc::new(Registry::in_memory());
    let hook = Arc::new(RecordingHook::default());
    let supervisor =
        Supervisor::with_ready_hook(Arc::clone(&registry), fast_options(), hook.clone());
    let port = free_port().await;
    let id = registry
        .add_service(ServiceConfig {
            name: "web".to_string(),
            command: "sleep 30".to_string(),
            port: Some(port),
            auto_restart: Some(false),
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(supervisor.start(&id).await);
    sleep(Duration::from_millis(300)).await;
    assert_eq!(supervisor.status(&id).await, Some(ServiceStatus::Starting));
    assert!(hook.calls.lock().unwrap().is_empty());

    let _listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .unwrap();
    let deadline = Instant::now() + WAIT;
    while hook.calls.lock().unwrap().is_empty() {
        assert!(Instant::now() < deadline, "ready hook never called");
        sleep(POLL).await;
    }
    assert_eq!(supervisor.status(&id).await, Some(ServiceStatus::Running));
    assert_eq!(*hook.calls.lock().unwrap(), vec![(id.clone(), port)]);

    supervisor.stop(&id).await;
}

#[tokio::test]
async fn test_ready_timeout_still_promotes() {
    let mut options = fast_options();
    options.ready_timeout = Duration::from_millis(200);
    let fx = Fixture::with_options(options);
    let port = free_port().await;
    let id = fx.add("slow", "sleep 30", Some(port), false).await;

    assert!(fx.supervisor.start(&id).await);
    fx.wait_status(&id, ServiceStatus::Running).await;
    let warning = fx.wait_log(&id, "did not accept connections").await;
    assert_eq!(warning.level, LogLevel::Warn);

    fx.supervisor.stop(&id).await;
}

// ---------------------------------------------------------------------------
// Stats and housekeeping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stats_refresh_and_reset() {
    let fx = Fixture::new();
    let id = fx.add("sleeper", "sleep 30", None, false).await;

    assert!(fx.supervisor.start(&id).await);
    fx.wait_status(&id, ServiceStatus::Running).await;
    sleep(Duration::from_millis(1100)).await;
    fx.supervisor.update_service_stats().await;

    let service = fx.service(&id).await;
    assert!(service.memory.ends_with(" MB"), "memory: {}", service.memory);
    assert!(service.cpu.ends_with('%'));
    assert!(service.uptime.ends_with('s'), "uptime: {}", service.uptime);
    assert_ne!(service.uptime, "0s");

    assert!(fx.supervisor.stop(&id).await);
    fx.supervisor.update_service_stats().await;
    let service = fx.service(&id).await;
    assert_eq!(service.cpu, "0%");
    assert_eq!(service.memory, "0 MB");
    assert_eq!(service.uptime, "0s");
}

#[tokio::test]
async fn test_stale_lock_removed_on_start() {
    let fx = Fixture::new();
    let lock = fx.dir.path().join(".next/dev/lock");
    std::fs::create_dir_all(lock.parent().unwrap()).unwrap();
    std::fs::write(&lock, "").unwrap();
    let id = fx.add("next", "true", None, false).await;

    assert!(fx.supervisor.start(&id).await);
    assert!(!Path::new(&lock).exists());
    assert!(fx.has_log(&id, "Removed stale lock file").await);
}

#[tokio::test]
async fn test_start_auto_services_only_starts_flagged() {
    let fx = Fixture::new();
    let auto = fx
        .registry
        .add_service(ServiceConfig {
            name: "auto".to_string(),
            command: "sleep 30".to_string(),
            auto_start: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();
    let manual = fx.add("manual", "sleep 30", None, false).await;

    let started = fx.supervisor.start_auto_services().await;
    assert_eq!(started, vec![auto.clone()]);
    assert!(fx.service(&auto).await.pid.is_some());
    assert!(fx.service(&manual).await.pid.is_none());

    fx.supervisor.stop_all().await;
}
