use crate::sys::{ProcessControl, RootSample};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;
use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// CPU and memory of one service's process tree at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSnapshot {
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Copy)]
struct CpuSample {
    cpu_seconds: f64,
    at: Instant,
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

pub fn format_uptime(secs: u64) -> String {
    let minutes = secs / 60;
    let hours = minutes / 60;
    if hours > 0 {
        format!("{hours}h {}m", minutes % 60)
    } else if minutes > 0 {
        format!("{minutes}m {}s", secs % 60)
    } else {
        format!("{secs}s")
    }
}

/// `512 MB`, `37.5 MB`, `2.0 GB`.
pub fn format_memory(mb: f64) -> String {
    let mb = if mb.is_finite() { mb.max(0.0) } else { 0.0 };
    if mb >= 1024.0 {
        return format!("{:.1} GB", mb / 1024.0);
    }
    let rounded = (mb * 10.0).round() / 10.0;
    if rounded.fract() == 0.0 {
        format!("{rounded:.0} MB")
    } else {
        format!("{rounded:.1} MB")
    }
}

pub fn format_cpu(percent: f64) -> String {
    if !percent.is_finite() || percent <= 0.0 {
        return "0%".to_string();
    }
    format!("{percent:.1}%")
}

fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

/// CPU percentage from two cumulative CPU-time samples of the same process.
fn cpu_percent_between(prev: CpuSample, cur: CpuSample) -> f64 {
    let wall = cur.at.saturating_duration_since(prev.at).as_secs_f64();
    if wall <= 0.0 {
        return 0.0;
    }
    ((cur.cpu_seconds - prev.cpu_seconds) / wall * 100.0).max(0.0)
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

/// Samples process trees. Call [`StatsCollector::refresh`] once per tick,
/// then [`StatsCollector::sample`] for each live service.
pub struct StatsCollector {
    system: System,
    cpu_samples: HashMap<String, CpuSample>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            cpu_samples: HashMap::new(),
        }
    }

    /// Rescan the process table on the blocking pool.
    pub async fn refresh(&mut self) {
        let mut system = std::mem::replace(&mut self.system, System::new());
        let refreshed = tokio::task::spawn_blocking(move || {
            system.refresh_processes(ProcessesToUpdate::All, true);
            system
        })
        .await;
        match refreshed {
            Ok(system) => self.system = system,
            Err(e) => tracing::warn!("process table refresh failed: {e}"),
        }
    }

    /// Sum CPU% and resident memory over `root` and all of its descendants.
    /// `None` when the root is not in the process table.
    pub fn tree_usage(&self, root: u32) -> Option<StatsSnapshot> {
        let root_pid = SysPid::from_u32(root);
        self.system.process(root_pid)?;

        let mut children: HashMap<SysPid, Vec<SysPid>> = HashMap::new();
        for (pid, process) in self.system.processes() {
            if process.thread_kind().is_some() {
                continue;
            }
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*pid);
            }
        }

        let mut cpu = 0.0f64;
        let mut bytes = 0u64;
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([root_pid]);
        while let Some(pid) = queue.pop_front() {
            if !seen.insert(pid) {
                continue;
            }
            if let Some(process) = self.system.process(pid) {
                cpu += f64::from(process.cpu_usage());
                bytes = bytes.saturating_add(process.memory());
            }
            if let Some(kids) = children.get(&pid) {
                queue.extend(kids.iter().copied());
            }
        }

        Some(StatsSnapshot {
            cpu_percent: cpu,
            memory_mb: bytes_to_mb(bytes),
        })
    }

    /// Sample the tree rooted at `pid`, falling back to the root process
    /// alone. CPU readings of zero are replaced by a CPU-time delta between
    /// successive samples for the same `key`.
    pub async fn sample(
        &mut self,
        key: &str,
        pid: u32,
        control: &dyn ProcessControl,
    ) -> Option<StatsSnapshot> {
        match self.tree_usage(pid) {
            Some(mut snapshot) => {
                if snapshot.cpu_percent <= 0.0
                    && let Some(root) = control.sample_root(pid).await
                {
                    snapshot.cpu_percent = self.cpu_from_root(key, root);
                }
                Some(snapshot)
            }
            None => {
                let root = control.sample_root(pid).await?;
                Some(StatsSnapshot {
                    cpu_percent: self.cpu_from_root(key, root),
                    memory_mb: bytes_to_mb(root.rss_bytes),
                })
            }
        }
    }

    fn cpu_from_root(&mut self, key: &str, root: RootSample) -> f64 {
        let current = CpuSample {
            cpu_seconds: root.cpu_seconds,
            at: Instant::now(),
        };
        match self.cpu_samples.insert(key.to_string(), current) {
            Some(previous) => cpu_percent_between(previous, current),
            None => 0.0,
        }
    }

    /// Drop any cached CPU baseline for `key`.
    pub fn forget(&mut self, key: &str) {
        self.cpu_samples.remove(key);
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
