use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

/// Cumulative CPU time and resident memory of a single process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RootSample {
    pub cpu_seconds: f64,
    pub rss_bytes: u64,
}

/// Platform-specific process operations used by the supervisor.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Build a command that runs `line` through the platform shell.
    fn shell_command(&self, line: &str) -> Command;

    /// Adjust a command before spawn so its whole tree can be signalled.
    fn prepare(&self, cmd: &mut Command);

    /// Ask the process (and its descendants) to exit.
    async fn terminate(&self, pid: u32, timeout: Duration) -> io::Result<()>;

    /// Kill the process tree outright.
    async fn force_kill(&self, pid: u32, timeout: Duration) -> io::Result<()>;

    fn is_alive(&self, pid: u32) -> bool;

    /// True while any process spawned into `pid`'s tree is still running,
    /// including members that outlived the root.
    async fn tree_alive(&self, pid: u32) -> bool {
        self.is_alive(pid)
    }

    /// Sample a single process without walking its tree.
    async fn sample_root(&self, pid: u32) -> Option<RootSample>;
}

pub fn native() -> Arc<dyn ProcessControl> {
    Arc::new(platform::Native)
}

/// Parse `ps` CPU time: `[DD-]HH:MM:SS`, `MM:SS` or `M:SS.ss`.
pub fn parse_cpu_time(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (days, clock) = match s.split_once('-') {
        Some((d, rest)) => (d.parse::<f64>().ok()?, rest),
        None => (0.0, s),
    };
    let mut seconds = 0.0;
    for part in clock.split(':') {
        seconds = seconds * 60.0 + part.parse::<f64>().ok()?;
    }
    Some(days * 86_400.0 + seconds)
}

// =========================================================================
// Unix implementation
// =========================================================================

#[cfg(unix)]
mod platform {
    use super::*;
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    pub struct Native;

    /// Whether `ps` lists a non-zombie member of process group `pgid`.
    /// A failed `ps` counts as "still running".
    async fn group_has_live_member(pgid: u32) -> bool {
        let Ok(output) = Command::new("ps")
            .args(["-A", "-o", "pgid=", "-o", "stat="])
            .output()
            .await
        else {
            return true;
        };
        if !output.status.success() {
            return true;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        text.lines().any(|line| {
            let mut fields = line.split_whitespace();
            let member = fields.next().and_then(|f| f.parse::<u32>().ok());
            let stat = fields.next().unwrap_or("Z");
            member == Some(pgid) && !stat.starts_with('Z')
        })
    }

    /// Signal the process group led by `pid`, falling back to the pid alone.
    fn signal_tree(pid: u32, sig: Signal) -> io::Result<()> {
        match signal::killpg(Pid::from_raw(pid as i32), sig) {
            Ok(()) => return Ok(()),
            Err(Errno::ESRCH) => {}
            Err(e) => tracing::debug!("killpg({pid}, {sig:?}) failed: {e}"),
        }
        match signal::kill(Pid::from_raw(pid as i32), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::other(e)),
        }
    }

    #[async_trait]
    impl ProcessControl for Native {
        fn shell_command(&self, line: &str) -> Command {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(line);
            cmd
        }

        fn prepare(&self, cmd: &mut Command) {
            cmd.process_group(0);
        }

        async fn terminate(&self, pid: u32, _timeout: Duration) -> io::Result<()> {
            signal_tree(pid, Signal::SIGTERM)
        }

        async fn force_kill(&self, pid: u32, _timeout: Duration) -> io::Result<()> {
            signal_tree(pid, Signal::SIGKILL)
        }

        fn is_alive(&self, pid: u32) -> bool {
            match signal::kill(Pid::from_raw(pid as i32), None) {
                Ok(()) => true,
                Err(Errno::EPERM) => true,
                Err(_) => false,
            }
        }

        async fn tree_alive(&self, pid: u32) -> bool {
            match signal::killpg(Pid::from_raw(pid as i32), None) {
                Ok(()) | Err(Errno::EPERM) => {}
                Err(_) => return false,
            }
            // killpg also counts zombies still waiting for a reaper.
            group_has_live_member(pid).await
        }

        async fn sample_root(&self, pid: u32) -> Option<RootSample> {
            let output = Command::new("ps")
                .args(["-o", "time=", "-o", "rss=", "-p", &pid.to_string()])
                .output()
                .await
                .ok()?;

            if !output.status.success() {
                return None;
            }

            let text = String::from_utf8_lossy(&output.stdout);
            let mut fields = text.split_whitespace();
            let cpu_seconds = parse_cpu_time(fields.next()?)?;
            let rss_kb: u64 = fields.next()?.parse().ok()?;
            Some(RootSample {
                cpu_seconds,
                rss_bytes: rss_kb * 1024,
            })
        }
    }
}

// =========================================================================
// Windows implementation
// =========================================================================

#[cfg(windows)]
mod platform {
    use super::*;
    use std::process::Stdio;

    pub struct Native;

    /// Run `taskkill /T /F` against the tree and wait for it to finish,
    /// bounded by `timeout`.
    async fn taskkill_tree(pid: u32, timeout: Duration) -> io::Result<()> {
        let status = tokio::time::timeout(
            timeout,
            Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status(),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "taskkill timed out"))??;

        if !status.success() && Native.is_alive(pid) {
            return Err(io::Error::other(format!(
                "taskkill exited with {status} for pid {pid}"
            )));
        }
        Ok(())
    }

    #[async_trait]
    impl ProcessControl for Native {
        fn shell_command(&self, line: &str) -> Command {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(line);
            cmd
        }

        fn prepare(&self, cmd: &mut Command) {
            // CREATE_NEW_PROCESS_GROUP = 0x00000200
            cmd.creation_flags(0x00000200);
        }

        async fn terminate(&self, pid: u32, timeout: Duration) -> io::Result<()> {
            taskkill_tree(pid, timeout).await
        }

        async fn force_kill(&self, pid: u32, timeout: Duration) -> io::Result<()> {
            taskkill_tree(pid, timeout).await
        }

        fn is_alive(&self, pid: u32) -> bool {
            use windows_sys::Win32::Foundation::CloseHandle;
            use windows_sys::Win32::System::Threading::{
                GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
            };

            unsafe {
                let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
                if handle.is_null() {
                    return false;
                }
                let mut exit_code: u32 = 0;
                let result = GetExitCodeProcess(handle, &mut exit_code);
                CloseHandle(handle);
                // STILL_ACTIVE = 259
                result != 0 && exit_code == 259
            }
        }

        async fn sample_root(&self, pid: u32) -> Option<RootSample> {
            let script = format!(
                "$p = Get-Process -Id {pid} -ErrorAction Stop; \"$($p.CPU) $($p.WorkingSet64)\""
            );
            let output = Command::new("powershell")
                .args(["-NoProfile", "-NonInteractive", "-Command", &script])
                .output()
                .await
                .ok()?;

            if !output.status.success() {
                return None;
            }

            let text = String::from_utf8_lossy(&output.stdout);
            let mut fields = text.split_whitespace();
            let cpu_seconds: f64 = fields.next()?.replace(',', ".").parse().ok()?;
            let rss_bytes: u64 = fields.next()?.parse().ok()?;
            Some(RootSample {
                cpu_seconds,
                rss_bytes,
            })
        }
    }
}

// =========================================================================
// Shutdown signal
// =========================================================================

#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
        let _ = tokio::signal::ctrl_c().await;
        return;
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(windows)]
pub async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

// =========================================================================
// Tests
// =========================================================================
