use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;

pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const READY_TIMEOUT: Duration = Duration::from_secs(120);
pub const READY_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Passed,
    TimedOut,
    Aborted,
}

/// True iff something accepts a TCP connection on `host:port`.
pub async fn check_tcp(host: &str, port: u16) -> bool {
    let addr = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    tokio::time::timeout(READY_ATTEMPT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

/// Poll `port` on localhost until it accepts connections.
///
/// `still_waiting` is consulted before every attempt; once it reports false
/// (process exited or was stopped) the wait ends with `Aborted`.
pub async fn wait_for_port<F, Fut>(
    port: u16,
    interval: Duration,
    timeout: Duration,
    mut still_waiting: F,
) -> WaitOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !still_waiting().await {
            return WaitOutcome::Aborted;
        }

        if check_tcp("localhost", port).await {
            return WaitOutcome::Passed;
        }

        if tokio::time::Instant::now() >= deadline {
            return WaitOutcome::TimedOut;
        }

        tokio::time::sleep(interval).await;
    }
}
