use std::time::Duration;
use tokio::net::TcpListener;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_PORT_RETRIES: u32 = 3;
pub const DEFAULT_PORT_RETRY_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_PROBE_ATTEMPTS: u16 = 50;
pub const DEFAULT_PORT_ENV: &str = "PORT";

#[derive(Debug, Clone, PartialEq)]
pub struct PortOptions {
    /// Free-checks made against the configured port before it counts as busy.
    pub retries: u32,
    pub retry_delay: Duration,
    /// Candidates tried when searching upward for a substitute.
    pub probe_attempts: u16,
    /// Environment variable that carries a substitute port to the child.
    pub env_var: String,
}

impl Default for PortOptions {
    fn default() -> Self {
        Self {
            retries: DEFAULT_PORT_RETRIES,
            retry_delay: DEFAULT_PORT_RETRY_DELAY,
            probe_attempts: DEFAULT_PROBE_ATTEMPTS,
            env_var: DEFAULT_PORT_ENV.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

/// True iff a listener can be bound on loopback. Bind errors of any kind
/// count as "not free".
pub async fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}

/// Re-check a busy port a few times. A port released moments ago can still
/// be reported busy while the OS finishes tearing down the old socket.
pub async fn is_port_free_with_retry(port: u16, retries: u32, delay: Duration) -> bool {
    let attempts = retries.max(1);
    for attempt in 0..attempts {
        if is_port_free(port).await {
            return true;
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    false
}

/// Probe upward from `start`. `None` means no candidate was free and the
/// caller should let the OS (or the service itself) decide.
pub async fn find_free_port(start: u16, attempts: u16) -> Option<u16> {
    find_free_port_excluding(start, attempts, &[]).await
}

/// Like [`find_free_port`], skipping ports in `claimed` without probing.
/// A managed service may have claimed a port it has not bound yet.
pub async fn find_free_port_excluding(start: u16, attempts: u16, claimed: &[u16]) -> Option<u16> {
    for offset in 0..attempts {
        let candidate = start.checked_add(offset)?;
        if candidate == 0 || claimed.contains(&candidate) {
            continue;
        }
        if is_port_free(candidate).await {
            return Some(candidate);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Managed conflicts
// ---------------------------------------------------------------------------

/// A port currently held by a running or starting managed service.
#[derive(Debug, Clone, PartialEq)]
pub struct PortClaim {
    pub service_id: String,
    pub service_name: String,
    pub port: u16,
}

/// Name of another managed service that already owns `port`, if any.
pub fn check_managed_port_conflict(
    requesting_id: &str,
    port: u16,
    claims: &[PortClaim],
) -> Option<String> {
    claims
        .iter()
        .find(|claim| claim.service_id != requesting_id && claim.port == port)
        .map(|claim| claim.service_name.clone())
}

// ---------------------------------------------------------------------------
// Negotiation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum PortBlocker {
    Managed(String),
    External,
}

impl std::fmt::Display for PortBlocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortBlocker::Managed(name) => write!(f, "service '{name}'"),
            PortBlocker::External => write!(f, "another process"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Negotiation {
    /// The configured port is usable as is.
    Configured(u16),
    /// The configured port is taken; run on `port` instead.
    Substitute {
        configured: u16,
        port: u16,
        blocker: PortBlocker,
    },
    /// Taken, and no substitute was found.
    Exhausted {
        configured: u16,
        blocker: PortBlocker,
    },
}

impl Negotiation {
    /// The port the service is expected to listen on for this run.
    pub fn active_port(&self) -> u16 {
        match self {
            Negotiation::Configured(port) => *port,
            Negotiation::Substitute { port, .. } => *port,
            Negotiation::Exhausted { configured, .. } => *configured,
        }
    }

    /// The port to inject into the child's environment, if any.
    pub fn override_port(&self) -> Option<u16> {
        match self {
            Negotiation::Substitute { port, .. } => Some(*port),
            _ => None,
        }
    }
}

/// Decide which port `service_id` should use given the ports other managed
/// services hold. A managed owner is authoritative and skips the network
/// probe entirely.
pub async fn negotiate(
    service_id: &str,
    configured: u16,
    claims: &[PortClaim],
    options: &PortOptions,
) -> Negotiation {
    let blocker = match check_managed_port_conflict(service_id, configured, claims) {
        Some(owner) => PortBlocker::Managed(owner),
        None => {
            if is_port_free_with_retry(configured, options.retries, options.retry_delay).await {
                return Negotiation::Configured(configured);
            }
            PortBlocker::External
        }
    };

    let claimed: Vec<u16> = claims
        .iter()
        .filter(|claim| claim.service_id != service_id)
        .map(|claim| claim.port)
        .collect();
    let substitute = match configured.checked_add(1) {
        Some(start) => find_free_port_excluding(start, options.probe_attempts, &claimed).await,
        None => None,
    };

    match substitute {
        Some(port) => Negotiation::Substitute {
            configured,
            port,
            blocker,
        },
        None => Negotiation::Exhausted {
            configured,
            blocker,
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
