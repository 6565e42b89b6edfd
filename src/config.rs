use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Crashed,
}

impl ServiceStatus {
    /// True while a process for the service is expected to exist.
    pub fn is_active(self) -> bool {
        matches!(self, ServiceStatus::Starting | ServiceStatus::Running)
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Stopped => write!(f, "stopped"),
            ServiceStatus::Starting => write!(f, "starting"),
            ServiceStatus::Running => write!(f, "running"),
            ServiceStatus::Crashed => write!(f, "crashed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Service record
// ---------------------------------------------------------------------------

/// A service definition together with its display fields.
///
/// The definition half (name, command, cwd, port, flags) is edited through
/// the registry; the display half (status, memory, cpu, uptime, pid,
/// active port) is written by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub name: String,
    pub command: String,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpu")]
    pub cpu: String,
    #[serde(default = "default_uptime")]
    pub uptime: String,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_port: Option<u16>,
}

pub fn default_memory() -> String {
    "0 MB".to_string()
}

pub fn default_cpu() -> String {
    "0%".to_string()
}

pub fn default_uptime() -> String {
    "0s".to_string()
}

impl Service {
    pub fn from_config(id: String, config: ServiceConfig, settings: &Settings) -> Self {
        Self {
            id,
            name: config.name,
            command: config.command,
            cwd: config.cwd,
            port: config.port,
            icon: config.icon,
            status: ServiceStatus::Stopped,
            memory: default_memory(),
            cpu: default_cpu(),
            uptime: default_uptime(),
            auto_restart: config.auto_restart.unwrap_or(settings.auto_restart),
            auto_start: config.auto_start.unwrap_or(settings.auto_start),
            pid: None,
            active_port: None,
        }
    }

    /// Clear everything the supervisor writes, as for a service with no
    /// process.
    pub fn reset_display(&mut self) {
        self.status = ServiceStatus::Stopped;
        self.memory = default_memory();
        self.cpu = default_cpu();
        self.uptime = default_uptime();
        self.pid = None;
        self.active_port = None;
    }

    pub fn apply_update(&mut self, update: ServiceUpdate) {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(command) = update.command {
            self.command = command;
        }
        if let Some(cwd) = update.cwd {
            self.cwd = cwd;
        }
        if let Some(port) = update.port {
            self.port = port;
        }
        if let Some(icon) = update.icon {
            self.icon = icon;
        }
        if let Some(auto_restart) = update.auto_restart {
            self.auto_restart = auto_restart;
        }
        if let Some(auto_start) = update.auto_start {
            self.auto_start = auto_start;
        }
    }
}

/// Input for adding a service. Unset flags take their value from [`Settings`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub name: String,
    pub command: String,
    pub cwd: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub auto_restart: Option<bool>,
    #[serde(default)]
    pub auto_start: Option<bool>,
}

/// Partial update of a service definition. `port: Some(None)` clears the port.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceUpdate {
    pub name: Option<String>,
    pub command: Option<String>,
    pub cwd: Option<String>,
    pub port: Option<Option<u16>>,
    pub icon: Option<Option<String>>,
    pub auto_restart: Option<bool>,
    pub auto_start: Option<bool>,
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    Dark,
    Light,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub theme: Theme,
    pub accent_color: String,
    pub auto_restart: bool,
    pub auto_start: bool,
    pub show_notifications: bool,
    pub data_retention: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            theme: Theme::Dark,
            accent_color: "#3B82F6".to_string(),
            auto_restart: true,
            auto_start: false,
            show_notifications: true,
            data_retention: 7,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsUpdate {
    pub theme: Option<Theme>,
    pub accent_color: Option<String>,
    pub auto_restart: Option<bool>,
    pub auto_start: Option<bool>,
    pub show_notifications: Option<bool>,
    pub data_retention: Option<u32>,
}

impl Settings {
    pub fn apply_update(&mut self, update: SettingsUpdate) {
        if let Some(theme) = update.theme {
            self.theme = theme;
        }
        if let Some(accent_color) = update.accent_color {
            self.accent_color = accent_color;
        }
        if let Some(auto_restart) = update.auto_restart {
            self.auto_restart = auto_restart;
        }
        if let Some(auto_start) = update.auto_start {
            self.auto_start = auto_start;
        }
        if let Some(show_notifications) = update.show_notifications {
            self.show_notifications = show_notifications;
        }
        if let Some(data_retention) = update.data_retention {
            self.data_retention = data_retention;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
