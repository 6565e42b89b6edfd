use crate::config::{ServiceConfig, ServiceUpdate, SettingsUpdate, Theme};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "devdash", about = "Supervise local dev services", version)]
pub struct Cli {
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ThemeArg {
    Dark,
    Light,
}

impl From<ThemeArg> for Theme {
    fn from(value: ThemeArg) -> Self {
        match value {
            ThemeArg::Dark => Theme::Dark,
            ThemeArg::Light => Theme::Light,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Register a new service
    Add {
        #[arg(long)]
        name: String,
        /// Shell command line that runs the service
        #[arg(long)]
        command: String,
        #[arg(long, default_value = ".")]
        cwd: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        icon: Option<String>,
        /// Start with `run` when no services are named
        #[arg(long)]
        auto_start: bool,
        #[arg(long, value_name = "BOOL")]
        auto_restart: Option<bool>,
    },
    /// Edit a registered service
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        command: Option<String>,
        #[arg(long)]
        cwd: Option<String>,
        #[arg(long, conflicts_with = "no_port")]
        port: Option<u16>,
        /// Remove the configured port
        #[arg(long)]
        no_port: bool,
        #[arg(long, value_name = "BOOL")]
        auto_start: Option<bool>,
        #[arg(long, value_name = "BOOL")]
        auto_restart: Option<bool>,
    },
    /// Remove a registered service
    #[command(visible_alias = "rm")]
    Remove { id: String },
    /// List registered services
    #[command(visible_alias = "ls")]
    List,
    /// Show or change settings
    Settings {
        #[arg(long, value_enum)]
        theme: Option<ThemeArg>,
        #[arg(long, value_name = "BOOL")]
        auto_start: Option<bool>,
        #[arg(long, value_name = "BOOL")]
        auto_restart: Option<bool>,
        #[arg(long, value_name = "BOOL")]
        show_notifications: Option<bool>,
        #[arg(long, value_name = "DAYS")]
        data_retention: Option<u32>,
    },
    /// Run services in the foreground until interrupted
    Run {
        /// Services to start; defaults to every auto-start service
        ids: Vec<String>,
        /// Seconds between stats refreshes
        #[arg(long, default_value_t = 2)]
        interval: u64,
        /// Do not print service output
        #[arg(short, long)]
        quiet: bool,
    },
}

impl Command {
    /// Turn `add` arguments into a service definition. Other commands
    /// yield `None`.
    pub fn service_config(&self) -> Option<ServiceConfig> {
        match self {
            Command::Add {
                name,
                command,
                cwd,
                port,
                icon,
                auto_start,
                auto_restart,
            } => Some(ServiceConfig {
                name: name.clone(),
                command: command.clone(),
                cwd: cwd.clone(),
                port: *port,
                icon: icon.clone(),
                auto_restart: *auto_restart,
                auto_start: auto_start.then_some(true),
            }),
            _ => None,
        }
    }

    pub fn service_update(&self) -> Option<ServiceUpdate> {
        match self {
            Command::Update {
                name,
                command,
                cwd,
                port,
                no_port,
                auto_start,
                auto_restart,
                ..
            } => Some(ServiceUpdate {
                name: name.clone(),
                command: command.clone(),
                cwd: cwd.clone(),
                port: if *no_port { Some(None) } else { port.map(Some) },
                icon: None,
                auto_restart: *auto_restart,
                auto_start: *auto_start,
            }),
            _ => None,
        }
    }

    pub fn settings_update(&self) -> Option<SettingsUpdate> {
        match self {
            Command::Settings {
                theme,
                auto_start,
                auto_restart,
                show_notifications,
                data_retention,
            } => Some(SettingsUpdate {
                theme: theme.map(Theme::from),
                accent_color: None,
                auto_restart: *auto_restart,
                auto_start: *auto_start,
                show_notifications: *show_notifications,
                data_retention: *data_retention,
            }),
            _ => None,
        }
    }
}
