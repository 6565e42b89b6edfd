use clap::{CommandFactory, Parser};
use color_eyre::eyre::{bail, eyre};
use comfy_table::{Attribute, Cell, Color, Table, presets::UTF8_FULL_CONDENSED};
use devdash::cli::{Cli, Command};
use devdash::config::{Service, ServiceStatus, Settings};
use devdash::log::ServiceLog;
use devdash::paths::Paths;
use devdash::registry::Registry;
use devdash::supervisor::{ReadyHook, Supervisor, SupervisorOptions};
use owo_colors::OwoColorize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let paths = Paths::new()?;
    let registry = Arc::new(Registry::open(paths).await);

    match command {
        Command::Add { .. } => {
            let mut config = command
                .service_config()
                .ok_or_else(|| eyre!("invalid add arguments"))?;
            config.cwd = absolute_cwd(&config.cwd)?;
            let id = registry.add_service(config).await?;
            if cli.json {
                let service = registry.get_service(&id).await;
                println!("{}", serde_json::to_string_pretty(&service)?);
            } else {
                println!("{} {}", "added".green(), id.cyan());
            }
        }
        Command::Update { ref id, .. } => {
            let mut update = command
                .service_update()
                .ok_or_else(|| eyre!("invalid update arguments"))?;
            if let Some(cwd) = update.cwd.take() {
                update.cwd = Some(absolute_cwd(&cwd)?);
            }
            if !registry.update_service(id, update).await? {
                bail!("service not found: {id}");
            }
            if cli.json {
                let service = registry.get_service(id).await;
                println!("{}", serde_json::to_string_pretty(&service)?);
            } else {
                println!("{} {}", "updated".green(), id.cyan());
            }
        }
        Command::Remove { ref id } => {
            if !registry.delete_service(id).await? {
                bail!("service not found: {id}");
            }
            if cli.json {
                println!("{}", serde_json::json!({ "removed": id }));
            } else {
                println!("{} {}", "removed".green(), id.cyan());
            }
        }
        Command::List => {
            let services = registry.get_all_services().await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&services)?);
            } else {
                print_services(&services);
            }
        }
        Command::Settings { .. } => {
            let update = command
                .settings_update()
                .ok_or_else(|| eyre!("invalid settings arguments"))?;
            let settings = if update == Default::default() {
                registry.settings().await
            } else {
                registry.update_settings(update).await?
            };
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&settings)?);
            } else {
                print_settings(&settings);
            }
        }
        Command::Run {
            ids,
            interval,
            quiet,
        } => {
            run(registry, ids, Duration::from_secs(interval.max(1)), quiet).await?;
        }
    }

    Ok(())
}

fn absolute_cwd(cwd: &str) -> color_eyre::Result<String> {
    let path = Path::new(cwd);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let absolute = absolute.canonicalize().unwrap_or(absolute);
    Ok(absolute.to_string_lossy().into_owned())
}

// ---------------------------------------------------------------------------
// run: foreground supervision
// ---------------------------------------------------------------------------

/// Prints the URL of a service once its port accepts connections.
struct AnnounceUrl;

impl ReadyHook for AnnounceUrl {
    fn on_ready(&self, service: &Service, port: u16) {
        println!(
            "{} {} is ready at {}",
            "ready:".green().bold(),
            service.name.cyan(),
            format!("http://localhost:{port}").underline()
        );
    }
}

async fn run(
    registry: Arc<Registry>,
    ids: Vec<String>,
    interval: Duration,
    quiet: bool,
) -> color_eyre::Result<()> {
    for id in &ids {
        if registry.get_service(id).await.is_none() {
            bail!("service not found: {id}");
        }
    }

    let supervisor = Supervisor::with_ready_hook(
        Arc::clone(&registry),
        SupervisorOptions::default(),
        Arc::new(AnnounceUrl),
    );
    let mut logs = supervisor.subscribe_logs();

    let started = if ids.is_empty() {
        supervisor.start_auto_services().await
    } else {
        let mut started = Vec::new();
        for id in ids {
            if supervisor.start(&id).await {
                started.push(id);
            }
        }
        started
    };
    if started.is_empty() {
        eprintln!("{}", "no services started".yellow());
    }

    let names: HashMap<String, String> = registry
        .get_all_services()
        .await
        .into_iter()
        .map(|s| (s.id, s.name))
        .collect();

    let mut ticker = tokio::time::interval(interval);
    let shutdown = devdash::sys::shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                supervisor.update_service_stats().await;
            }
            message = logs.recv() => match message {
                Ok(log) => {
                    if !quiet {
                        print_log(&names, &log);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("skipped {skipped} log lines");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = &mut shutdown => break,
        }
    }

    eprintln!("{}", "stopping services...".dimmed());
    supervisor.stop_all().await;
    supervisor.update_service_stats().await;
    registry.save().await?;
    print_services(&registry.get_all_services().await);
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_log(names: &HashMap<String, String>, log: &ServiceLog) {
    let name = names
        .get(&log.service_id)
        .map(String::as_str)
        .unwrap_or(log.service_id.as_str());
    let time = log.entry.timestamp.format("%H:%M:%S");
    let prefix = format!("[{name}]");
    match log.entry.level {
        devdash::log::LogLevel::Info => {
            println!("{} {} {}", time.dimmed(), prefix.cyan().bold(), log.entry.message)
        }
        devdash::log::LogLevel::Warn => println!(
            "{} {} {}",
            time.dimmed(),
            prefix.cyan().bold(),
            log.entry.message.yellow()
        ),
        devdash::log::LogLevel::Error => println!(
            "{} {} {}",
            time.dimmed(),
            prefix.cyan().bold(),
            log.entry.message.red()
        ),
    }
}

fn print_services(services: &[Service]) {
    if services.is_empty() {
        println!("{}", "no services registered".yellow());
        return;
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec![
        Cell::new("id").add_attribute(Attribute::Bold),
        Cell::new("name").add_attribute(Attribute::Bold),
        Cell::new("status").add_attribute(Attribute::Bold),
        Cell::new("port").add_attribute(Attribute::Bold),
        Cell::new("pid").add_attribute(Attribute::Bold),
        Cell::new("cpu").add_attribute(Attribute::Bold),
        Cell::new("mem").add_attribute(Attribute::Bold),
        Cell::new("uptime").add_attribute(Attribute::Bold),
        Cell::new("command").add_attribute(Attribute::Bold),
    ]);
    for s in services {
        let port = match (s.port, s.active_port) {
            (Some(configured), Some(active)) if configured != active => {
                format!("{active} ({configured})")
            }
            (_, Some(active)) => active.to_string(),
            (Some(configured), None) => configured.to_string(),
            (None, None) => "-".to_string(),
        };
        let pid = s
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(&s.id).fg(Color::DarkGrey),
            Cell::new(&s.name).fg(Color::Cyan),
            Cell::new(s.status.to_string()).fg(status_color(s.status)),
            Cell::new(port),
            Cell::new(pid),
            Cell::new(&s.cpu),
            Cell::new(&s.memory),
            Cell::new(&s.uptime),
            Cell::new(&s.command),
        ]);
    }
    println!("{table}");
}

fn print_settings(settings: &Settings) {
    let theme = match settings.theme {
        devdash::config::Theme::Dark => "dark",
        devdash::config::Theme::Light => "light",
    };
    println!("{} {theme}", "theme:".dimmed());
    println!("{} {}", "accent color:".dimmed(), settings.accent_color);
    println!("{} {}", "auto restart:".dimmed(), settings.auto_restart);
    println!("{} {}", "auto start:".dimmed(), settings.auto_start);
    println!(
        "{} {}",
        "notifications:".dimmed(),
        settings.show_notifications
    );
    println!(
        "{} {} days",
        "data retention:".dimmed(),
        settings.data_retention
    );
}

fn status_color(status: ServiceStatus) -> Color {
    match status {
        ServiceStatus::Running => Color::Green,
        ServiceStatus::Starting => Color::Yellow,
        ServiceStatus::Stopped => Color::Reset,
        ServiceStatus::Crashed => Color::Red,
    }
}
