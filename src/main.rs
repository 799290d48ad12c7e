//! muxd: run a set of local services from one terminal.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads configuration, elects master or client over the socket,
//! and then runs the headless front-end until quit or a shutdown signal.

use std::collections::HashMap;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use muxd::commands::{self, CommandContext, CommandError, Reply};
use muxd::config::{self, Config, DEFAULT_CONFIG_FILE};
use muxd::ipc::{self, Role};
use muxd::output::{self, LogPrinter};
use muxd::{LogStore, ServiceDefinition, Supervisor};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "muxd",
    version,
    about = "Local multi-service process supervisor",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    /// Path to the configuration file (JSON, or TOML by extension).
    #[arg(short = 'C', long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Unix socket used to elect the master (default: <temp dir>/muxd.sock).
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Only show lines matching this regex (case-insensitive).
    #[arg(long)]
    filter: Option<String>,
    /// Disable colored prefixes.
    #[arg(long)]
    no_color: bool,
    /// Do not read commands from stdin.
    #[arg(long)]
    no_input: bool,
    /// Write diagnostics to <data dir>/muxd/logs/muxd.log.
    #[arg(long)]
    debug: bool,
    /// Give up waiting for dependencies after this many ms (default: wait forever).
    #[arg(long)]
    dependency_timeout_ms: Option<u64>,
    /// Time to wait after SIGTERM before force-killing (ms).
    #[arg(long)]
    kill_timeout_ms: Option<u64>,
}

#[derive(Debug)]
enum Input {
    Line(String),
    Shutdown(&'static str),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.debug {
        let path = init_tracing()?;
        eprintln!("muxd: writing diagnostics to {}", path.display());
    }

    // A client can attach without a readable config; only the master needs one.
    let loaded = config::load_config(&cli.config);
    let settings = loaded
        .as_ref()
        .map(|config| config.settings.clone())
        .unwrap_or_default();
    let socket_path = cli
        .socket
        .clone()
        .or(settings.socket_path.clone())
        .unwrap_or_else(ipc::default_socket_path);

    let log_store = LogStore::new();
    if let Some(filter) = cli.filter.clone().or(settings.filter.clone()) {
        log_store.set_filter(filter);
    }

    let mut role = ipc::initialize(&socket_path, &log_store).await?;
    let result = run(&cli, loaded, &role, log_store).await;
    role.cleanup().await;
    result
}

async fn run(cli: &Cli, loaded: Result<Config>, role: &Role, log_store: LogStore) -> Result<()> {
    let (ctx, supervisor, definitions) = match role {
        Role::Master(master) => {
            let config = loaded?;
            let definitions = config
                .service_definitions()
                .with_context(|| format!("invalid configuration {}", cli.config.display()))?;
            let mut options = config.settings.supervisor_options();
            if let Some(ms) = cli.dependency_timeout_ms {
                options.dependency_timeout = Some(Duration::from_millis(ms));
            }
            if let Some(ms) = cli.kill_timeout_ms {
                options.kill_timeout = Duration::from_millis(ms);
            }
            info!(
                "master on {} with {} services",
                master.socket_path().display(),
                definitions.len()
            );
            let supervisor = Supervisor::new(definitions.clone(), log_store.clone(), options);
            let ctx = CommandContext::master(supervisor.clone());
            (ctx, Some(supervisor), definitions)
        }
        Role::Client(client) => {
            let definitions = loaded
                .ok()
                .and_then(|config| config.service_definitions().ok())
                .unwrap_or_default();
            let ctx = CommandContext::client(client.clone(), log_store.clone());
            (ctx, None, definitions)
        }
    };
    let ctx = Arc::new(ctx);

    let printer = LogPrinter::new(colors(&definitions), !cli.no_color);
    let flags_ctx = ctx.clone();
    let printer_task = tokio::spawn(output::run_printer(
        log_store.clone(),
        printer,
        move || flags_ctx.flags(),
        std::io::stdout(),
    ));

    if let Some(supervisor) = &supervisor {
        supervisor.start_all();
    }

    let (tx, mut rx) = mpsc::channel(64);
    spawn_signal_listener(tx.clone());
    if !cli.no_input {
        spawn_stdin_listener(tx.clone());
    }
    drop(tx);

    while let Some(input) = rx.recv().await {
        match input {
            Input::Shutdown(signal) => {
                info!("received {}, shutting down", signal);
                break;
            }
            Input::Line(line) => match commands::parse_command(&line) {
                Ok(command) => match ctx.execute(command).await {
                    Reply::Done => {}
                    Reply::Message(message) => eprintln!("{}", message),
                    Reply::Quit => break,
                },
                Err(CommandError::Empty) => {}
                Err(err) => eprintln!("{}\n{}", err, commands::HELP),
            },
        }
    }

    if let Some(supervisor) = &supervisor {
        log_store.add_system_log("Shutting down...");
        supervisor.cleanup().await;
    }
    // Let the printer catch up with the exit notices before tearing it down.
    tokio::time::sleep(Duration::from_millis(50)).await;
    printer_task.abort();
    Ok(())
}

fn colors(definitions: &[ServiceDefinition]) -> HashMap<String, String> {
    definitions
        .iter()
        .map(|definition| (definition.name.clone(), definition.color.clone()))
        .collect()
}

fn init_tracing() -> Result<PathBuf> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("muxd")
        .join("logs");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;
    let path = log_dir.join("muxd.log");
    let log_file = std::fs::File::create(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(Mutex::new(log_file))
        .with_ansi(false);
    let filter =
        EnvFilter::try_from_env("MUXD_LOG").unwrap_or_else(|_| EnvFilter::new("muxd=debug"));
    tracing_subscriber::registry()
        .with(file_layer)
        .with(filter)
        .init();
    Ok(path)
}

fn spawn_signal_listener(tx: mpsc::Sender<Input>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    let _ = tx.send(Input::Shutdown("SIGINT")).await;
                }
                _ = sigterm.recv() => {
                    let _ = tx.send(Input::Shutdown("SIGTERM")).await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            let _ = tx.send(Input::Shutdown("SIGINT")).await;
        }
    });
}

fn spawn_stdin_listener(tx: mpsc::Sender<Input>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(Input::Line(line)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!("stdin closed: {}", err);
                    break;
                }
            }
        }
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
