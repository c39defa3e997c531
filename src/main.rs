mod command;
mod config;
mod printer;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use spacelog_logs::{
    EngineEvent, JsonFileStore, LogEngine, ModuleSettings, Severity, StateStore, StreamKind,
};
use spacelog_transport::{RemoteShell, Transport, VirtualizedShell};

use crate::command::{Command, HELP};
use crate::config::AppConfig;
use crate::printer::Printer;

/// spacelog - follow SpacetimeDB journals over SSH or WSL
#[derive(Parser, Debug)]
#[command(name = "spacelog")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (default: <config dir>/spacelog/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory for persisted log state (default: <data dir>/spacelog)
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Module whose database log is followed
    #[arg(long)]
    module: Option<String>,

    /// Clear the module log when logging starts
    #[arg(long)]
    clear_module: bool,

    /// Clear the database log when logging starts
    #[arg(long)]
    clear_database: bool,

    /// Debug logging; also keeps transient database errors
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    target: Target,
}

#[derive(Subcommand, Debug)]
enum Target {
    /// Poll a host over SSH
    Remote {
        #[arg(long)]
        host: String,

        #[arg(long)]
        user: String,

        /// Private key file
        #[arg(long, value_name = "PATH")]
        key: PathBuf,

        #[arg(long, default_value_t = 22)]
        port: u16,
    },

    /// Poll a local WSL distribution
    Wsl {
        #[arg(long, default_value = "Debian")]
        distro: String,

        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

fn build_transport(target: &Target, file: &AppConfig) -> Result<Arc<dyn Transport>> {
    match target {
        Target::Remote {
            host,
            user,
            key,
            port,
        } => {
            if !key.is_file() {
                bail!("key file {} does not exist", key.display());
            }
            let mut shell = RemoteShell::new(host, user, key).with_port(*port);
            if let Some(secs) = file.ssh_connect_timeout_secs {
                shell = shell.with_connect_timeout(secs);
            }
            Ok(Arc::new(shell))
        }
        Target::Wsl { distro, user } => Ok(Arc::new(VirtualizedShell::new(distro, user))),
    }
}

async fn run(args: Args) -> Result<()> {
    let file = AppConfig::load(args.config.as_deref())?;

    let store: Arc<dyn StateStore> = match args.state_dir.clone().or_else(|| file.state_dir.clone()) {
        Some(dir) => Arc::new(JsonFileStore::new(dir)),
        None => Arc::new(
            JsonFileStore::in_data_dir().context("no data directory on this platform, pass --state-dir")?,
        ),
    };
    let transport = build_transport(&args.target, &file)?;

    let settings = ModuleSettings {
        module: args.module.clone().or_else(|| file.module.clone()),
        clear_module_log_at_start: args.clear_module || file.clear_module_log_at_start.unwrap_or(false),
        clear_database_log_at_start: args.clear_database
            || file.clear_database_log_at_start.unwrap_or(false),
    };

    let (engine, mut events) = LogEngine::new(file.engine_config(args.debug), store);
    engine.configure(settings, Some(transport));
    engine.verify_connection().await;
    engine.start_logging();

    let mut printer = Printer::new();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                handle_event(&engine, &mut printer, event)?;
            }

            line = stdin.next_line(), if stdin_open => {
                match line.context("failed to read stdin")? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => match line.parse::<Command>() {
                        Ok(Command::Quit) => break,
                        Ok(command) => handle_command(&engine, command),
                        Err(e) => eprintln!("{e}\n{HELP}"),
                    },
                    None => stdin_open = false,
                }
            }

            _ = tokio::signal::ctrl_c() => break,
        }
    }

    engine.shutdown().await;
    while let Ok(event) = events.try_recv() {
        handle_event(&engine, &mut printer, event)?;
    }

    Ok(())
}

fn handle_event(engine: &LogEngine, printer: &mut Printer, event: EngineEvent) -> Result<()> {
    let mut out = std::io::stdout().lock();
    match event {
        EngineEvent::Status { message, severity } => match severity {
            Severity::Info => eprintln!("{message}"),
            _ => eprintln!("[{}] {message}", severity.as_str()),
        },
        EngineEvent::ModuleLogUpdated => {
            printer.update(StreamKind::ModuleLog, engine.module_log(), &mut out)?;
        }
        EngineEvent::DatabaseLogUpdated => {
            printer.update(StreamKind::DatabaseLog, engine.database_log(), &mut out)?;
        }
    }
    Ok(())
}

fn handle_command(engine: &LogEngine, command: Command) {
    match command {
        Command::ClearModule => engine.clear_module_log(),
        Command::ClearDatabase => engine.clear_database_log(),
        Command::Switch { module, keep } => engine.switch_module(module, !keep),
        Command::Refresh => engine.force_refresh(),
        Command::Start => engine.start_logging(),
        Command::Stop => engine.stop_logging(),
        Command::Help => eprintln!("{HELP}"),
        Command::Sizes => {
            let engine = engine.clone();
            tokio::spawn(async move {
                let sizes = engine.journal_sizes().await;
                let show = |mib: Option<f64>| mib.map_or_else(|| "unknown".to_string(), |m| format!("{m:.2} MiB"));
                eprintln!(
                    "journal sizes: module {}, database {}",
                    show(sizes.module_mib),
                    show(sizes.database_mib)
                );
            });
        }
        Command::Verify => {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine.verify_connection().await;
            });
        }
        Command::Quit => {}
    }
}
