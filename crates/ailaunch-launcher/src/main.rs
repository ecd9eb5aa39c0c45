//! ailaunch
//!
//! Launches the packaged assistant on a free local port, relays its output
//! to the log, opens the browser once it is ready, and tears the whole
//! process tree down on exit.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use ailaunch_core::tracing_init::{default_filter, init_tracing};
use ailaunch_core::{LauncherConfig, RecentField, mask_api_key};
use ailaunch_launcher::browser::{BrowserOpener, NoBrowser, SystemBrowser};
use ailaunch_launcher::controller::{Launcher, RunOutcome, StartOptions};
use ailaunch_launcher::layout::InstallLayout;
use ailaunch_launcher::registry::InstanceRegistry;
use ailaunch_launcher::subprocess::port::{DEFAULT_PORT_SPAN, DEFAULT_START_PORT};
use ailaunch_launcher::subprocess::types::DEFAULT_READY_MARKER;
use ailaunch_launcher::subprocess::{ConfigHandoff, Readiness, Supervisor, SupervisorConfig};

#[derive(Parser, Debug)]
#[command(name = "ailaunch")]
#[command(version, about = "ailaunch - launcher for the packaged AI coding assistant")]
struct Cli {
    /// Settings file path (defaults to the platform config directory)
    #[arg(long, global = true, env = "AILAUNCH_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, global = true, default_value = "info", env = "AILAUNCH_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON.
    #[arg(long, global = true, env = "AILAUNCH_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch the assistant and supervise it until interrupted
    Run(RunArgs),
    /// Inspect or change saved settings
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Directory the assistant works in (defaults to the saved one)
    directory: Option<PathBuf>,

    /// API key passed to the assistant
    #[arg(long, env = "AILAUNCH_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// API base URL passed to the assistant
    #[arg(long, env = "AILAUNCH_API_BASE")]
    api_base: Option<String>,

    /// Model name passed to the assistant
    #[arg(long, env = "AILAUNCH_MODEL")]
    model: Option<String>,

    /// First port to try
    #[arg(long, default_value_t = DEFAULT_START_PORT, env = "AILAUNCH_PORT_START")]
    port_start: u16,

    /// Number of ports to scan
    #[arg(long, default_value_t = DEFAULT_PORT_SPAN, env = "AILAUNCH_PORT_SPAN")]
    port_span: u16,

    /// Assistant executable (defaults to the bundle next to this binary)
    #[arg(long, env = "AILAUNCH_EXECUTABLE")]
    executable: Option<PathBuf>,

    /// Output line that marks the assistant as ready
    #[arg(long, default_value = DEFAULT_READY_MARKER, env = "AILAUNCH_MARKER")]
    marker: String,

    /// Treat the assistant as ready after this many milliseconds alive.
    /// With an empty `--marker`, this is the only readiness signal.
    #[arg(long, env = "AILAUNCH_READY_DELAY_MS")]
    ready_delay_ms: Option<u64>,

    /// Milliseconds to wait after interrupting before force-killing
    #[arg(long, default_value_t = 1000, env = "AILAUNCH_GRACE_MS")]
    grace_ms: u64,

    /// Hand configuration over through a JSON arguments file at this path
    #[arg(long, env = "AILAUNCH_ARGS_FILE")]
    args_file: Option<PathBuf>,

    /// Shared file listing ports claimed by running launchers
    #[arg(long, env = "AILAUNCH_CLAIMS_FILE")]
    claims_file: Option<PathBuf>,

    /// Do not open a browser when the assistant is ready
    #[arg(long, env = "AILAUNCH_NO_BROWSER")]
    no_browser: bool,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the saved settings
    Show,
    /// Save a default value (directory, api-key, api-base, model)
    Set { field: RecentField, value: String },
    /// List recently used values for a field
    Recent { field: RecentField },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&default_filter(&cli.log_level), cli.log_json);

    let config_path = match cli.config {
        Some(path) => path,
        None => LauncherConfig::default_path()
            .context("Cannot determine config directory; pass --config")?,
    };
    let settings = LauncherConfig::load(&config_path);

    match cli.command {
        Command::Run(args) => run(settings, args).await,
        Command::Config(cmd) => config(settings, cmd),
    }
}

fn readiness(args: &RunArgs) -> Readiness {
    match args.ready_delay_ms.map(Duration::from_millis) {
        None => Readiness::Marker(args.marker.clone()),
        Some(delay) if args.marker.is_empty() => Readiness::Delay(delay),
        Some(delay) => Readiness::MarkerOrDelay {
            marker: args.marker.clone(),
            delay,
        },
    }
}

async fn run(settings: LauncherConfig, args: RunArgs) -> anyhow::Result<()> {
    let executable = match &args.executable {
        Some(path) => path.clone(),
        None => InstallLayout::from_current_exe()?.resolve()?,
    };

    let mut supervisor_config = SupervisorConfig::new(&executable)
        .with_readiness(readiness(&args))
        .with_grace_period(Duration::from_millis(args.grace_ms));
    if let Some(path) = &args.args_file {
        supervisor_config = supervisor_config.with_handoff(ConfigHandoff::ArgsFile(path.clone()));
    }

    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    let supervisor = Supervisor::new(supervisor_config, events_tx);
    let registry = args
        .claims_file
        .as_ref()
        .map_or_else(InstanceRegistry::new, InstanceRegistry::with_claims_file);
    let browser: Arc<dyn BrowserOpener> = if args.no_browser {
        Arc::new(NoBrowser)
    } else {
        Arc::new(SystemBrowser)
    };

    let mut launcher = Launcher::new(settings, registry, supervisor, browser)
        .with_port_range(args.port_start, args.port_span);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        executable = %executable.display(),
        "Starting ailaunch"
    );

    let port = launcher
        .start(StartOptions {
            directory: args.directory,
            api_key: args.api_key,
            api_base: args.api_base,
            model: args.model,
        })
        .await?;

    let shutdown = shutdown_signal()?;
    let outcome = launcher.supervise(&mut events_rx, shutdown).await;
    launcher.shutdown().await?;

    match outcome {
        RunOutcome::Interrupted => {
            info!("Launcher stopped");
            Ok(())
        }
        RunOutcome::Exited(Some(error)) => {
            Err(anyhow::Error::new(error).context(format!("Assistant on port {port} stopped")))
        }
        RunOutcome::Exited(None) => anyhow::bail!("Assistant on port {port} exited unexpectedly"),
    }
}

/// Resolves on the first Ctrl+C or SIGTERM.
#[cfg(unix)]
fn shutdown_signal() -> anyhow::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C shutdown signal"),
            _ = sigterm.recv() => info!("Received SIGTERM shutdown signal"),
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> anyhow::Result<impl Future<Output = ()>> {
    Ok(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C shutdown signal");
    })
}

#[allow(clippy::print_stdout)]
fn config(mut settings: LauncherConfig, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show => {
            if let Some(path) = settings.path() {
                println!("# {}", path.display());
            }
            for field in [
                RecentField::Directory,
                RecentField::ApiKey,
                RecentField::ApiBase,
                RecentField::Model,
            ] {
                println!("{field}: {}", display_value(field, &settings.get(field)));
            }
        }
        ConfigCommand::Set { field, value } => {
            settings.set_and_save(field, &value)?;
            println!("{field} = {}", display_value(field, &value));
        }
        ConfigCommand::Recent { field } => {
            for value in settings.recent(field) {
                println!("{}", display_value(field, value));
            }
        }
    }
    Ok(())
}

fn display_value(field: RecentField, value: &str) -> String {
    if field == RecentField::ApiKey {
        mask_api_key(value)
    } else {
        value.to_string()
    }
}
