//! plfm-vt Agent Updater
//!
//! Replaces the host agent binary with the release staged under
//! `<base-dir>/staging`, restarts the agent, and verifies it through its
//! health endpoint. A failed update restores the previous binary.
//!
//! The process exit code tells the caller what happened; see
//! [`exit_code`](plfm_agent_updater::error::exit_code).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use plfm_agent_updater::error::exit_code;
use plfm_agent_updater::paths::Paths;
use plfm_agent_updater::signal::SignalWatcher;
use plfm_agent_updater::state::StateError;
use plfm_agent_updater::{Shutdown, StateWriter, SystemdServiceController, Updater, UpdaterConfig};

/// Default systemd unit of the host agent.
const DEFAULT_SERVICE: &str = "ghost-agent.service";

/// plfm-vt agent updater - Replace the host agent binary safely.
#[derive(Debug, Parser)]
#[command(name = "agent-updater")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install the staged release and verify it.
    Update(UpdateArgs),

    /// Restore the backed-up binary and restart the agent.
    Rollback(RollbackArgs),

    /// Print the persisted update state.
    Status(StatusArgs),
}

#[derive(Debug, Args)]
struct HostArgs {
    /// Path of the installed agent binary.
    #[arg(long, env = "GHOST_UPDATER_BINARY")]
    binary: PathBuf,

    /// Directory holding backup/, staging/, the lock and the state file.
    #[arg(long, env = "GHOST_UPDATER_BASE_DIR")]
    base_dir: PathBuf,

    /// systemd unit running the agent.
    #[arg(long, env = "GHOST_UPDATER_SERVICE", default_value = DEFAULT_SERVICE)]
    service: String,

    /// Overall deadline in seconds. Cancels the run when reached.
    #[arg(
        long,
        env = "GHOST_UPDATER_TIMEOUT_SECS",
        default_value_t = 90,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    timeout_secs: u64,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    #[command(flatten)]
    host: HostArgs,

    /// Agent health endpoint.
    #[arg(long, env = "GHOST_UPDATER_HEALTH_URL")]
    health_url: String,

    /// Version the agent must report after the update.
    ///
    /// If omitted, the target recorded in the state file is used.
    #[arg(long, env = "GHOST_UPDATER_TARGET_VERSION")]
    target_version: Option<String>,

    /// Archive entry holding the new binary. Defaults to the binary's file name.
    #[arg(long, env = "GHOST_UPDATER_ARCHIVE_ENTRY")]
    archive_entry: Option<String>,
}

#[derive(Debug, Args)]
struct RollbackArgs {
    #[command(flatten)]
    host: HostArgs,
}

#[derive(Debug, Args)]
struct StatusArgs {
    /// Directory holding the state file.
    #[arg(long, env = "GHOST_UPDATER_BASE_DIR")]
    base_dir: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            if let Err(print_err) = e.print() {
                eprintln!("agent-updater: failed to print usage: {print_err}");
            }
            return ExitCode::from(parse_exit_code(&e));
        }
    };

    // Initialize tracing. stdout is reserved for `status` output.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let result = match cli.command {
        Command::Update(args) => update(args).await,
        Command::Rollback(args) => rollback(args).await,
        Command::Status(args) => status(args),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %format!("{e:#}"), "Agent updater failed");
            ExitCode::from(exit_code::FAILED)
        }
    }
}

/// Exit code for an argument parsing outcome. Help and version output are
/// not failures; everything else is a usage error.
fn parse_exit_code(err: &clap::Error) -> u8 {
    if err.use_stderr() {
        exit_code::USAGE
    } else {
        exit_code::SUCCESS
    }
}

async fn update(args: UpdateArgs) -> Result<u8> {
    let paths = Paths::new(&args.host.base_dir);

    let target_version = match args.target_version {
        Some(version) => version,
        None => match recorded_target(&paths)? {
            Some(version) => version,
            None => {
                error!(
                    state_file = %paths.state_file.display(),
                    "No --target-version given and the state file records none"
                );
                return Ok(exit_code::USAGE);
            }
        },
    };

    let mut config = UpdaterConfig::new(
        &args.host.binary,
        &args.host.base_dir,
        args.health_url,
        target_version,
    );
    if let Some(entry) = args.archive_entry {
        config = config.with_archive_entry(entry);
    }

    info!(
        binary = %config.binary_path.display(),
        base_dir = %args.host.base_dir.display(),
        service = %args.host.service,
        target_version = %config.target_version,
        "Starting agent update"
    );

    let service = Arc::new(SystemdServiceController::new(
        &args.host.service,
        config.stop_timeout,
        config.start_timeout,
    ));
    let updater = Updater::new(config, service).context("failed to create updater")?;

    let cancellation = Cancellation::install(Duration::from_secs(args.host.timeout_secs))?;
    let result = updater.run(&cancellation.shutdown).await;
    cancellation.finish();

    Ok(match result {
        Ok(_) => exit_code::SUCCESS,
        Err(e) => e.exit_code(),
    })
}

async fn rollback(args: RollbackArgs) -> Result<u8> {
    let paths = Paths::new(&args.host.base_dir);
    let target_version = recorded_target(&paths)?.unwrap_or_default();

    let config = UpdaterConfig::new(
        &args.host.binary,
        &args.host.base_dir,
        String::new(),
        target_version,
    );

    info!(
        binary = %config.binary_path.display(),
        backup = %config.backup_path().display(),
        service = %args.host.service,
        "Starting manual rollback"
    );

    let service = Arc::new(SystemdServiceController::new(
        &args.host.service,
        config.stop_timeout,
        config.start_timeout,
    ));
    let updater = Updater::new(config, service).context("failed to create updater")?;

    let cancellation = Cancellation::install(Duration::from_secs(args.host.timeout_secs))?;
    let result = updater.rollback(&cancellation.shutdown).await;
    cancellation.finish();

    Ok(match result {
        Ok(()) => {
            info!("Manual rollback completed");
            exit_code::SUCCESS
        }
        Err(e) if e.is_lock_held() || e.is_cancelled() => e.exit_code(),
        Err(_) => exit_code::ROLLBACK_FAILED,
    })
}

fn status(args: StatusArgs) -> Result<u8> {
    let paths = Paths::new(&args.base_dir);

    match StateWriter::new(&paths.state_file).read() {
        Ok(state) => {
            let json =
                serde_json::to_string_pretty(&state).context("failed to encode update state")?;
            println!("{json}");
            Ok(exit_code::SUCCESS)
        }
        Err(StateError::NotFound(path)) => {
            warn!(state_file = %path.display(), "No update state recorded");
            Ok(exit_code::FAILED)
        }
        Err(e) => Err(e).context("failed to read update state"),
    }
}

/// Target version from the state file, if one is recorded.
fn recorded_target(paths: &Paths) -> Result<Option<String>> {
    match StateWriter::new(&paths.state_file).read() {
        Ok(state) if !state.target_version.is_empty() => Ok(Some(state.target_version)),
        Ok(_) | Err(StateError::NotFound(_)) => Ok(None),
        Err(e) => Err(e).context("failed to read update state"),
    }
}

/// Cancellation wiring for one run: host signals plus the overall deadline.
struct Cancellation {
    shutdown: Shutdown,
    signals: SignalWatcher,
    deadline: JoinHandle<()>,
}

impl Cancellation {
    fn install(timeout: Duration) -> Result<Self> {
        let (trigger, shutdown) = Shutdown::channel();

        let signals =
            SignalWatcher::spawn(trigger.clone()).context("failed to install signal handlers")?;

        let deadline = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if trigger.trigger() {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "Overall deadline reached, cancelling"
                );
            }
        });

        Ok(Self {
            shutdown,
            signals,
            deadline,
        })
    }

    fn finish(self) {
        self.deadline.abort();
        self.signals.stop();
    }
}
