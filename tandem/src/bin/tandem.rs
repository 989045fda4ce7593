//! tandem command-line front end.
//!
//! # Usage
//!
//! ```sh
//! tandem run --role service               # background service (server)
//! tandem run --role control               # foreground control (client)
//! tandem run --role auto --config t.toml  # server if none is listening
//! tandem send show-control                # one-shot event to the service
//! tandem probe                            # exit 0 if a service is listening
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop the engine and exit

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use signal_hook::consts::{SIGINT, SIGTERM};
use thiserror::Error;

use tandem::{
    Channel, ChannelError, ConfigError, ControlPolicy, Engine, EngineError, Event, LoopContext,
    PolicyHandler, Role, RuntimeConfig, RuntimeContext, ServicePolicy, init_tracing,
    is_server_available,
};

/// How often the main thread checks for a shutdown signal.
const SIGNAL_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(name = "tandem", version, about = "Control/service event coordination")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the endpoint name from the configuration.
    #[arg(long, global = true)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run an engine until SIGINT/SIGTERM or a shutdown-requested event.
    Run {
        #[arg(long, value_enum, default_value_t = RoleArg::Auto)]
        role: RoleArg,
    },
    /// Connect as a client, send one event to the service and exit.
    Send {
        /// Event name, e.g. `show-control`.
        event: Event,
        /// How long to wait for the connection and the write.
        #[arg(long, default_value_t = 2000)]
        timeout_ms: u64,
    },
    /// Report whether a service is listening on the endpoint.
    Probe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RoleArg {
    Service,
    Control,
    /// Become the service unless one is already listening.
    Auto,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("failed to install signal handler")]
    Signal(#[source] std::io::Error),
    #[error("`{0}` was not delivered")]
    NotDelivered(Event),
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("tandem: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, CliError> {
    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(endpoint) = cli.endpoint {
        config.endpoint = endpoint;
    }

    match cli.command {
        Command::Run { role } => run_role(config, role).map(|()| ExitCode::SUCCESS),
        Command::Send { event, timeout_ms } => {
            send_one(config, event, Duration::from_millis(timeout_ms)).map(|()| ExitCode::SUCCESS)
        }
        Command::Probe => {
            let name = config.endpoint_name().map_err(ConfigError::from)?;
            if is_server_available(&name) {
                eprintln!("tandem: service listening on {name}");
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("tandem: no service on {name}");
                Ok(ExitCode::from(1))
            }
        }
    }
}

fn run_role(config: RuntimeConfig, role: RoleArg) -> Result<(), CliError> {
    let role = match role {
        RoleArg::Service => Role::Server,
        RoleArg::Control => Role::Client,
        RoleArg::Auto => {
            let name = config.endpoint_name().map_err(ConfigError::from)?;
            if is_server_available(&name) {
                Role::Client
            } else {
                Role::Server
            }
        }
    };
    let ctx = RuntimeContext::new(role, config)?;

    let mut view = None;
    let handler: Box<dyn PolicyHandler> = match role {
        Role::Server => Box::new(ServicePolicy::new(ctx.config())),
        Role::Client => {
            let policy = ControlPolicy::new(ctx.config());
            view = Some(policy.view());
            Box::new(policy)
        }
    };

    let channel = Channel::from_context(&ctx)?;
    let mut engine = Engine::new(&ctx, channel, handler)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown)).map_err(CliError::Signal)?;
    }

    engine.start()?;
    eprintln!("tandem: {} running on {}", ctx.role_name(), ctx.endpoint());

    let handle = engine.handle();
    let mut last_status = None;
    while !shutdown.load(Ordering::Relaxed) && handle.is_running() {
        if let Some(view) = &view {
            let status = view.status();
            if last_status != Some(status) {
                eprintln!("tandem: service {status:?}");
                last_status = Some(status);
            }
        }
        std::thread::sleep(SIGNAL_POLL);
    }

    eprintln!("tandem: shutting down...");
    engine.shutdown()?;
    eprintln!("tandem: stopped");
    Ok(())
}

fn send_one(config: RuntimeConfig, event: Event, timeout: Duration) -> Result<(), CliError> {
    let ctx = RuntimeContext::new(Role::Client, config)?;
    let channel = Channel::from_context(&ctx)?;
    let mut engine = Engine::new(
        &ctx,
        channel,
        Box::new(|_: &mut LoopContext<'_>, _: Event| {}),
    )?;
    engine.start()?;
    let delivered = engine.notify_remote(event, timeout);
    engine.shutdown()?;
    if delivered {
        eprintln!("tandem: sent {event}");
        Ok(())
    } else {
        Err(CliError::NotDelivered(event))
    }
}
