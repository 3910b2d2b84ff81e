//! CLI entry and dispatch.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use zentro_core::config::{self, CheckpointBackend, LogConfig};
use zentro_core::core::reasoner::DirectiveReasoner;
use zentro_core::core::session::AgentSession;
use zentro_core::core::turn::DEFAULT_SESSION_KEY;
use zentro_core::domain::{DomainGateway, GatewaySeed, InMemoryGateway};

mod commands;
pub mod interrupt;

#[derive(Parser)]
#[command(name = "zentro")]
#[command(version)]
#[command(about = "Project agent with durable sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Keep sessions in memory only (nothing is written to disk)
    #[arg(long, global = true)]
    memory: bool,
}

#[derive(clap::Subcommand)]
enum Commands {
    #[command(flatten)]
    Session(SessionCommands),
    /// Prints a fresh session key for a user
    NewSession {
        /// Acting user id
        #[arg(long)]
        user: i64,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Commands that need a running agent session.
#[derive(clap::Subcommand)]
enum SessionCommands {
    /// Runs one turn and prints the reply
    Run {
        /// The message to send
        #[arg(value_name = "MESSAGE")]
        message: String,

        /// Session key to append to
        #[arg(short, long, env = "ZENTRO_SESSION", default_value = DEFAULT_SESSION_KEY)]
        session: String,
    },
    /// Runs one turn, printing the reply as it is produced
    Stream {
        /// The message to send
        #[arg(value_name = "MESSAGE")]
        message: String,

        /// Session key to append to
        #[arg(short, long, env = "ZENTRO_SESSION", default_value = DEFAULT_SESSION_KEY)]
        session: String,
    },
    /// Interactive chat on one session
    Chat {
        /// Session key to append to
        #[arg(short, long, env = "ZENTRO_SESSION", default_value = DEFAULT_SESSION_KEY)]
        session: String,
    },
    /// Shows the committed turns of a session
    History {
        /// The session key
        #[arg(value_name = "SESSION")]
        session: String,

        /// Print the turns as JSON
        #[arg(long)]
        json: bool,
    },
    /// Lists the available tools
    Tools,
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
    /// Set a value by dotted key (e.g. `checkpoint.retain_versions 10`)
    Set {
        #[arg(value_name = "KEY")]
        key: String,
        #[arg(value_name = "VALUE")]
        value: String,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    // Config commands must work even when the file does not parse.
    let command = match cli.command {
        Commands::Config { command } => {
            return match command {
                ConfigCommands::Path => {
                    commands::config::path();
                    Ok(())
                }
                ConfigCommands::Init => commands::config::init(),
                ConfigCommands::Set { key, value } => commands::config::set(&key, &value),
            };
        }
        Commands::NewSession { user } => {
            commands::session::new_session(user);
            return Ok(());
        }
        Commands::Session(command) => command,
    };

    let mut config = config::Config::load().context("load config")?;
    if cli.memory {
        config.checkpoint.backend = CheckpointBackend::Memory;
    }
    let _log_guard = init_tracing(&config.log)?;

    interrupt::init()?;

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;
    let result = rt.block_on(async move {
        let session = build_session(&config)?;
        tracing::debug!(backend = ?config.checkpoint.backend, "session ready");
        let result = dispatch(command, &session).await;
        let closed = session.shutdown().await.context("shut down session");
        result.and(closed)
    });
    // A pending stdin read would otherwise hold the runtime open.
    rt.shutdown_background();
    result
}

async fn dispatch(command: SessionCommands, session: &AgentSession) -> Result<()> {
    match command {
        SessionCommands::Run {
            message,
            session: key,
        } => commands::turn::run(session, &key, &message).await,
        SessionCommands::Stream {
            message,
            session: key,
        } => commands::turn::stream(session, &key, &message).await,
        SessionCommands::Chat { session: key } => commands::chat::run(session, &key).await,
        SessionCommands::History { session: key, json } => {
            commands::session::history(session, &key, json).await
        }
        SessionCommands::Tools => {
            commands::tools::list(session);
            Ok(())
        }
    }
}

fn build_session(config: &config::Config) -> Result<AgentSession> {
    let gateway: Arc<dyn DomainGateway> = match &config.gateway.seed_file {
        Some(path) => Arc::new(InMemoryGateway::from_seed(GatewaySeed::load(path)?)),
        None => Arc::new(InMemoryGateway::demo()),
    };
    Ok(AgentSession::from_config(
        config,
        &gateway,
        Arc::new(DirectiveReasoner::new()),
    ))
}

/// Logs go to stderr, and to a daily-rolling file when `log.dir` is set.
/// `RUST_LOG` overrides the configured filter.
fn init_tracing(log: &LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter))
    };
    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter());

    let (file, guard) = match &log.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "zentro.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr)
        .with(file)
        .try_init()
        .context("initialize logging")?;
    Ok(guard)
}
