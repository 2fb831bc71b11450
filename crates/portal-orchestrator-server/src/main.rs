//! Portal orchestrator entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use tokio::sync::broadcast::error::RecvError;

use portal_orchestrator::{
    BulkRequest, ConfigOverrides, Credentials, DiscoveryRequest, ExecutionEvent, ExecutionId,
    ExecutionStatus, Orchestrator,
};
use portal_orchestrator_server::{build_orchestrator, rest, AppState, CliOverrides, ServerConfig};

#[derive(Parser)]
#[command(
    name = "portal-orchestrator",
    about = "Execution orchestration engine for bulk extraction and portal discovery",
    version
)]
struct Cli {
    /// Path to a JSON config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST server (default).
    Serve {
        /// Listen address (host:port). Also reads PORTAL_ADDR.
        #[arg(long)]
        addr: Option<String>,

        /// Terminal executions kept on record. Also reads PORTAL_HISTORY_LIMIT.
        #[arg(long)]
        history_limit: Option<usize>,

        /// Default concurrency for executions that do not set one.
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Run one bulk extraction and print its report as JSON.
    Bulk {
        /// Target URLs.
        #[arg(required = true)]
        targets: Vec<String>,

        #[arg(long)]
        concurrency: Option<i64>,

        /// Mode label recorded with every result.
        #[arg(long)]
        mode: Option<String>,

        /// Per-target timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<i64>,
    },

    /// Discover the structure of one portal and print its report as JSON.
    Map {
        /// Root URL to start from.
        root_url: String,

        #[arg(long)]
        max_depth: Option<i64>,

        #[arg(long)]
        max_elements: Option<i64>,

        #[arg(long)]
        concurrency: Option<i64>,

        /// Per-visit timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<i64>,

        /// Basic-auth user. The password is read from PORTAL_PASSWORD.
        #[arg(long)]
        username: Option<String>,
    },

    /// Print the resolved configuration as JSON.
    Info,

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   portal-orchestrator completions bash > ~/.local/share/bash-completion/completions/portal-orchestrator
    ///   portal-orchestrator completions zsh > ~/.zfunc/_portal-orchestrator
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

/// Log progress events for `id` until the execution finishes.
fn follow(orchestrator: &Orchestrator, id: ExecutionId) -> tokio::task::JoinHandle<()> {
    let mut rx = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) if event.execution_id() == id => match event {
                    ExecutionEvent::TaskFinished { target, state, .. } => {
                        tracing::info!("{target}: {state:?}");
                    }
                    ExecutionEvent::LayerCompleted {
                        depth,
                        elements,
                        next_layer,
                        ..
                    } => {
                        tracing::info!("depth {depth} done: {elements} elements, {next_layer} points next");
                    }
                    ExecutionEvent::ExecutionFinished { .. } => break,
                    _ => {}
                },
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Run one execution to completion and print its report.
async fn run_once(orchestrator: Orchestrator, id: ExecutionId) -> anyhow::Result<()> {
    let follower = follow(&orchestrator, id);
    let outcome = tokio::select! {
        done = orchestrator.wait(&id) => done?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted, stopping {id}");
            orchestrator.stop(&id).await?;
            orchestrator.wait(&id).await?
        }
    };
    follower.abort();

    let report = orchestrator.report(&id).await?;
    println!("{}", serde_json::to_string_pretty(report.as_ref())?);
    if outcome.status == ExecutionStatus::Error {
        bail!(
            "execution {id} ended in ERROR: {}",
            outcome.error.unwrap_or_default()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    let command = cli.command.unwrap_or(Commands::Serve {
        addr: None,
        history_limit: None,
        concurrency: None,
    });
    let mut overrides = CliOverrides {
        config: cli.config,
        ..Default::default()
    };

    match command {
        Commands::Serve {
            addr,
            history_limit,
            concurrency,
        } => {
            overrides.addr = addr;
            overrides.history_limit = history_limit;
            overrides.concurrency = concurrency;
            let config = ServerConfig::resolve(&overrides)?;
            if let Some(source) = &config.source {
                tracing::info!("Config: {}", source.display());
            }
            let orchestrator = Arc::new(build_orchestrator(&config));
            tracing::info!(
                "portal orchestrator {} (backend: {})",
                env!("CARGO_PKG_VERSION"),
                orchestrator.backend_name()
            );
            rest::serve(config.addr, Arc::new(AppState::new(orchestrator))).await?;
        }

        Commands::Bulk {
            targets,
            concurrency,
            mode,
            timeout_ms,
        } => {
            let config = ServerConfig::resolve(&overrides)?;
            let orchestrator = build_orchestrator(&config);
            let receipt = orchestrator
                .start_bulk(BulkRequest {
                    targets,
                    mode,
                    config: ConfigOverrides {
                        concurrency,
                        timeout_ms,
                        ..Default::default()
                    },
                })
                .await?;
            run_once(orchestrator, receipt.execution_id).await?;
        }

        Commands::Map {
            root_url,
            max_depth,
            max_elements,
            concurrency,
            timeout_ms,
            username,
        } => {
            let config = ServerConfig::resolve(&overrides)?;
            let orchestrator = build_orchestrator(&config);
            let credentials = username.map(|username| Credentials {
                username,
                password: std::env::var("PORTAL_PASSWORD").unwrap_or_default(),
            });
            let receipt = orchestrator
                .start_discovery(DiscoveryRequest {
                    root_url,
                    credentials,
                    config: ConfigOverrides {
                        max_depth,
                        max_elements,
                        concurrency,
                        timeout_ms,
                        ..Default::default()
                    },
                })
                .await?;
            run_once(orchestrator, receipt.execution_id).await?;
        }

        Commands::Info => {
            let config = ServerConfig::resolve(&overrides)?;
            let info = serde_json::json!({
                "name": "portal-orchestrator",
                "version": env!("CARGO_PKG_VERSION"),
                "jobClasses": ["BULK", "DISCOVERY"],
                "backend": "http",
                "config": config,
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "portal-orchestrator", &mut std::io::stdout());
        }
    }

    Ok(())
}
