//! cutover: release orchestrator CLI.
//!
//! Runs releases against the local platform and inspects what the state
//! store knows about services, task specification history, pipeline runs
//! and deployment leases.
//!
//! # Usage
//!
//! ```text
//! cutover init --app shop
//! cutover push dev --commit 3f9a1c2 --file target/app.tar
//! cutover run dev --commit 3f9a1c2 --branch develop --set LOG_LEVEL=debug
//! cutover status
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

mod commands;

#[derive(Parser)]
#[command(
    name = "cutover",
    about = "Cutover: release orchestrator with automatic rollback",
    version,
    propagate_version = true
)]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = "cutover.toml")]
    config: PathBuf,

    /// State store file.
    #[arg(long, global = true, default_value = ".cutover/state.redb")]
    state: PathBuf,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Write a starter cutover.toml with dev, staging and prod.
    Init {
        /// Application name used for clusters, services and repositories.
        #[arg(long, default_value = "app")]
        app: String,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Show the resolved configuration of an environment.
    Resolve {
        environment: String,
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Run a release: source, build, test, deploy.
    ///
    /// Ctrl-C during the deploy stage cancels the rollout and rolls back.
    Run {
        environment: String,
        #[arg(long)]
        commit: String,
        /// Branch the commit was pushed to. Must match the environment.
        #[arg(long)]
        branch: String,
        /// Environment variable override, `KEY=VALUE`. Repeatable.
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
        /// Command run against the built artifact as the test stage.
        #[arg(long)]
        test_cmd: Option<String>,
        /// Write imagedefinitions.json into this directory.
        #[arg(long)]
        definitions_dir: Option<PathBuf>,
        /// Fail the local rollout after this many crash restarts.
        #[arg(long)]
        circuit_breaker: Option<u32>,
    },
    /// Record an artifact in the local registry.
    Push {
        environment: String,
        #[arg(long)]
        commit: String,
        /// Explicit digest, `<algorithm>:<hex>`.
        #[arg(long, conflicts_with = "file")]
        digest: Option<String>,
        /// Compute a sha256 digest from this file.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Registry host prefix of the artifact location.
        #[arg(long, default_value = "registry.local")]
        host: String,
    },
    /// Make a task version crash on start in the local platform.
    Crash { environment: String, version: u64 },
    /// Show service state, stable version and lease per environment.
    Status {
        environment: Option<String>,
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// List task specification versions of an environment.
    History { environment: String },
    /// List recorded pipeline runs, newest first.
    Runs {
        environment: Option<String>,
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Inspect or break deployment leases.
    Lease {
        #[command(subcommand)]
        action: LeaseAction,
    },
}

#[derive(Subcommand)]
enum LeaseAction {
    /// Show active leases.
    Show,
    /// Force-release the lease of an environment's service.
    Release { environment: String },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,cutover=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let paths = commands::Paths {
        config: cli.config,
        state: cli.state,
    };

    match cli.command {
        Command::Init { app, force } => commands::setup::init(&paths, &app, force),
        Command::Resolve {
            environment,
            format,
        } => commands::setup::resolve(&paths, &environment, format),
        Command::Run {
            environment,
            commit,
            branch,
            overrides,
            test_cmd,
            definitions_dir,
            circuit_breaker,
        } => {
            let options = commands::release::RunOptions {
                environment,
                commit,
                branch,
                overrides,
                test_cmd,
                definitions_dir,
                circuit_breaker,
            };
            commands::release::run(&paths, options).await
        }
        Command::Push {
            environment,
            commit,
            digest,
            file,
            host,
        } => commands::release::push(&paths, &environment, &commit, digest, file, &host),
        Command::Crash {
            environment,
            version,
        } => commands::release::crash(&paths, &environment, version),
        Command::Status {
            environment,
            format,
        } => commands::inspect::status(&paths, environment.as_deref(), format),
        Command::History { environment } => commands::inspect::history(&paths, &environment),
        Command::Runs {
            environment,
            limit,
            format,
        } => commands::inspect::runs(&paths, environment.as_deref(), limit, format),
        Command::Lease { action } => match action {
            LeaseAction::Show => commands::inspect::leases(&paths),
            LeaseAction::Release { environment } => {
                commands::inspect::release_lease(&paths, &environment)
            }
        },
    }
}
