//! toolmux CLI: the main entry point.
//!
//! Commands:
//! - `ask`     Answer one query with the builtin or configured peers
//! - `tools`   Spawn the peers and list what they advertise
//! - `peer`    Serve a builtin peer on stdio
//! - `doctor`  Check configuration and credentials

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

mod commands;

use commands::peer::PeerKind;

#[derive(Parser)]
#[command(
    name = "toolmux",
    about = "toolmux: answer a query by orchestrating tool peers",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.toolmux/config.toml)
    #[arg(short, long, global = true, env = "TOOLMUX_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a query; prompts for one when omitted
    Ask {
        query: Option<String>,
    },

    /// Spawn the peers and print the aggregated tool registry
    Tools,

    /// Serve a builtin peer over stdin/stdout
    Peer {
        #[arg(value_enum)]
        kind: PeerKind,
    },

    /// Diagnose configuration and credentials
    Doctor,
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    // stdout carries the protocol in peer mode and the answer otherwise.
    let peer_mode = matches!(cli.command, Commands::Peer { .. });
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_ansi(!peer_mode)
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: cannot start the async runtime: {e}");
            return ExitCode::from(1);
        }
    };

    let code = runtime.block_on(run(cli));
    // A pending stdin read would otherwise hold the runtime open.
    runtime.shutdown_timeout(Duration::from_millis(500));
    ExitCode::from(code)
}

async fn run(cli: Cli) -> u8 {
    let config = cli.config;
    let result = match cli.command {
        Commands::Ask { query } => commands::ask::run(config.as_deref(), query).await,
        Commands::Tools => commands::tools::run(config.as_deref()).await,
        Commands::Peer { kind } => commands::peer::run(kind).await,
        Commands::Doctor => commands::doctor::run(config.as_deref()).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            println!("Error: {e:#}");
            1
        }
    }
}
