mod summary;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use apihub_config::ConfigLoader;
use apihub_db::Bootstrap;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "apihub",
    version,
    about = "Wait for the database and bring its schema up to date"
)]
struct Cli {
    /// YAML or TOML config file
    #[arg(long, global = true, env = "APIHUB_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe the database and apply pending migrations (default)
    Bootstrap,
    /// Show the ledger state of every migration without applying anything
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // .env is optional
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<apihub_common::Error>() {
                Some(e) => eprintln!("{} stage failed: {e}", e.stage()),
                None => eprintln!("error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = ConfigLoader::load(cli.config.as_deref())?;
    let bootstrap = Bootstrap::new(config);
    let location = bootstrap.migration_source().location();

    match cli.command.unwrap_or(Command::Bootstrap) {
        Command::Bootstrap => {
            info!("starting database bootstrap");
            let report = tokio::task::spawn_blocking(move || bootstrap.run())
                .await
                .context("bootstrap task did not complete")??;
            summary::print_summary(&report, &location);
        }
        Command::Status { json } => {
            let statuses = tokio::task::spawn_blocking(move || bootstrap.status())
                .await
                .context("status task did not complete")??;
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                summary::print_status(&statuses);
            }
        }
    }
    Ok(())
}
