use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use veilnet::config::{Config, LogSink};
use veilnet::router::{write_default_config, Router};

#[derive(Parser, Debug)]
#[command(name = "veilnet")]
#[command(author, version, about = "onion-routing overlay router", long_about = None)]
struct Args {
    /// Configuration file.
    #[arg(default_value = "veilnet.ini")]
    config: PathBuf,

    /// Write a default relay configuration and exit.
    #[arg(long)]
    router: bool,

    /// Write a default client configuration and exit.
    #[arg(long)]
    client: bool,
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    match config.logging.sink {
        LogSink::Stdout => fmt().with_env_filter(filter).init(),
        LogSink::Json => fmt().json().with_env_filter(filter).init(),
        LogSink::File => {
            let path = config
                .logging
                .file
                .as_ref()
                .expect("validated: file sink has a path");
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
    }
    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    if args.router || args.client {
        return write_default_config(&args.config, args.router);
    }

    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    init_logging(&config)?;

    let router = Router::new(config).await?;
    info!(id = %router.our_id(), addr = %router.local_addr(), "router is up");
    router.run_until_interrupted().await?;
    info!("clean shutdown");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Logging may not be initialized yet when startup fails.
            error!(error = %e, "startup failed");
            eprintln!("veilnet: {e:#}");
            ExitCode::FAILURE
        }
    }
}
