//! aos-sm: node-local service manager daemon.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aos_sm::config::Config;
use aos_sm::core::{default_config_file, AosCore};

const EXIT_INIT_FAILURE: u8 = 1;
const EXIT_FATAL: u8 = 2;

/// Aos service manager
#[derive(Parser, Debug)]
#[command(name = "aos-sm", version, about)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aos_sm=info,tonic=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // A panic anywhere is a fatal runtime error.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        std::process::exit(EXIT_FATAL as i32);
    }));

    let args = Args::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "can't create runtime");

            return ExitCode::from(EXIT_INIT_FAILURE);
        }
    };

    runtime.block_on(run(args))
}

async fn run(args: Args) -> ExitCode {
    let config_file = args
        .config
        .unwrap_or_else(|| default_config_file().to_path_buf());

    let config = match Config::load(&config_file).await {
        Ok(config) => config,
        Err(err) => {
            error!(file = %config_file.display(), %err, "can't parse config");

            return ExitCode::from(EXIT_INIT_FAILURE);
        }
    };

    let core = match AosCore::new(config).await {
        Ok(core) => core,
        Err(err) => {
            error!(%err, "initialization failed");

            return ExitCode::from(EXIT_INIT_FAILURE);
        }
    };

    info!("SM started");

    tokio::select! {
        _ = core.run() => {}
        _ = shutdown_signal() => {
            info!("termination signal received");
        }
    }

    core.shutdown().await;

    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(err) => {
            error!(%err, "can't install SIGTERM handler");

            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}
