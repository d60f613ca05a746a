use std::{env, path::Path, time::Duration};

use clap::{Args, Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use plumb::{
    config::{self, Config, Telemetry},
    registry::Registry,
    scheduler::{self, Scheduler},
};
use tokio::{runtime::Builder, signal};
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to load plumb config: {0}")]
    Config(#[from] config::Error),
    #[error("Plumb pipeline failed: {0}")]
    Scheduler(#[from] scheduler::Error),
    #[error("Failed to install prometheus exporter: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
    #[error("Could not join the pipeline task: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn default_config_path() -> String {
    "/etc/plumb/plumb.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run plumb with specified configuration
    Run(RunCommand),
    /// Validate configuration and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file or directory
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file or directory
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

fn get_config(config_path: &str) -> Result<Config, Error> {
    let config = if let Ok(contents) = env::var("PLUMB_CONFIG") {
        debug!("Using config from env var 'PLUMB_CONFIG'");
        Config::parse(&contents)
    } else {
        debug!("Attempting to load configuration from: {config_path}");
        config::load_config_from_path(Path::new(config_path))
    };
    config.map_err(|err| {
        error!("Configuration validation failed: {err}");
        Error::Config(err)
    })
}

fn check_config(config_path: &str) -> Result<(), Error> {
    let config = get_config(config_path)?;
    // Building the pipeline resolves every plugin and its options.
    Scheduler::new(&config, &Registry::with_builtins()).map_err(|err| {
        error!("Configuration validation failed: {err}");
        Error::Scheduler(err)
    })?;
    info!("Configuration is valid");
    Ok(())
}

async fn inner_main(config: Config) -> Result<(), Error> {
    if let Some(Telemetry {
        addr,
        global_labels,
    }) = config.telemetry.clone()
    {
        let mut builder = PrometheusBuilder::new().with_http_listener(addr);
        for (k, v) in global_labels {
            builder = builder.add_global_label(k, v);
        }
        builder.install()?;
        info!("Prometheus exporter listening on {addr}");
    }

    let registry = Registry::with_builtins();
    let scheduler = Scheduler::new(&config, &registry)?;
    let (shutdown_watcher, shutdown_broadcast) = plumb_signal::signal("shutdown");
    let mut pipeline = tokio::spawn(scheduler.run(shutdown_watcher));

    tokio::select! {
        res = signal::ctrl_c() => {
            res?;
            info!("received ctrl-c");
        }
        res = &mut pipeline => {
            // The pipeline only ends on its own when it fails to start.
            res??;
            return Ok(());
        }
    }
    shutdown_broadcast.signal();
    pipeline.await??;
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting plumb {version}.");

    let args = match Cli::parse().command {
        Commands::Run(run_cmd) => run_cmd,
        Commands::ConfigCheck(config_check_cmd) => {
            match check_config(&config_check_cmd.config_path) {
                Ok(()) => std::process::exit(0),
                Err(_) => std::process::exit(1),
            }
        }
    };

    let config = get_config(&args.config_path)?;
    let max_shutdown_delay = Duration::from_secs(args.max_shutdown_delay.into());

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config));
    // Plugins may spawn tasks of their own that do not watch for shutdown.
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    info!("Bye. :)");
    res
}
