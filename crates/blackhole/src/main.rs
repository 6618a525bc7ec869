use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use libblackhole::{AppConfig, Daemon, Secrets};
use tracing::info;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

#[derive(Parser)]
#[command(version, author, about)]
struct Opts {
    /// Path to the YAML config file. By default blackhole.{yml,yaml} is
    /// searched in /etc/blackhole and the working directory.
    #[arg(long = "config", env = "BLACKHOLE_CONFIG")]
    config: Option<PathBuf>,

    /// Path to a KEY=VALUE secrets file. Process environment wins.
    #[arg(long = "secrets", env = "BLACKHOLE_SECRETS", default_value = ".env")]
    secrets: PathBuf,

    /// The value for RUST_LOG when it is not set.
    #[arg(
        long = "log-level",
        env = "BLACKHOLE_LOG",
        default_value = "info,libblackhole=debug"
    )]
    log_level: String,

    /// Emit logs as JSON.
    #[arg(long = "log-json", env = "BLACKHOLE_LOG_JSON")]
    log_json: bool,

    /// How many threads to spawn for the runtime.
    #[arg(short = 't', long, env = "BLACKHOLE_WORKER_THREADS")]
    worker_threads: Option<usize>,
}

fn init_logging(opts: &Opts) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&opts.log_level));
    let fmt_layer: Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync> = if opts.log_json {
        Box::new(fmt::layer().json())
    } else {
        Box::new(fmt::layer())
    };
    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(filter))
        .init();
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    init_logging(&opts);

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(threads) = opts.worker_threads {
        builder.worker_threads(threads);
    }
    let rt = builder.build().context("error creating tokio runtime")?;
    rt.block_on(async_main(opts))
}

async fn async_main(opts: Opts) -> anyhow::Result<()> {
    let config = AppConfig::load_from(opts.config.as_deref())?;
    let secrets = Secrets::load(Some(&opts.secrets));
    let daemon = Daemon::new(config, &secrets)?;

    let cancel = daemon.cancel_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            cancel.cancel();
        }
    });

    daemon.run().await
}
