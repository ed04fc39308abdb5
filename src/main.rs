mod auth;
mod config;
mod distro;
mod http_api;
mod installer;
mod jobs;
mod logging;
mod planner;
mod privileged;
mod rate_limit;
mod server;
#[cfg(test)]
mod test_support;
mod worker_pool;

use crate::auth::{AuthError, Authenticator};
use crate::config::{Config, ConfigError, LogLevel, ServerSettings};
use crate::http_api::AppState;
use crate::jobs::JobRegistry;
use crate::planner::{Planner, RpmTool};
use crate::privileged::{LocalExecutor, SystemExecutor};
use crate::rate_limit::RateLimiter;
use crate::server::ServeError;
use crate::worker_pool::WorkerPool;
use clap::Parser;
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const EXIT_SETUP_FAILURE: i32 = 1;
const EXIT_STARTUP_FAILURE: i32 = 2;

#[derive(Parser)]
#[command(name = "cloud-update")]
#[command(version, about = "Signed-webhook daemon for cloud VM maintenance")]
struct Cli {
    /// Install the binary, configuration and service unit, then start the service
    #[arg(long, conflicts_with = "uninstall")]
    setup: bool,

    /// Stop the service and remove its unit and binary; configuration is kept
    #[arg(long)]
    uninstall: bool,
}

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid webhook secret: {0}")]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Serve(#[from] ServeError),
    #[error("failed to start runtime: {0}")]
    Runtime(io::Error),
}

impl StartupError {
    fn kind(&self) -> &'static str {
        match self {
            Self::Config(err) => err.kind(),
            Self::Auth(err) => err.kind(),
            Self::Serve(err) => err.kind(),
            Self::Runtime(_) => "runtime",
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let code = if cli.setup || cli.uninstall {
        run_installer(cli.setup)
    } else {
        run_daemon()
    };
    std::process::exit(code);
}

fn run_installer(setup: bool) -> i32 {
    let _guard = logging::init(LogLevel::Info, None);
    let result = if setup {
        installer::run_setup().map(|report| {
            info!(
                init = ?report.init,
                secret_generated = report.secret_generated,
                "setup complete"
            );
        })
    } else {
        installer::run_uninstall()
    };

    match result {
        Ok(()) => 0,
        Err(err) => {
            error!(kind = err.kind(), err = %err, "installer failed");
            EXIT_SETUP_FAILURE
        }
    }
}

fn run_daemon() -> i32 {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            // Logging is not configured yet.
            eprintln!("cloud-update: {err}");
            return EXIT_STARTUP_FAILURE;
        }
    };
    let guard = logging::init(config.log_level, config.log_file.as_deref());

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(StartupError::Runtime)
        .and_then(|runtime| runtime.block_on(run(config, ServerSettings::default())));

    let code = match result {
        Ok(()) => 0,
        Err(err) => {
            error!(kind = err.kind(), err = %err, "cloud-update failed");
            EXIT_STARTUP_FAILURE
        }
    };
    drop(guard);
    code
}

async fn run(config: Config, settings: ServerSettings) -> Result<(), StartupError> {
    info!(version = env!("CARGO_PKG_VERSION"), config = ?config, "starting cloud-update");
    if config.secret_is_weak() {
        warn!("webhook secret is shorter than 16 bytes");
    }

    let auth = Arc::new(Authenticator::new(&config.secret, settings.max_skew)?);
    let listener = server::bind(config.bind_addr()).await?;

    let jobs = Arc::new(JobRegistry::new(settings.job_retention));
    let limiter = Arc::new(RateLimiter::new(settings.rate_limit));
    let executor = Arc::new(LocalExecutor::new());
    executor.distribution();
    let pool = Arc::new(WorkerPool::start(
        settings.pool,
        Arc::clone(&jobs),
        Planner::new(RpmTool::probe()),
        executor,
    ));

    let shutdown = CancellationToken::new();
    let sweepers = server::spawn_sweepers(
        Arc::clone(&jobs),
        settings.job_sweep_interval,
        Arc::clone(&limiter),
        settings.limiter_sweep_interval,
        shutdown.clone(),
    );
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let router = http_api::create_router(AppState {
        auth,
        limiter,
        jobs,
        pool: Arc::clone(&pool),
        body_limit: settings.body_limit,
    });
    let served = server::serve(
        listener,
        router,
        &config.tls,
        shutdown.clone(),
        settings.drain_timeout,
    )
    .await;

    // Serving may also end on error; stop everything else either way.
    shutdown.cancel();
    let outcome = pool.shutdown(settings.shutdown_grace).await;
    info!(outcome = ?outcome, "worker pool stopped");
    for sweeper in sweepers {
        let _ = sweeper.await;
    }
    info!("cloud-update stopped");
    served.map_err(StartupError::from)
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    let signal_name = wait_for_signal().await;
    info!(signal = signal_name, "shutdown requested");
    shutdown.cancel();
}

async fn wait_for_signal() -> &'static str {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!(err = %err, "SIGTERM handler unavailable; waiting for SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };
    tokio::select! {
        _ = terminate.recv() => "SIGTERM",
        _ = tokio::signal::ctrl_c() => "SIGINT",
    }
}

pub(crate) fn current_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}
