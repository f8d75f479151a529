mod config;
mod report;

use clap::{Parser, Subcommand};
use config::{CommonConfig, Config};
use stat_server::server::{ServerState, ShutdownHandle};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_CONFIG: &str = "/etc/softstat/stat.yaml";

/// Module usage statistics server.
#[derive(Parser)]
#[command(name = "softstat", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Logging verbosity (trace, debug, info, warn, error) or a full filter
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Receive usage reports and store them
    Serve,
    /// Send a single usage report to a server
    Report(report::ReportArgs),
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("invalid log level: {0}")]
    LogLevel(#[from] tracing_subscriber::filter::ParseError),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error("could not install metrics exporter: {0}")]
    Metrics(String),
    #[error("could not build tokio runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error(transparent)]
    Startup(#[from] stat_server::StartupError),
    #[error(transparent)]
    Report(#[from] report::ReportError),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            CliError::LogLevel(_) | CliError::Config(_) => 2,
            CliError::Startup(e) => e.exit_code(),
            CliError::Metrics(_) | CliError::Runtime(_) | CliError::Report(_) => 1,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "softstat failed");
            eprintln!("softstat: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let filter = EnvFilter::try_new(&cli.log_level)?;

    match cli.command {
        CliCommand::Report(args) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
            report::send(&args)?;
            Ok(())
        }
        CliCommand::Serve => {
            let config = Config::from_file(&cli.config)?;
            let _sentry = init_logging(filter, &config.common);
            init_metrics(&config.common)?;
            serve(config)
        }
    }
}

/// Installs the fmt subscriber, plus the Sentry layer when a DSN is configured.
/// The returned guard flushes Sentry events when dropped.
fn init_logging(filter: EnvFilter, common: &CommonConfig) -> Option<sentry::ClientInitGuard> {
    let guard = common.logging.as_ref().map(|logging| {
        sentry::init((
            logging.sentry_dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

fn init_metrics(common: &CommonConfig) -> Result<(), CliError> {
    let Some(metrics_config) = &common.metrics else {
        return Ok(());
    };

    let recorder = metrics_exporter_statsd::StatsdBuilder::from(
        metrics_config.statsd_host.as_str(),
        metrics_config.statsd_port,
    )
    .build(Some("softstat"))
    .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;

    shared::metrics_defs::describe_all(stat_server::metrics_defs::ALL_METRICS);
    tracing::info!(
        host = %metrics_config.statsd_host,
        port = metrics_config.statsd_port,
        "statsd exporter installed"
    );
    Ok(())
}

fn serve(config: Config) -> Result<(), CliError> {
    // The ingestion loop and the signal listener share one thread.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;

    rt.block_on(async {
        let shutdown = ShutdownHandle::new();
        tokio::spawn(listen_for_signals(shutdown.clone()));

        let summary = stat_server::run(config.server, shutdown).await?;
        tracing::info!(
            received = summary.received,
            successful = summary.successful,
            "statistics server stopped"
        );
        Ok(())
    })
}

/// Turns SIGINT/SIGTERM into a shutdown request. Nothing else happens here;
/// the server loop cleans up after itself.
async fn listen_for_signals(shutdown: ShutdownHandle) {
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => Some(sigterm),
            Err(e) => {
                tracing::warn!(error = %e, "could not register SIGTERM handler");
                None
            }
        };

    let sigterm_recv = async {
        match sigterm.as_mut() {
            Some(sigterm) => {
                sigterm.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, initiating server shutdown");
        }
        _ = sigterm_recv => {
            tracing::info!("received SIGTERM, initiating server shutdown");
        }
    }

    shutdown.request();
    if shutdown.state() == ServerState::ShutdownRequested {
        tracing::info!("waiting for server finalization");
    }
}
