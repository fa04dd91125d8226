use std::path::PathBuf;

use clap::{Parser, Subcommand};

use multiserve::config::load_config;
use multiserve::lifecycle::{RunOptions, Shutdown, Worker};
use multiserve::observability::{self, metrics};
use multiserve::service::AppRegistry;

#[derive(Parser)]
#[command(name = "multiserve")]
#[command(about = "Embedded HTTP application server with prefix routing and process supervision", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single server process
    Serve {
        /// Configuration file (TOML)
        config: PathBuf,
    },
    /// Run a supervisor with `[supervisor].processes` workers sharing one socket
    Supervise {
        /// Configuration file (TOML)
        config: PathBuf,
        /// Common log file for all services ("-" for stdout)
        #[arg(short = 'l', long = "log")]
        log_file: Option<String>,
        /// Common requests file for all services ("-" for stdout)
        #[arg(short = 'r', long = "requests")]
        requests_file: Option<String>,
        /// Enable debug logging
        #[arg(short = 'd', long)]
        debug: bool,
    },
    /// Supervised worker (started by `supervise`)
    #[command(hide = true)]
    Worker {
        config: PathBuf,
        /// Inherited listening socket
        #[arg(long)]
        listen_fd: i32,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => serve(config).await,
        Commands::Supervise {
            config,
            log_file,
            requests_file,
            debug,
        } => supervise(config, log_file, requests_file, debug).await,
        Commands::Worker { config, listen_fd } => worker(config, listen_fd).await,
    }
}

async fn serve(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&config_path)?;
    observability::init_console(&config.logger.level)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?config_path,
        services = config.services.len(),
        "multiserve starting"
    );

    if config.metrics.enabled {
        match config.metrics.address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.metrics.address,
                "Failed to parse metrics address"
            ),
        }
    }

    let worker = Worker::start(&config_path, config, AppRegistry::with_builtins(), None)?;
    let shutdown = Shutdown::new();
    worker
        .run(
            RunOptions {
                signals: true,
                watch_config: true,
                control_stdin: false,
            },
            shutdown.subscribe(),
        )
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn supervise(
    config_path: PathBuf,
    log_file: Option<String>,
    requests_file: Option<String>,
    debug: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    use std::sync::Arc;

    use multiserve::observability::{CentralLogger, ForwardLayer, LogLayout, LogOverrides, RecordSink};
    use multiserve::supervisor::{ProcessSupervisor, SupervisorOptions};

    let config = load_config(&config_path)?;
    let overrides = LogOverrides {
        log_file,
        requests_file,
        debug: debug.then_some(true),
    };

    let logger = Arc::new(CentralLogger::start(
        &config.logger,
        LogLayout::from_config(&config.logger, &config.services, &overrides),
    ));
    let handle = logger.handle();
    let sink: RecordSink = Arc::new(move |record| {
        handle.try_log(record);
    });
    let level = if debug { "debug" } else { config.logger.level.as_str() };
    observability::init_forwarding(level, ForwardLayer::new("supervisor", sink))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?config_path,
        "multiserve supervisor starting"
    );

    let options = SupervisorOptions {
        config_path,
        overrides,
        signals: true,
        worker_program: None,
    };
    let supervisor = ProcessSupervisor::new(options, config, logger)?;
    supervisor.run(Shutdown::new().subscribe()).await?;
    Ok(())
}

#[cfg(unix)]
async fn worker(config_path: PathBuf, listen_fd: i32) -> Result<(), Box<dyn std::error::Error>> {
    use multiserve::net::listener::inherit_listener;
    use multiserve::observability::{logging::stdout_sink, ForwardLayer};

    let config = load_config(&config_path)?;
    let source = format!("worker-{}", std::process::id());
    observability::init_forwarding(&config.logger.level, ForwardLayer::new(source, stdout_sink()))?;

    // SAFETY: the supervisor passes the descriptor of its listening socket,
    // inherited across exec and not otherwise used in this process.
    let listener = unsafe { inherit_listener(listen_fd)? };

    let worker = Worker::start(&config_path, config, AppRegistry::with_builtins(), Some(listener))?;
    let shutdown = Shutdown::new();
    worker
        .run(
            RunOptions {
                signals: true,
                watch_config: false,
                control_stdin: true,
            },
            shutdown.subscribe(),
        )
        .await?;
    Ok(())
}

#[cfg(not(unix))]
async fn supervise(
    _config_path: PathBuf,
    _log_file: Option<String>,
    _requests_file: Option<String>,
    _debug: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    Err("process supervision needs a unix platform; use `serve`".into())
}

#[cfg(not(unix))]
async fn worker(_config_path: PathBuf, _listen_fd: i32) -> Result<(), Box<dyn std::error::Error>> {
    Err("process supervision needs a unix platform; use `serve`".into())
}
