use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::process::ExitCode;
use std::sync::Arc;

use gatewarden::capture::{self, Ingestor, PnetCapture};
use gatewarden::config::{Config, LoggingConfig};
use gatewarden::report::{self, ReportMode};
use gatewarden::shutdown::{ShutdownManager, ShutdownReason};
use gatewarden::{enforcement, AccountingWindow, AppError, BlockManager, Evaluator};

#[derive(Parser, Debug)]
#[command(name = "gatewarden")]
#[command(about = "Gateway traffic monitor with automatic source blocking", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "gatewarden.toml")]
    config: String,

    /// Interface to capture on (repeatable, replaces the configured list)
    #[arg(short, long = "interface")]
    interfaces: Vec<String>,

    /// Log firewall changes instead of running iptables
    #[arg(long)]
    dry_run: bool,

    /// Report mode: table, json, log or off
    #[arg(long)]
    report: Option<ReportMode>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.generate_config {
        match Config::default().save_to_file(&args.config) {
            Ok(_) => {
                println!("✅ Generated default config at: {}", args.config);
                return ExitCode::SUCCESS;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    let (mut config, found) = match Config::load_or_default(&args.config) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };
    apply_overrides(&mut config, &args);

    if let Err(e) = config.validate() {
        eprintln!("❌ Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    let _log_guard = match setup_logging(&config.logging, args.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("❌ Failed to set up logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if found {
        tracing::info!("✓ Loaded configuration from {}", args.config);
    } else {
        tracing::warn!("⚠️  {} not found, using defaults", args.config);
    }
    for warning in config.warnings() {
        tracing::warn!("⚠️  {}", warning);
    }

    // Return instead of exiting so `_log_guard` drops and flushes the log file
    match run(config, args.dry_run).await {
        Ok(ShutdownReason::Signal) => {
            tracing::info!("👋 Gatewarden stopped");
            ExitCode::SUCCESS
        }
        Ok(ShutdownReason::Internal) => {
            tracing::error!("❌ Gatewarden stopped after a capture failure");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!("❌ {}", e);
            ExitCode::FAILURE
        }
    }
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if !args.interfaces.is_empty() {
        config.monitor.interfaces = args.interfaces.clone();
    }
    if let Some(mode) = args.report {
        config.report.mode = mode;
    }
}

async fn run(config: Config, dry_run: bool) -> Result<ShutdownReason, AppError> {
    let version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");

    let window = Arc::new(AccountingWindow::new(
        config.window_duration(),
        config.rules.pattern.band,
    ));
    let enforcer = enforcement::from_config(&config.enforcement, dry_run);
    let blocks = BlockManager::new(enforcer, config.block_duration());
    let ingestor = Ingestor::new(window.clone(), blocks.view());
    let rules = config.rule_set();

    tracing::info!("🚀 Gatewarden v{} ({})", version, git_hash);
    tracing::info!(
        interfaces = ?config.monitor.interfaces,
        window_secs = config.monitor.window_secs,
        block_secs = config.monitor.block_secs,
        enforcer = blocks.enforcer_name(),
        "  └─ Rules: {}",
        rules.describe()
    );

    // Open every interface before spawning anything so a bad name fails fast
    let mut sources = Vec::with_capacity(config.monitor.interfaces.len());
    for interface in &config.monitor.interfaces {
        match PnetCapture::open(interface, config.monitor.tcp_only) {
            Ok(source) => sources.push(source),
            Err(e) => {
                tracing::error!(
                    available = ?PnetCapture::available_interfaces(),
                    "❌ Cannot capture on {}",
                    interface
                );
                return Err(e.into());
            }
        }
    }

    let mut shutdown_manager = ShutdownManager::new();
    let shutdown_token = shutdown_manager.token();
    let capture_failed = Arc::new(AtomicBool::new(false));

    for source in sources {
        let ingestor = ingestor.clone();
        let token = shutdown_token.clone();
        let failed = capture_failed.clone();
        let handle = tokio::task::spawn_blocking(move || {
            if capture::run_capture(source, ingestor, token.clone()).is_err() {
                failed.store(true, Ordering::SeqCst);
                token.cancel();
            }
        });
        shutdown_manager.register_task(handle);
    }

    let evaluator = Evaluator::new(window, rules, config.source_policy(), blocks);
    let sink = report::sink_for(config.report.mode);
    let tick_interval = config.tick_interval();
    let reconcile_interval = config.reconcile_interval();
    // Not registered with the shutdown manager: releasing every block must
    // finish regardless of the grace period.
    let evaluation = tokio::spawn(evaluator.run(
        tick_interval,
        reconcile_interval,
        sink,
        shutdown_token.clone(),
    ));

    let stats = ingestor.stats();
    let reason = shutdown_manager.wait_for_shutdown().await;
    let released = evaluation.await?;
    tracing::info!(released, "✓ Released all blocks");
    tracing::info!(
        accepted = stats.accepted(),
        discarded = stats.discarded(),
        "📊 Packets ingested"
    );

    if capture_failed.load(Ordering::SeqCst) {
        return Ok(ShutdownReason::Internal);
    }
    Ok(reason)
}

/// Install the global subscriber. The returned guard flushes the file writer
/// and must live until exit.
fn setup_logging(
    config: &LoggingConfig,
    verbose: bool,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, AppError> {
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "trace" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (writer, guard, to_file) = if config.output == "file" {
        let path = std::path::Path::new(&config.file_path);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        std::fs::create_dir_all(dir)?;
        let prefix = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "gatewarden.log".to_string());
        let appender = tracing_appender::rolling::daily(dir, prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        (BoxMakeWriter::new(non_blocking), Some(guard), true)
    } else {
        (BoxMakeWriter::new(std::io::stderr), None, false)
    };

    // Detect if running under systemd/journald
    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    // Get hostname - shorten to first part before dot
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_thread_ids(false)
                .init();
        }
        _ => {
            if is_systemd && !to_file {
                // journald already adds timestamp and hostname
                fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(false)
                    .with_line_number(false)
                    .without_time()
                    .compact()
                    .init();
            } else {
                fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_ansi(!to_file)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_timer(CustomTimer {
                        hostname: short_hostname,
                    })
                    .compact()
                    .init();
            }
        }
    }

    Ok(guard)
}

// UTC time and short hostname, e.g. "2025-12-10 18:09:43.150 [gw1]"
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}
