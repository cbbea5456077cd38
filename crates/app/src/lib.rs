use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use motionreel_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use motionreel_core::driver::{prepare_pipeline, BatchReport, GenerationDriver};
use motionreel_core::encode::FfmpegEncoder;
use motionreel_core::logging::{self, LogSettings, RuntimeLogMode, DEFAULT_LOG_FILTER};
use motionreel_core::progress::{PollOutcome, ProgressPoller, ProgressSnapshot, ProgressTracker};
use motionreel_core::request::GenerationRequest;
use motionreel_core::server::{app_router, AppState};
use motionreel_core::service::HttpGenerationService;
use motionreel_core::session::{GenerationSession, OutputManager, SessionSlot};

const REPL_PROMPT: &str = "Enter prompt: ";

#[derive(Parser)]
#[command(
    name = "motionreel",
    about = "Text-to-video sample generation on top of an AnimateDiff service",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Read prompts from stdin and generate samples for each.
    Prompt,
    /// Generate samples for a single prompt.
    Generate(GenerateArgs),
    /// Report progress of an existing output directory.
    Watch(WatchArgs),
}

#[derive(Args)]
struct GenerateArgs {
    prompt: String,
    #[arg(short = 'n', long = "samples", help = "Number of samples to generate")]
    samples: Option<u32>,
    #[arg(long)]
    negative_prompt: Option<String>,
}

#[derive(Args)]
struct WatchArgs {
    #[arg(help = "Session output directory")]
    dir: PathBuf,
    #[arg(long, help = "Sanitized prompt label used in sample file names")]
    label: String,
    #[arg(long = "samples", help = "Number of samples expected")]
    samples: u32,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() {
        RuntimeLogMode::Cli
    } else {
        RuntimeLogMode::Server
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(&resolved_data_dir, cli.verbose, cli.log_filter.as_deref());
    motionreel_core::runtime::log_runtime_tool_status();
    log_startup_metadata(mode, &resolved_data_dir);

    let config = load_config(&resolved_data_dir)?;

    match cli.command {
        Some(Commands::Prompt) => run_prompt_loop(config).await,
        Some(Commands::Generate(args)) => run_generate(config, args).await,
        Some(Commands::Watch(args)) => run_watch(config, args).await,
        None => run_server(config, cli.port, cli.host).await,
    }
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>) {
    let crash_hook = logging::install_crash_hook(data_dir);
    let filters = LogSettings::from_env(verbose, cli_log_filter).filters();
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));

    let log_file = logging::rolling_log_file(data_dir);
    let installed = match log_file {
        Ok(appender) => tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(console_layer).with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(appender)
                    .with_filter(parse_env_filter_with_fallback(&filters.file, "file")),
            ),
        ),
        Err(error) => {
            eprintln!("Warning: file logging unavailable ({error:#}); logging to console only.");
            tracing::subscriber::set_global_default(
                tracing_subscriber::registry().with(console_layer),
            )
        }
    };

    if let Err(error) = installed {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
    }
    if let Err(error) = crash_hook {
        let reason = format!("{error:#}");
        warn!(error = %reason, "Crash reports disabled");
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(mode: RuntimeLogMode, data_dir: &Path) {
    info!(
        mode = mode.as_str(),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> Result<AppConfig> {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(data_dir);
    let config = AppConfig::load_from_path(&cfg_path)?;
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", cfg_path.display()))?;
    Ok(config)
}

fn output_manager(config: &AppConfig) -> OutputManager {
    OutputManager::new(
        config.paths.outputs_dir.clone(),
        config.generation.tool_name.clone(),
    )
    .with_intermediate_dir(config.sampler.save_intermediate)
}

/// Connect to the generation service, load the pipeline and wire up the
/// encoder. Runs on a blocking thread because the service client is blocking.
async fn connect_driver(config: &AppConfig) -> Result<GenerationDriver> {
    let config = config.clone();
    tokio::task::spawn_blocking(move || -> Result<GenerationDriver> {
        match FfmpegEncoder::version() {
            Ok(version) => info!(%version, "ffmpeg available"),
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(error = %reason, "ffmpeg version check failed");
            }
        }

        info!(url = %config.service.display_url(), "Connecting to generation service");
        let service = HttpGenerationService::new(&config.service)?;
        prepare_pipeline(&service, &config)?;

        Ok(GenerationDriver::from_config(
            Arc::new(service),
            Arc::new(FfmpegEncoder::new(config.encoder.clone())),
            &config,
        ))
    })
    .await
    .context("pipeline setup task failed")?
}

async fn run_server(
    config: AppConfig,
    port_override: Option<u16>,
    host_override: Option<String>,
) -> Result<()> {
    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let driver = connect_driver(&config).await?;
    let app = app_router(AppState::new(config, driver));

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting motionreel server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_prompt_loop(config: AppConfig) -> Result<()> {
    let driver = connect_driver(&config).await?;

    tokio::task::spawn_blocking(move || {
        let outputs = output_manager(&config);
        let slot = SessionSlot::new();
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();

        run_repl(stdin.lock(), stdout.lock(), |prompt, out| {
            let request = GenerationRequest::from_prompt(
                prompt,
                &config.generation.cli_negative_prompt,
                config.generation.cli_sample_count,
                &config.generation,
            )?;
            let session = driver.open_session(&outputs, &slot, &request)?;
            writeln!(
                out,
                "Output directory: {}\nLabel: {}",
                session.output_directory.display(),
                session.label
            )?;
            out.flush()?;

            let report = run_with_event_progress(&driver, &session, &request)?;
            writeln!(out, "{}", summarize(&report))?;
            Ok(())
        })
    })
    .await
    .context("prompt loop task failed")?
}

/// Read prompts line by line until EOF. Blank lines are skipped and a failed
/// prompt is reported without ending the loop.
fn run_repl<R, W>(
    mut input: R,
    mut output: W,
    mut on_prompt: impl FnMut(&str, &mut W) -> Result<()>,
) -> Result<()>
where
    R: BufRead,
    W: Write,
{
    let mut line = String::new();
    loop {
        write!(output, "{REPL_PROMPT}")?;
        output.flush()?;

        line.clear();
        if input.read_line(&mut line)? == 0 {
            writeln!(output)?;
            return Ok(());
        }

        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }

        if let Err(err) = on_prompt(prompt, &mut output) {
            error!("{err:#}");
            writeln!(output, "Generation failed: {err:#}")?;
        }
    }
}

fn run_with_event_progress(
    driver: &GenerationDriver,
    session: &GenerationSession,
    request: &GenerationRequest,
) -> Result<BatchReport> {
    let start = Instant::now();
    let mut tracker = ProgressTracker::new(request.sample_count);
    print_progress(&tracker.snapshot(), start.elapsed());

    let result = driver.run(session, request, |event| {
        if let Some(snapshot) = tracker.apply(&event) {
            print_progress(&snapshot, start.elapsed());
        }
    });
    eprintln!();
    Ok(result?)
}

async fn run_generate(config: AppConfig, args: GenerateArgs) -> Result<()> {
    let negative_prompt = args
        .negative_prompt
        .unwrap_or_else(|| config.generation.cli_negative_prompt.clone());
    let request = GenerationRequest::from_prompt(
        &args.prompt,
        &negative_prompt,
        args.samples.unwrap_or(config.generation.cli_sample_count),
        &config.generation,
    )?;
    let driver = connect_driver(&config).await?;

    let outputs = output_manager(&config);
    let slot = SessionSlot::new();
    let poller = ProgressPoller::from_config(&config.progress);
    let cancel = CancellationToken::new();
    let total = request.sample_count;

    let poll_task = {
        let slot = slot.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            poller
                .track(&slot, total, cancel, |snapshot| {
                    print_progress(&snapshot, start.elapsed())
                })
                .await
        })
    };

    let run_result = tokio::task::spawn_blocking(move || {
        let session = driver.open_session(&outputs, &slot, &request)?;
        info!(
            output_directory = %session.output_directory.display(),
            label = %session.label,
            "Generation session opened"
        );
        driver.run(&session, &request, |_| {})
    })
    .await
    .context("generation task failed")?;

    cancel.cancel();
    let outcome = poll_task.await.context("progress poller task failed")?;
    eprintln!();

    let report = run_result?;
    if let PollOutcome::Complete { first_sample } = outcome {
        info!(path = %first_sample.display(), "First sample ready");
    }
    info!("{}", summarize(&report));
    Ok(())
}

async fn run_watch(config: AppConfig, args: WatchArgs) -> Result<()> {
    let session = GenerationSession::new(args.dir, args.label);
    let poller = ProgressPoller::from_config(&config.progress);
    let cancel = CancellationToken::new();

    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    let start = Instant::now();
    let outcome = poller
        .track_session(&session, args.samples, cancel, |snapshot| {
            print_progress(&snapshot, start.elapsed())
        })
        .await;
    eprintln!();

    match outcome {
        PollOutcome::Complete { first_sample } => {
            info!(path = %first_sample.display(), "All samples present");
        }
        PollOutcome::Cancelled | PollOutcome::SessionChanged => {
            info!("Stopped watching");
        }
    }
    Ok(())
}

fn summarize(report: &BatchReport) -> String {
    if report.is_success() {
        return format!("Generated {} of {} samples", report.completed.len(), report.total);
    }
    let failed: Vec<String> = report
        .failed
        .iter()
        .map(|failure| (failure.index + 1).to_string())
        .collect();
    format!(
        "Generated {} of {} samples (failed: {})",
        report.completed.len(),
        report.total,
        failed.join(", ")
    )
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn print_progress(snapshot: &ProgressSnapshot, elapsed: Duration) {
    eprint!("\r{}    ", format_progress_line(snapshot, elapsed));
}

fn format_progress_line(snapshot: &ProgressSnapshot, elapsed: Duration) -> String {
    let fraction = snapshot.fraction().clamp(0.0, 1.0);
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);

    let elapsed_secs = elapsed.as_secs_f64();
    let settled = snapshot.settled();
    let eta = match estimate_remaining_secs(settled, snapshot.total, elapsed_secs) {
        Some(remaining) if !snapshot.is_complete() => {
            format!(" | ETA: {}", format_duration(remaining))
        }
        _ => String::new(),
    };

    format!(
        "[{}] {:5.1}% | {} | Elapsed: {}{}",
        bar,
        fraction * 100.0,
        snapshot.status_text(),
        format_duration(elapsed_secs),
        eta,
    )
}

fn estimate_remaining_secs(settled: u32, total: u32, elapsed_secs: f64) -> Option<f64> {
    if settled == 0 || elapsed_secs <= 0.0 {
        return None;
    }
    let per_sample = elapsed_secs / settled as f64;
    Some(per_sample * total.saturating_sub(settled) as f64)
}

#[cfg(test)]
mod duration_tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(6595.0), "01:49:55");
        assert_eq!(format_duration(45.0), "00:00:45");
        assert_eq!(format_duration(3600.0), "01:00:00");
        assert_eq!(format_duration(0.0), "00:00:00");
        assert_eq!(format_duration(86400.0), "24:00:00");
    }
}


#[cfg(test)]
mod repl_tests {
    use super::*;
    use anyhow::bail;
    use std::io::Cursor;

    #[test]
    fn reads_prompts_until_eof_and_skips_blank_lines() {
        let input = Cursor::new("a cat walking\n\n  \na dog running\n");
        let mut output = Vec::new();
        let mut seen = Vec::new();

        run_repl(input, &mut output, |prompt, _| {
            seen.push(prompt.to_string());
            Ok(())
        })
        .unwrap();

        assert_eq!(seen, vec!["a cat walking", "a dog running"]);
        let text = String::from_utf8(output).unwrap();
        assert_eq!(text.matches(REPL_PROMPT).count(), 5);
    }

    #[test]
    fn failed_prompt_does_not_end_loop() {
        let input = Cursor::new("boom\nfine\n");
        let mut output = Vec::new();
        let mut handled = 0;

        run_repl(input, &mut output, |prompt, _| {
            handled += 1;
            if prompt == "boom" {
                bail!("service rejected prompt");
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(handled, 2);
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("Generation failed: service rejected prompt"));
    }

    #[test]
    fn summary_lists_failed_samples_one_based() {
        use motionreel_core::driver::SampleFailure;

        let report = BatchReport {
            total: 3,
            completed: vec![0, 2],
            failed: vec![SampleFailure {
                index: 1,
                error: "out of memory".to_string(),
            }],
        };
        assert_eq!(summarize(&report), "Generated 2 of 3 samples (failed: 2)");

        let ok = BatchReport {
            total: 2,
            completed: vec![0, 1],
            failed: Vec::new(),
        };
        assert_eq!(summarize(&ok), "Generated 2 of 2 samples");
    }
}
