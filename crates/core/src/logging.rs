//! Log filter selection, the rolling log file and crash reports.
//!
//! Console and file share one user-chosen level. When the level was not
//! chosen explicitly, HTTP client chatter is quieted on both sinks and
//! ffmpeg's stderr (target [`ENCODER_STDERR_TARGET`]) is kept only in the
//! file, where it is useful for diagnosing failed encodes.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fmt::Write as _,
    fs,
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";
pub const LOG_FILE_PREFIX: &str = "motionreel";
pub const LOG_RETENTION_FILES: usize = 14;

/// Target the encoder uses for ffmpeg's stderr lines.
pub const ENCODER_STDERR_TARGET: &str = "ffmpeg_encode_stderr";

/// HTTP client crates that log every connection at debug.
const HTTP_CLIENT_TARGETS: &[&str] = &["reqwest", "hyper", "hyper_util"];

static CRASH_HOOK_LOCK: Mutex<()> = Mutex::new(());
static CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static WRITING_CRASH_REPORT: AtomicBool = AtomicBool::new(false);
static CRASH_REPORT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeLogMode {
    Cli,
    Server,
}

impl RuntimeLogMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Server => "server",
        }
    }
}

/// What the user asked for on the command line and in the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings {
    pub verbose: u8,
    pub log_filter: Option<String>,
    pub rust_log: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkFilters {
    pub console: String,
    pub file: String,
}

impl LogSettings {
    pub fn from_env(verbose: u8, log_filter: Option<&str>) -> Self {
        Self {
            verbose,
            log_filter: log_filter.map(ToString::to_string),
            rust_log: std::env::var("RUST_LOG").ok(),
        }
    }

    /// `--log-filter` and `-v`/`-vv` are taken verbatim for both sinks.
    /// Otherwise `RUST_LOG` (or `info`) gets the quiet defaults in front.
    pub fn filters(&self) -> SinkFilters {
        let explicit = match (self.log_filter.as_deref(), self.verbose) {
            (Some(filter), _) => Some(filter.to_string()),
            (None, 0) => None,
            (None, 1) => Some("debug".to_string()),
            (None, _) => Some("trace".to_string()),
        };

        if let Some(filter) = explicit {
            return SinkFilters {
                console: filter.clone(),
                file: filter,
            };
        }

        let level = self
            .rust_log
            .as_deref()
            .map(str::trim)
            .filter(|filter| !filter.is_empty())
            .unwrap_or(DEFAULT_LOG_FILTER);

        SinkFilters {
            console: quiet_defaults("error", level),
            file: quiet_defaults("debug", level),
        }
    }
}

fn quiet_defaults(encoder_level: &str, level: &str) -> String {
    let mut directives: Vec<String> = HTTP_CLIENT_TARGETS
        .iter()
        .map(|target| format!("{target}=warn"))
        .collect();
    directives.push(format!("{ENCODER_STDERR_TARGET}={encoder_level}"));
    directives.push(level.to_string());
    directives.join(",")
}

/// Daily rolling `motionreel.*.log` files under `<data_dir>/logs`.
pub fn rolling_log_file(data_dir: &Path) -> Result<RollingFileAppender> {
    let log_dir = data_dir.join(LOG_DIR_NAME);
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(LOG_RETENTION_FILES)
        .build(&log_dir)
        .with_context(|| format!("failed to open rolling log file in {}", log_dir.display()))
}

/// Write a crash report to `<data_dir>/logs/crash` on every panic, then run
/// the previously installed hook. Installing twice keeps the first
/// directory and returns it.
pub fn install_crash_hook(data_dir: &Path) -> Result<PathBuf> {
    let _guard = CRASH_HOOK_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(existing) = CRASH_DIR.get() {
        return Ok(existing.clone());
    }

    let crash_dir = data_dir.join(LOG_DIR_NAME).join(CRASH_DIR_NAME);
    fs::create_dir_all(&crash_dir)
        .with_context(|| format!("failed to create crash directory {}", crash_dir.display()))?;

    let previous_hook = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |info| {
        record_crash(&hook_dir, info);
        previous_hook(info);
    }));

    let _ = CRASH_DIR.set(crash_dir.clone());
    Ok(crash_dir)
}

fn record_crash(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic while writing the report must not recurse into another report.
    if WRITING_CRASH_REPORT
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let written = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        write_crash_report(crash_dir, &crash_report(info))
    }));
    match written {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: could not write crash report under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: crash report writer panicked under '{}'",
            crash_dir.display()
        ),
    }

    WRITING_CRASH_REPORT.store(false, Ordering::Release);
}

fn crash_report(info: &PanicHookInfo<'_>) -> String {
    let location = info
        .location()
        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
        .unwrap_or_else(|| "<unknown>".to_string());
    let backtrace = Backtrace::capture();
    let backtrace_status = match backtrace.status() {
        BacktraceStatus::Captured => "captured",
        BacktraceStatus::Disabled => "disabled (set RUST_BACKTRACE=1 to capture)",
        _ => "unsupported",
    };

    format_crash_report(
        chrono::Utc::now(),
        thread::current().name().unwrap_or("<unnamed>"),
        &location,
        &panic_message(info.payload()),
        backtrace_status,
        &backtrace.to_string(),
    )
}

fn format_crash_report(
    time: chrono::DateTime<chrono::Utc>,
    thread_name: &str,
    location: &str,
    message: &str,
    backtrace_status: &str,
    backtrace: &str,
) -> String {
    let mut report = String::new();
    let _ = writeln!(report, "time_utc={}", time.to_rfc3339());
    let _ = writeln!(report, "thread={thread_name}");
    let _ = writeln!(report, "location={location}");
    let _ = writeln!(report, "message={message}");
    let _ = writeln!(report, "backtrace_status={backtrace_status}");
    let _ = writeln!(report);
    let _ = writeln!(report, "{backtrace}");
    report
}

fn write_crash_report(crash_dir: &Path, report: &str) -> std::io::Result<PathBuf> {
    fs::create_dir_all(crash_dir)?;
    let sequence = CRASH_REPORT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let path = crash_dir.join(format!(
        "crash-{}-{sequence:04}.log",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f")
    ));
    fs::write(&path, report)?;
    Ok(path)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}
