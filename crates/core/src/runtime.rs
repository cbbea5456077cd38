use std::env;
#[cfg(windows)]
use std::path::Path;
use std::path::PathBuf;
use std::process::Command as ProcessCommand;

use tracing::{info, warn};

use crate::error::GenerationError;
use crate::service::ServiceCapabilities;

fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("bin"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("bin"));
            }
        }
    }

    if let Ok(cwd) = env::current_dir() {
        if !dirs.contains(&cwd) {
            dirs.push(cwd.clone());
        }
        let cwd_bin = cwd.join("bin");
        if !dirs.contains(&cwd_bin) {
            dirs.push(cwd_bin);
        }
    }

    dirs
}

#[cfg(not(windows))]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    vec![binary.to_string()]
}

#[cfg(windows)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    if Path::new(binary).components().count() > 1 {
        return vec![binary.to_string()];
    }

    let lower = binary.to_ascii_lowercase();
    if lower.ends_with(".exe") || lower.ends_with(".cmd") || lower.ends_with(".bat") {
        return vec![binary.to_string()];
    }

    vec![
        format!("{binary}.exe"),
        format!("{binary}.cmd"),
        format!("{binary}.bat"),
        binary.to_string(),
    ]
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let names = candidate_binary_names(binary);
    for dir in dirs {
        for name in &names {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Resolve a helper binary: next to the executable, `bin/` dirs and the
/// working directory win over `PATH`.
pub fn command_for(binary: &str) -> ProcessCommand {
    if let Some(path) = resolve_binary(binary) {
        return ProcessCommand::new(path);
    }
    ProcessCommand::new(binary)
}

pub fn resolve_binary(binary: &str) -> Option<PathBuf> {
    find_binary_in_dirs(binary, &candidate_bin_dirs())
}

/// Decide whether the pipeline runs with memory-efficient attention.
///
/// Returns `Ok(true)` when the device supports it. When it does not, the
/// check fails if `require_memory_efficient_attention` is set, otherwise it
/// warns and returns `Ok(false)` so the service falls back to standard
/// attention.
pub fn check_capabilities(
    caps: &ServiceCapabilities,
    require_memory_efficient_attention: bool,
) -> Result<bool, GenerationError> {
    if caps.memory_efficient_attention {
        info!(device = %caps.device, "Memory-efficient attention available");
        return Ok(true);
    }

    if require_memory_efficient_attention {
        return Err(GenerationError::DeviceUnavailable(format!(
            "memory-efficient attention is not available on device '{}'",
            caps.device
        )));
    }

    warn!(
        device = %caps.device,
        "Memory-efficient attention unavailable, falling back to standard attention"
    );
    Ok(false)
}

/// Log where helper binaries resolve to, for diagnostics.
pub fn log_runtime_tool_status() {
    match resolve_binary("ffmpeg") {
        Some(path) => info!("ffmpeg: {}", path.display()),
        None => info!("ffmpeg: resolving from PATH"),
    }
}
