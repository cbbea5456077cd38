//! Output directory allocation and the bookkeeping state of one batch.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::GenerationError;

pub const LABEL_TOKEN_LIMIT: usize = 10;
pub const LABEL_DELIMITER: char = '-';
pub const LABEL_MAX_BYTES: usize = 120;
pub const EMPTY_LABEL: &str = "untitled";
pub const SAMPLE_EXTENSION: &str = "mp4";
pub const DIR_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

const INTERMEDIATE_DIR: [&str; 2] = ["sample", "intermediate"];
const MAX_COLLISION_SUFFIX: u32 = 1000;

/// Derive a filesystem-safe label from prompt text.
///
/// Takes the first ten whitespace-separated tokens, removes characters that
/// are unsafe in file names and joins what is left with `-`. The result is a
/// pure function of the prompt.
pub fn sanitize_label(prompt: &str) -> String {
    let tokens: Vec<String> = prompt
        .split_whitespace()
        .take(LABEL_TOKEN_LIMIT)
        .map(|token| token.chars().filter(|ch| !is_path_unsafe(*ch)).collect::<String>())
        .filter(|token| !token.is_empty())
        .collect();

    let joined = tokens.join(&LABEL_DELIMITER.to_string());
    let trimmed = truncate_on_char_boundary(&joined, LABEL_MAX_BYTES);
    let trimmed = trimmed.trim_end_matches(LABEL_DELIMITER);

    if trimmed.is_empty() || trimmed.chars().all(|ch| ch == '.') {
        EMPTY_LABEL.to_string()
    } else {
        trimmed.to_string()
    }
}

fn is_path_unsafe(ch: char) -> bool {
    matches!(ch, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || ch.is_control()
}

fn truncate_on_char_boundary(value: &str, max_bytes: usize) -> &str {
    if value.len() <= max_bytes {
        return value;
    }
    let mut end = max_bytes;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Bookkeeping for one batch of samples generated from one prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationSession {
    pub output_directory: PathBuf,
    pub label: String,
}

impl GenerationSession {
    pub fn new(output_directory: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            output_directory: output_directory.into(),
            label: label.into(),
        }
    }

    pub fn sample_file_name(&self, index: u32) -> String {
        format!("{index}-{}.{SAMPLE_EXTENSION}", self.label)
    }

    /// `{output_directory}/{index}-{label}.mp4`, 0-based.
    pub fn sample_path(&self, index: u32) -> PathBuf {
        self.output_directory.join(self.sample_file_name(index))
    }

    /// Path for a 1-based sample number as shown to users.
    pub fn display_sample_path(&self, number: u32) -> Option<PathBuf> {
        number.checked_sub(1).map(|index| self.sample_path(index))
    }

    pub fn intermediate_dir(&self) -> PathBuf {
        INTERMEDIATE_DIR
            .iter()
            .fold(self.output_directory.clone(), |dir, part| dir.join(part))
    }

    /// Name the service uses for intermediate artifacts of a sample.
    pub fn intermediate_save_name(&self) -> String {
        format!("0-{}", self.label)
    }
}

/// Allocates timestamped output directories under a root.
#[derive(Debug, Clone)]
pub struct OutputManager {
    outputs_dir: PathBuf,
    tool_name: String,
    save_intermediate: bool,
}

impl OutputManager {
    pub fn new(outputs_dir: impl Into<PathBuf>, tool_name: impl Into<String>) -> Self {
        Self {
            outputs_dir: outputs_dir.into(),
            tool_name: tool_name.into(),
            save_intermediate: false,
        }
    }

    pub fn with_intermediate_dir(mut self, save_intermediate: bool) -> Self {
        self.save_intermediate = save_intermediate;
        self
    }

    pub fn outputs_dir(&self) -> &Path {
        &self.outputs_dir
    }

    pub fn directory_name(&self, now: NaiveDateTime) -> String {
        format!("{}_{}", self.tool_name, now.format(DIR_TIMESTAMP_FORMAT))
    }

    /// Create a fresh session directory for `prompt` at time `now`.
    ///
    /// The leaf directory is created exclusively; a second allocation in the
    /// same second gets a `-2`, `-3`, ... suffix instead of sharing a path.
    pub fn allocate(
        &self,
        prompt: &str,
        now: NaiveDateTime,
    ) -> Result<GenerationSession, GenerationError> {
        fs::create_dir_all(&self.outputs_dir)
            .map_err(|source| GenerationError::filesystem(&self.outputs_dir, source))?;

        let base_name = self.directory_name(now);
        let output_directory = self.create_unique_dir(&base_name)?;
        let session = GenerationSession::new(output_directory, sanitize_label(prompt));

        if self.save_intermediate {
            let intermediate = session.intermediate_dir();
            fs::create_dir_all(&intermediate)
                .map_err(|source| GenerationError::filesystem(&intermediate, source))?;
        }

        info!(
            output_directory = %session.output_directory.display(),
            label = %session.label,
            "Allocated generation session"
        );
        Ok(session)
    }

    fn create_unique_dir(&self, base_name: &str) -> Result<PathBuf, GenerationError> {
        for attempt in 1..=MAX_COLLISION_SUFFIX {
            let name = if attempt == 1 {
                base_name.to_string()
            } else {
                format!("{base_name}-{attempt}")
            };
            let candidate = self.outputs_dir.join(name);

            match fs::create_dir(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                    debug!(path = %candidate.display(), "Output directory taken, trying next suffix");
                }
                Err(source) => return Err(GenerationError::filesystem(candidate, source)),
            }
        }

        Err(GenerationError::filesystem(
            self.outputs_dir.join(base_name),
            std::io::Error::new(
                ErrorKind::AlreadyExists,
                format!("no free directory name after {MAX_COLLISION_SUFFIX} attempts"),
            ),
        ))
    }
}

/// Shared handle to the most recent session.
///
/// Readers get a snapshot; a reset clears the pointer but leaves any running
/// batch and its files alone.
#[derive(Debug, Clone, Default)]
pub struct SessionSlot {
    inner: Arc<RwLock<Option<GenerationSession>>>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: GenerationSession) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(session))),
        }
    }

    pub fn current(&self) -> Option<GenerationSession> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn replace(&self, session: GenerationSession) -> Option<GenerationSession> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(session)
    }

    pub fn reset(&self) {
        let previous = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if previous.is_some() {
            info!("Generation session reset");
        }
    }

    pub fn is_current(&self, session: &GenerationSession) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|current| current == session)
    }
}
