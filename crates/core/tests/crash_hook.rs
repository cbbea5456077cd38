use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
    thread,
};

use motionreel_core::config::{FailurePolicy, SamplerConfig};
use motionreel_core::driver::{GenerationDriver, SampleEvent};
use motionreel_core::encode::SampleEncoder;
use motionreel_core::error::ServiceError;
use motionreel_core::logging::{install_crash_hook, CRASH_DIR_NAME, LOG_DIR_NAME};
use motionreel_core::request::{GenerationRequest, SamplerSwitches};
use motionreel_core::service::{
    FrameBatch, GenerationService, PipelineSetup, SampleContext, ServiceCapabilities,
};
use motionreel_core::session::GenerationSession;
use tempfile::tempdir;

const WORKER_THREAD_NAME: &str = "generation-worker";

struct BlankService;

impl GenerationService for BlankService {
    fn capabilities(&self) -> Result<ServiceCapabilities, ServiceError> {
        Ok(ServiceCapabilities {
            device: "fake".to_string(),
            memory_efficient_attention: true,
        })
    }

    fn prepare(&self, _setup: &PipelineSetup) -> Result<(), ServiceError> {
        Ok(())
    }

    fn generate(
        &self,
        request: &GenerationRequest,
        _sample: &SampleContext,
    ) -> Result<FrameBatch, ServiceError> {
        FrameBatch::from_packed(
            request.width,
            request.height,
            request.frame_count,
            vec![0; request.frame_bytes() * request.frame_count as usize],
        )
    }
}

struct TouchEncoder;

impl SampleEncoder for TouchEncoder {
    fn encode(&self, _frames: &FrameBatch, output: &Path) -> anyhow::Result<()> {
        fs::write(output, b"mp4")?;
        Ok(())
    }
}

fn run_panic_child(mode: &str, data_dir: &Path) -> std::process::Output {
    Command::new(std::env::current_exe().expect("test executable path"))
        .arg("panic_hook_child_entrypoint")
        .arg("--exact")
        .arg("--nocapture")
        .env("MOTIONREEL_PANIC_CHILD_MODE", mode)
        .env("MOTIONREEL_PANIC_CHILD_DATA_DIR", data_dir)
        .output()
        .expect("run panic hook child")
}

fn collect_crash_artifacts(crash_dir: &Path) -> Vec<PathBuf> {
    let mut paths = fs::read_dir(crash_dir)
        .expect("read crash directory")
        .map(|entry| entry.expect("read crash directory entry").path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("log"))
        .collect::<Vec<_>>();
    paths.sort();
    paths
}

/// Run a two-sample batch on a named worker thread whose progress callback
/// panics once the first sample completes.
fn panic_in_generation_worker(data_dir: &Path, message: &'static str) {
    let session_dir = data_dir.join("session");
    fs::create_dir_all(&session_dir).expect("create session dir");

    let worker = thread::Builder::new()
        .name(WORKER_THREAD_NAME.to_string())
        .spawn(move || {
            let driver = GenerationDriver::new(
                Arc::new(BlankService),
                Arc::new(TouchEncoder),
                SamplerSwitches::from(&SamplerConfig::default()),
                FailurePolicy::Continue,
            );
            let request = GenerationRequest {
                prompt: "a cat walking".to_string(),
                negative_prompt: String::new(),
                sample_count: 2,
                width: 2,
                height: 2,
                frame_count: 1,
                step_count: 1,
                guidance_scale: 7.5,
            };
            let session = GenerationSession::new(session_dir, "a-cat-walking");
            let _ = driver.run(&session, &request, |event| {
                if matches!(event, SampleEvent::Completed { index: 0, .. }) {
                    panic!("{message}");
                }
            });
        })
        .expect("spawn generation worker");

    let _ = worker.join();
    panic!("{message}");
}

#[test]
fn panic_hook_child_entrypoint() {
    let Ok(mode) = std::env::var("MOTIONREEL_PANIC_CHILD_MODE") else {
        return;
    };

    let data_dir = PathBuf::from(
        std::env::var("MOTIONREEL_PANIC_CHILD_DATA_DIR")
            .expect("MOTIONREEL_PANIC_CHILD_DATA_DIR must be set"),
    );

    let crash_dir = install_crash_hook(&data_dir).expect("install crash hook");
    assert_eq!(crash_dir, data_dir.join(LOG_DIR_NAME).join(CRASH_DIR_NAME));
    let again = install_crash_hook(&data_dir.join("elsewhere")).expect("reinstall");
    assert_eq!(again, crash_dir);

    match mode.as_str() {
        "worker_panic" => {
            panic_in_generation_worker(&data_dir, "progress callback panicked after sample 1")
        }
        "unwritable_crash_dir" => {
            if crash_dir.exists() {
                fs::remove_dir_all(&crash_dir).expect("remove crash directory");
            }
            fs::write(&crash_dir, b"not-a-directory").expect("replace crash directory with file");
            panic!("panic with unwritable crash directory");
        }
        other => panic!("unknown panic hook child mode: {other}"),
    }
}

#[test]
fn worker_panic_writes_crash_file_naming_the_thread() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("worker_panic", data_dir.path());

    assert!(!output.status.success(), "child process should panic");

    let crash_dir = data_dir
        .path()
        .join(LOG_DIR_NAME)
        .join(CRASH_DIR_NAME);
    let crash_artifacts = collect_crash_artifacts(&crash_dir);
    assert!(!crash_artifacts.is_empty(), "expected crash artifact");

    let worker_artifact = crash_artifacts
        .iter()
        .map(|path| fs::read_to_string(path).expect("read crash artifact"))
        .find(|contents| contents.contains(&format!("thread={WORKER_THREAD_NAME}")))
        .expect("artifact from the generation worker");

    assert!(worker_artifact.contains("time_utc="));
    assert!(worker_artifact.contains("message=progress callback panicked after sample 1"));
    assert!(worker_artifact.contains("location="));
    assert!(worker_artifact.contains("backtrace_status="));

    // The first sample was finished before the panic.
    assert!(data_dir
        .path()
        .join("session")
        .join("0-a-cat-walking.mp4")
        .is_file());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("thread panicked while panicking"));
}

#[test]
fn unwritable_crash_dir_warns_and_does_not_repanic() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("unwritable_crash_dir", data_dir.path());

    assert!(!output.status.success(), "child process should panic");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("panic with unwritable crash directory"));
    assert!(stderr.contains("Warning: could not write crash report under"));
    assert!(!stderr.contains("thread panicked while panicking"));
}
