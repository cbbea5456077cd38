//! Sequential sample generation for one session.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{AppConfig, FailurePolicy};
use crate::encode::SampleEncoder;
use crate::error::GenerationError;
use crate::request::{GenerationRequest, SamplerSwitches};
use crate::runtime::check_capabilities;
use crate::service::{GenerationService, PipelineSetup, SampleContext};
use crate::session::{GenerationSession, OutputManager, SessionSlot};

/// Per-sample notification emitted while a batch runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SampleEvent {
    Started {
        index: u32,
        total: u32,
    },
    Completed {
        index: u32,
        total: u32,
        path: PathBuf,
    },
    Failed {
        index: u32,
        total: u32,
        error: String,
    },
}

/// A sample the batch skipped. `error` is the rendered
/// [`GenerationError::Service`] so reports stay serializable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleFailure {
    pub index: u32,
    pub error: String,
}

impl From<GenerationError> for SampleFailure {
    fn from(error: GenerationError) -> Self {
        Self {
            index: error.sample_index().unwrap_or_default(),
            error: error.to_string(),
        }
    }
}

/// Outcome of a batch that ran to the end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub total: u32,
    pub completed: Vec<u32>,
    pub failed: Vec<SampleFailure>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Query the service, apply the attention policy and load the pipeline.
///
/// Returns whether memory-efficient attention is in use.
pub fn prepare_pipeline(
    service: &dyn GenerationService,
    config: &AppConfig,
) -> Result<bool, GenerationError> {
    let caps = service.capabilities().map_err(|err| {
        GenerationError::DeviceUnavailable(format!("generation service is unreachable: {err}"))
    })?;
    let use_mea = check_capabilities(&caps, config.service.require_memory_efficient_attention)?;

    let setup = PipelineSetup::from_config(config, use_mea);
    service.prepare(&setup).map_err(|err| {
        GenerationError::DeviceUnavailable(format!("failed to prepare pipeline: {err}"))
    })?;

    info!(
        device = %caps.device,
        memory_efficient_attention = use_mea,
        seed = setup.seed,
        "Generation pipeline ready"
    );
    Ok(use_mea)
}

/// Drives the generation service one sample at a time.
#[derive(Clone)]
pub struct GenerationDriver {
    service: Arc<dyn GenerationService>,
    encoder: Arc<dyn SampleEncoder>,
    switches: SamplerSwitches,
    policy: FailurePolicy,
}

impl GenerationDriver {
    pub fn new(
        service: Arc<dyn GenerationService>,
        encoder: Arc<dyn SampleEncoder>,
        switches: SamplerSwitches,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            service,
            encoder,
            switches,
            policy,
        }
    }

    pub fn from_config(
        service: Arc<dyn GenerationService>,
        encoder: Arc<dyn SampleEncoder>,
        config: &AppConfig,
    ) -> Self {
        Self::new(
            service,
            encoder,
            SamplerSwitches::from(&config.sampler),
            config.generation.on_sample_failure,
        )
    }

    /// Allocate a directory for `request` and make it the current session.
    pub fn open_session(
        &self,
        outputs: &OutputManager,
        slot: &SessionSlot,
        request: &GenerationRequest,
    ) -> Result<GenerationSession, GenerationError> {
        let session = outputs.allocate(&request.prompt, Local::now().naive_local())?;
        slot.replace(session.clone());
        Ok(session)
    }

    /// Generate samples `0..request.sample_count` in order.
    ///
    /// A service failure on one sample is reported through `on_event` and,
    /// under [`FailurePolicy::Continue`], the batch moves on. Filesystem and
    /// encoder failures always end the batch.
    pub fn run(
        &self,
        session: &GenerationSession,
        request: &GenerationRequest,
        mut on_event: impl FnMut(SampleEvent),
    ) -> Result<BatchReport, GenerationError> {
        let total = request.sample_count;
        fs::metadata(&session.output_directory)
            .map_err(|source| GenerationError::filesystem(&session.output_directory, source))?;

        info!(
            output_directory = %session.output_directory.display(),
            samples = total,
            "Starting generation batch"
        );

        let batch_start = Instant::now();
        let mut report = BatchReport {
            total,
            ..BatchReport::default()
        };

        for index in 0..total {
            on_event(SampleEvent::Started { index, total });
            let sample_start = Instant::now();

            let sample = SampleContext {
                index,
                switches: self.switches.clone(),
                save_dir: session.intermediate_dir(),
                save_name: session.intermediate_save_name(),
            };

            let frames = match self.service.generate(request, &sample) {
                Ok(frames) => frames,
                Err(err) => {
                    warn!(index, error = %err, "Sample generation failed");
                    on_event(SampleEvent::Failed {
                        index,
                        total,
                        error: err.to_string(),
                    });
                    match self.policy {
                        FailurePolicy::Continue => {
                            report.failed.push(SampleFailure::from(
                                GenerationError::Service { index, source: err },
                            ));
                            continue;
                        }
                        FailurePolicy::Abort => {
                            return Err(GenerationError::Aborted { index, source: err });
                        }
                    }
                }
            };

            let path = session.sample_path(index);
            if let Err(err) = self.encoder.encode(&frames, &path) {
                let error = GenerationError::Encode {
                    path: path.clone(),
                    message: format!("{err:#}"),
                };
                on_event(SampleEvent::Failed {
                    index,
                    total,
                    error: error.to_string(),
                });
                return Err(error);
            }

            info!(
                index,
                path = %path.display(),
                elapsed_ms = sample_start.elapsed().as_millis() as u64,
                "Sample complete"
            );
            report.completed.push(index);
            on_event(SampleEvent::Completed { index, total, path });
        }

        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            elapsed_ms = batch_start.elapsed().as_millis() as u64,
            "Generation batch finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenerationConfig;
    use crate::error::ServiceError;
    use crate::service::{FrameBatch, ServiceCapabilities};
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct FakeService {
        fail_on: Vec<u32>,
        calls: Mutex<Vec<u32>>,
        memory_efficient_attention: bool,
        prepared: Mutex<Option<PipelineSetup>>,
    }

    impl FakeService {
        fn new(fail_on: Vec<u32>) -> Self {
            Self {
                fail_on,
                calls: Mutex::new(Vec::new()),
                memory_efficient_attention: true,
                prepared: Mutex::new(None),
            }
        }
    }

    impl GenerationService for FakeService {
        fn capabilities(&self) -> Result<ServiceCapabilities, ServiceError> {
            Ok(ServiceCapabilities {
                device: "fake".to_string(),
                memory_efficient_attention: self.memory_efficient_attention,
            })
        }

        fn prepare(&self, setup: &PipelineSetup) -> Result<(), ServiceError> {
            *self.prepared.lock().unwrap() = Some(setup.clone());
            Ok(())
        }

        fn generate(
            &self,
            request: &GenerationRequest,
            sample: &SampleContext,
        ) -> Result<FrameBatch, ServiceError> {
            self.calls.lock().unwrap().push(sample.index);
            if self.fail_on.contains(&sample.index) {
                return Err(ServiceError::Rejected("CUDA out of memory".to_string()));
            }
            FrameBatch::from_packed(
                request.width,
                request.height,
                request.frame_count,
                vec![sample.index as u8; request.frame_bytes() * request.frame_count as usize],
            )
        }
    }

    struct FileEncoder;

    impl SampleEncoder for FileEncoder {
        fn encode(&self, frames: &FrameBatch, output: &Path) -> anyhow::Result<()> {
            fs::write(output, frames.frames().next().unwrap_or_default())?;
            Ok(())
        }
    }

    struct BrokenEncoder;

    impl SampleEncoder for BrokenEncoder {
        fn encode(&self, _frames: &FrameBatch, _output: &Path) -> anyhow::Result<()> {
            anyhow::bail!("ffmpeg encoder exited with status 1")
        }
    }

    fn request(samples: u32) -> GenerationRequest {
        let config = GenerationConfig {
            width: 4,
            height: 2,
            frame_count: 2,
            ..GenerationConfig::default()
        };
        GenerationRequest::from_prompt("a cat walking", "", samples, &config).unwrap()
    }

    fn driver(
        service: Arc<FakeService>,
        encoder: Arc<dyn SampleEncoder>,
        policy: FailurePolicy,
    ) -> GenerationDriver {
        GenerationDriver::new(
            service,
            encoder,
            SamplerSwitches::from(&crate::config::SamplerConfig::default()),
            policy,
        )
    }

    fn session_in(root: &Path) -> GenerationSession {
        let manager = OutputManager::new(root, "AnimateDiff");
        manager
            .allocate("a cat walking", Local::now().naive_local())
            .unwrap()
    }

    #[test]
    fn generates_samples_in_order() {
        let root = tempdir().unwrap();
        let session = session_in(root.path());
        let service = Arc::new(FakeService::new(vec![]));
        let driver = driver(service.clone(), Arc::new(FileEncoder), FailurePolicy::Continue);

        let mut events = Vec::new();
        let report = driver
            .run(&session, &request(3), |event| events.push(event))
            .unwrap();

        assert_eq!(*service.calls.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(report.completed, vec![0, 1, 2]);
        assert!(report.is_success());
        for index in 0..3 {
            assert!(session.sample_path(index).is_file());
        }
        assert_eq!(events.len(), 6);
        assert_eq!(events[0], SampleEvent::Started { index: 0, total: 3 });
        assert_eq!(
            events[1],
            SampleEvent::Completed {
                index: 0,
                total: 3,
                path: session.sample_path(0)
            }
        );
    }

    #[test]
    fn continue_policy_skips_failed_sample() {
        let root = tempdir().unwrap();
        let session = session_in(root.path());
        let service = Arc::new(FakeService::new(vec![1]));
        let driver = driver(service.clone(), Arc::new(FileEncoder), FailurePolicy::Continue);

        let mut events = Vec::new();
        let report = driver
            .run(&session, &request(3), |event| events.push(event))
            .unwrap();

        assert_eq!(report.completed, vec![0, 2]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].index, 1);
        assert!(report.failed[0]
            .error
            .starts_with("generation service failed on sample 1:"));
        assert!(report.failed[0].error.contains("CUDA out of memory"));
        assert!(!session.sample_path(1).exists());
        assert!(session.sample_path(2).is_file());
        assert!(events
            .iter()
            .any(|event| matches!(event, SampleEvent::Failed { index: 1, .. })));
    }

    #[test]
    fn abort_policy_stops_at_failed_sample() {
        let root = tempdir().unwrap();
        let session = session_in(root.path());
        let service = Arc::new(FakeService::new(vec![1]));
        let driver = driver(service.clone(), Arc::new(FileEncoder), FailurePolicy::Abort);

        let err = driver.run(&session, &request(3), |_| {}).unwrap_err();

        assert!(matches!(err, GenerationError::Aborted { index: 1, .. }));
        assert_eq!(*service.calls.lock().unwrap(), vec![0, 1]);
        assert!(session.sample_path(0).is_file());
        assert!(!session.sample_path(2).exists());
    }

    #[test]
    fn encoder_failure_is_fatal() {
        let root = tempdir().unwrap();
        let session = session_in(root.path());
        let service = Arc::new(FakeService::new(vec![]));
        let driver = driver(service.clone(), Arc::new(BrokenEncoder), FailurePolicy::Continue);

        let err = driver.run(&session, &request(2), |_| {}).unwrap_err();

        assert!(matches!(err, GenerationError::Encode { .. }));
        assert_eq!(err.sample_index(), None);
        assert_eq!(*service.calls.lock().unwrap(), vec![0]);
    }

    #[test]
    fn missing_output_directory_is_fatal() {
        let root = tempdir().unwrap();
        let session = GenerationSession::new(root.path().join("gone"), "a-cat");
        let service = Arc::new(FakeService::new(vec![]));
        let driver = driver(service.clone(), Arc::new(FileEncoder), FailurePolicy::Continue);

        let err = driver.run(&session, &request(1), |_| {}).unwrap_err();
        assert!(matches!(err, GenerationError::Filesystem { .. }));
        assert!(service.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn open_session_publishes_to_slot() {
        let root = tempdir().unwrap();
        let service = Arc::new(FakeService::new(vec![]));
        let driver = driver(service, Arc::new(FileEncoder), FailurePolicy::Continue);
        let outputs = OutputManager::new(root.path(), "AnimateDiff");
        let slot = SessionSlot::new();

        let session = driver.open_session(&outputs, &slot, &request(1)).unwrap();

        assert_eq!(slot.current(), Some(session.clone()));
        assert!(session.label.starts_with("a-cat-walking,-best-quality"));
    }

    #[test]
    fn prepare_pipeline_respects_attention_requirement() {
        let mut service = FakeService::new(vec![]);
        service.memory_efficient_attention = false;
        let mut config = AppConfig::default();

        let err = prepare_pipeline(&service, &config).unwrap_err();
        assert!(matches!(err, GenerationError::DeviceUnavailable(_)));
        assert!(service.prepared.lock().unwrap().is_none());

        config.service.require_memory_efficient_attention = false;
        assert!(!prepare_pipeline(&service, &config).unwrap());
        let prepared = service.prepared.lock().unwrap().clone().unwrap();
        assert!(!prepared.use_memory_efficient_attention);
    }
}
