//! Client side of the external generation service.
//!
//! The service owns the diffusion model and the accelerator. This crate only
//! sends it a pipeline setup once, then one sampling call per sample, and
//! receives packed RGB24 frames back.

use std::path::PathBuf;

use anyhow::{Context, Result};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{AppConfig, FilterConfig, MotionModuleLora, ServiceConfig};
use crate::error::ServiceError;
use crate::request::{GenerationRequest, SamplerSwitches};

const BYTES_PER_PIXEL: usize = 3;
const ERROR_BODY_LIMIT: usize = 2048;

/// What the service reports about its device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCapabilities {
    pub device: String,
    pub memory_efficient_attention: bool,
}

/// One-time pipeline construction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSetup {
    pub pretrained_model_path: PathBuf,
    pub inference_config: PathBuf,
    pub motion_module: PathBuf,
    pub dreambooth_path: Option<PathBuf>,
    pub lora_model_path: Option<PathBuf>,
    pub lora_alpha: f32,
    pub motion_module_loras: Vec<MotionModuleLora>,
    pub filter: FilterConfig,
    pub seed: u64,
    pub device: String,
    pub use_memory_efficient_attention: bool,
}

impl PipelineSetup {
    pub fn from_config(config: &AppConfig, use_memory_efficient_attention: bool) -> Self {
        let model = &config.model;
        Self {
            pretrained_model_path: model.pretrained_model_path.clone(),
            inference_config: model.inference_config.clone(),
            motion_module: model.motion_module.clone(),
            dreambooth_path: model.dreambooth_path.clone(),
            lora_model_path: model.lora_model_path.clone(),
            lora_alpha: model.lora_alpha,
            motion_module_loras: model.motion_module_loras.clone(),
            filter: config.filter.clone(),
            seed: model.seed,
            device: config.service.device.clone(),
            use_memory_efficient_attention,
        }
    }
}

/// Per-sample parameters that are not part of the user request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleContext {
    pub index: u32,
    pub switches: SamplerSwitches,
    pub save_dir: PathBuf,
    pub save_name: String,
}

/// Frames of one generated sample, packed RGB24, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBatch {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl FrameBatch {
    /// Validate a packed buffer of `frame_count` frames.
    pub fn from_packed(
        width: u32,
        height: u32,
        frame_count: u32,
        data: Vec<u8>,
    ) -> Result<Self, ServiceError> {
        let frame_len = width as usize * height as usize * BYTES_PER_PIXEL;
        if frame_len == 0 {
            return Err(ServiceError::InvalidPayload(format!(
                "frame size {width}x{height} is empty"
            )));
        }
        let expected = frame_len * frame_count as usize;
        if data.len() != expected {
            return Err(ServiceError::InvalidPayload(format!(
                "expected {expected} bytes for {frame_count} frames of {width}x{height}, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }

    pub fn frame_count(&self) -> usize {
        self.data.len() / self.frame_len()
    }

    pub fn frames(&self) -> impl Iterator<Item = &[u8]> {
        self.data.chunks_exact(self.frame_len())
    }
}

/// The model-owning collaborator. Calls block; the caller serializes them.
pub trait GenerationService: Send + Sync {
    fn capabilities(&self) -> Result<ServiceCapabilities, ServiceError>;

    fn prepare(&self, setup: &PipelineSetup) -> Result<(), ServiceError>;

    fn generate(
        &self,
        request: &GenerationRequest,
        sample: &SampleContext,
    ) -> Result<FrameBatch, ServiceError>;
}

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    prompt: &'a str,
    negative_prompt: &'a str,
    num_inference_steps: u32,
    guidance_scale: f32,
    width: u32,
    height: u32,
    video_length: u32,
    num_iters: u32,
    use_fast_sampling: bool,
    save_intermediate: bool,
    save_dir: String,
    save_name: &'a str,
    use_fp16: bool,
}

#[derive(Debug, Deserialize)]
struct RejectionBody {
    error: String,
}

/// Blocking HTTP client for a generation service process.
pub struct HttpGenerationService {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpGenerationService {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let url = config.parsed_url()?;
        let mut builder = reqwest::blocking::Client::builder();
        // Sampling a batch can take minutes, so no timeout unless configured.
        builder = builder.timeout(config.request_timeout());
        let client = builder
            .build()
            .context("failed to build HTTP client for generation service")?;

        info!(url = %config.display_url(), "Using generation service");
        Ok(Self {
            client,
            base_url: url.as_str().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn ensure_success(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, ServiceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        Err(ServiceError::Api {
            status: status.as_u16(),
            body: truncate_body(body),
        })
    }
}

impl GenerationService for HttpGenerationService {
    fn capabilities(&self) -> Result<ServiceCapabilities, ServiceError> {
        let response = self.client.get(self.endpoint("health")).send()?;
        let response = Self::ensure_success(response)?;
        let bytes = response.bytes()?;
        serde_json::from_slice(&bytes)
            .map_err(|err| ServiceError::InvalidPayload(format!("health response: {err}")))
    }

    fn prepare(&self, setup: &PipelineSetup) -> Result<(), ServiceError> {
        debug!(
            motion_module = %setup.motion_module.display(),
            seed = setup.seed,
            "Sending pipeline setup"
        );
        let response = self
            .client
            .post(self.endpoint("pipeline"))
            .json(setup)
            .send()?;
        Self::ensure_success(response)?;
        Ok(())
    }

    fn generate(
        &self,
        request: &GenerationRequest,
        sample: &SampleContext,
    ) -> Result<FrameBatch, ServiceError> {
        let body = GenerateBody {
            prompt: &request.prompt,
            negative_prompt: &request.negative_prompt,
            num_inference_steps: request.step_count,
            guidance_scale: request.guidance_scale,
            width: request.width,
            height: request.height,
            video_length: request.frame_count,
            num_iters: sample.switches.num_iters,
            use_fast_sampling: sample.switches.use_fast_sampling,
            save_intermediate: sample.switches.save_intermediate,
            save_dir: sample.save_dir.to_string_lossy().into_owned(),
            save_name: &sample.save_name,
            use_fp16: sample.switches.use_fp16,
        };

        let response = self
            .client
            .post(self.endpoint("generate"))
            .json(&body)
            .send()?;
        let response = Self::ensure_success(response)?;

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/json"));
        let bytes = response.bytes()?;

        if is_json {
            return Err(match serde_json::from_slice::<RejectionBody>(&bytes) {
                Ok(rejection) => ServiceError::Rejected(rejection.error),
                Err(err) => ServiceError::InvalidPayload(format!("unexpected JSON body: {err}")),
            });
        }

        FrameBatch::from_packed(
            request.width,
            request.height,
            request.frame_count,
            bytes.to_vec(),
        )
    }
}

fn truncate_body(mut body: String) -> String {
    if body.len() > ERROR_BODY_LIMIT {
        let mut end = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
        body.push_str("...");
    }
    body
}
