use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::config::{GenerationConfig, SamplerConfig};

/// One user submission. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub sample_count: u32,
    pub width: u32,
    pub height: u32,
    pub frame_count: u32,
    pub step_count: u32,
    pub guidance_scale: f32,
}

impl GenerationRequest {
    /// Build a request from what the user typed plus the configured sampling
    /// settings. The configured positive prompt is appended to the user text.
    pub fn from_prompt(
        user_prompt: &str,
        negative_prompt: &str,
        sample_count: u32,
        config: &GenerationConfig,
    ) -> Result<Self> {
        let user_prompt = user_prompt.trim();
        if user_prompt.is_empty() {
            bail!("prompt must not be empty");
        }
        if sample_count == 0 {
            bail!("sample count must be at least 1");
        }

        let suffix = config.general_positive_prompt.trim();
        let prompt = if suffix.is_empty() {
            user_prompt.to_string()
        } else {
            format!("{user_prompt}, {suffix}")
        };

        Ok(Self {
            prompt,
            negative_prompt: negative_prompt.to_string(),
            sample_count,
            width: config.width,
            height: config.height,
            frame_count: config.frame_count,
            step_count: config.step_count,
            guidance_scale: config.guidance_scale,
        })
    }

    /// Bytes of one packed RGB24 frame at the requested resolution.
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// Fixed internal switches forwarded on every sampling call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplerSwitches {
    pub num_iters: u32,
    pub use_fast_sampling: bool,
    pub save_intermediate: bool,
    pub use_fp16: bool,
}

impl From<&SamplerConfig> for SamplerSwitches {
    fn from(config: &SamplerConfig) -> Self {
        Self {
            num_iters: config.num_iters,
            use_fast_sampling: config.use_fast_sampling,
            save_intermediate: config.save_intermediate,
            use_fp16: config.use_fp16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_general_positive_prompt() {
        let config = GenerationConfig::default();
        let request =
            GenerationRequest::from_prompt("  a cat walking ", "ugly", 2, &config).unwrap();

        assert_eq!(
            request.prompt,
            "a cat walking, best quality, masterpiece, extremely detailed, highres, 8k"
        );
        assert_eq!(request.negative_prompt, "ugly");
        assert_eq!(request.sample_count, 2);
        assert_eq!((request.width, request.height), (512, 384));
        assert_eq!(request.frame_count, 16);
        assert_eq!(request.frame_bytes(), 512 * 384 * 3);
    }

    #[test]
    fn empty_positive_prompt_leaves_user_text_alone() {
        let config = GenerationConfig {
            general_positive_prompt: String::new(),
            ..GenerationConfig::default()
        };
        let request = GenerationRequest::from_prompt("a fox", "", 1, &config).unwrap();
        assert_eq!(request.prompt, "a fox");
    }

    #[test]
    fn rejects_blank_prompt_and_zero_samples() {
        let config = GenerationConfig::default();
        assert!(GenerationRequest::from_prompt("   ", "", 1, &config).is_err());
        assert!(GenerationRequest::from_prompt("a fox", "", 0, &config).is_err());
    }

    #[test]
    fn switches_mirror_sampler_config() {
        let switches = SamplerSwitches::from(&SamplerConfig::default());
        assert_eq!(switches.num_iters, 1);
        assert!(!switches.use_fast_sampling);
        assert!(!switches.save_intermediate);
        assert!(switches.use_fp16);
    }
}
