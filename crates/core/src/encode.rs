//! Sample encoding: packed RGB24 frames in, one mp4 file out.
//!
//! FFmpeg reads raw frames from a stdin pipe and writes to a hidden partial
//! file that is renamed into place once the encode succeeds, so the final
//! sample path only ever appears complete.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info};

use crate::config::EncoderConfig;
use crate::service::FrameBatch;

/// Turns a batch of frames into a video file at `output`.
pub trait SampleEncoder: Send + Sync {
    fn encode(&self, frames: &FrameBatch, output: &Path) -> Result<()>;
}

/// Where the encoder writes before the final rename.
pub fn partial_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    output.with_file_name(format!(".{name}.part"))
}

#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    config: EncoderConfig,
}

impl FfmpegEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }

    pub fn build_ffmpeg_args(&self, width: u32, height: u32, target: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-nostdin".into(),
            "-y".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-s".into(),
            format!("{width}x{height}"),
            "-r".into(),
            self.config.fps.to_string(),
            "-i".into(),
            "pipe:0".into(),
            "-c:v".into(),
            self.config.codec.clone(),
        ];

        if !self.config.codec.contains("nvenc") {
            args.extend(["-crf".into(), self.config.crf.to_string()]);
        }

        args.extend([
            "-pix_fmt".into(),
            self.config.pixel_format.clone(),
            "-movflags".into(),
            "+faststart".into(),
            "-f".into(),
            "mp4".into(),
            target.to_string_lossy().into_owned(),
        ]);

        args
    }

    /// Check that ffmpeg can be launched. Returns its version line.
    pub fn version() -> Result<String> {
        let output = crate::runtime::command_for("ffmpeg")
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .context("failed to launch ffmpeg, is it installed?")?;

        if !output.status.success() {
            bail!("ffmpeg -version exited with status {}", output.status);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
    }
}

impl SampleEncoder for FfmpegEncoder {
    fn encode(&self, frames: &FrameBatch, output: &Path) -> Result<()> {
        let partial = partial_path(output);
        let args = self.build_ffmpeg_args(frames.width(), frames.height(), &partial);

        let mut process = EncoderProcess::spawn(&args)?;
        let written = frames
            .frames()
            .try_for_each(|frame| process.write_frame(frame))
            .and_then(|()| process.finish());
        if let Err(err) = written {
            drop(process);
            let _ = fs::remove_file(&partial);
            return Err(err);
        }

        fs::rename(&partial, output).with_context(|| {
            format!(
                "failed to move encoded sample into place: {}",
                output.display()
            )
        })?;

        info!(
            path = %output.display(),
            frames = frames.frame_count(),
            "Sample encoded"
        );
        Ok(())
    }
}

/// FFmpeg encode subprocess. Drains stderr in a background thread, kills
/// FFmpeg on [`Drop`].
struct EncoderProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_thread: Option<JoinHandle<()>>,
}

impl EncoderProcess {
    fn spawn(args: &[String]) -> Result<Self> {
        debug!(
            cmd = %format!("ffmpeg {}", args.join(" ")),
            "launching FFmpeg encoder"
        );

        let mut child = crate::runtime::command_for("ffmpeg")
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg, is it installed?")?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stdin"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stderr"))?;

        let stderr_thread = thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                match line {
                    Ok(line) if !line.is_empty() => {
                        debug!(target: "ffmpeg_encode_stderr", "{}", line);
                    }
                    Err(e) => {
                        debug!(target: "ffmpeg_encode_stderr", "read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            child,
            stdin: Some(stdin),
            stderr_thread: Some(stderr_thread),
        })
    }

    fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("encoder stdin already closed"))?;

        stdin
            .write_all(data)
            .context("failed to write frame to ffmpeg stdin")
    }

    fn finish(&mut self) -> Result<()> {
        drop(self.stdin.take());

        let status = self.child.wait().context("failed to wait for ffmpeg")?;

        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }

        if !status.success() {
            bail!("ffmpeg encoder exited with status {}", status);
        }

        debug!("FFmpeg encoder finished successfully");
        Ok(())
    }
}

impl Drop for EncoderProcess {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder() -> FfmpegEncoder {
        FfmpegEncoder::new(EncoderConfig::default())
    }

    #[test]
    fn partial_path_is_hidden_sibling() {
        let output = Path::new("outputs/run/0-a-cat.mp4");
        assert_eq!(
            partial_path(output),
            PathBuf::from("outputs/run/.0-a-cat.mp4.part")
        );
    }

    #[test]
    fn ffmpeg_args_read_rgb24_from_stdin() {
        let args = encoder().build_ffmpeg_args(512, 384, Path::new("out/.x.part"));

        assert_eq!(args[0], "-nostdin");
        assert_eq!(args[1], "-y");
        let pix_idx = args.iter().position(|a| a == "-pix_fmt").unwrap();
        assert_eq!(args[pix_idx + 1], "rgb24");
        assert!(args.windows(2).any(|w| w[0] == "-s" && w[1] == "512x384"));
        assert!(args.windows(2).any(|w| w[0] == "-r" && w[1] == "8"));
        assert!(args.contains(&"pipe:0".to_string()));
    }

    #[test]
    fn ffmpeg_args_encode_mp4_with_faststart() {
        let args = encoder().build_ffmpeg_args(512, 384, Path::new("out/.x.part"));

        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "libx264"));
        assert!(args.windows(2).any(|w| w[0] == "-crf" && w[1] == "18"));
        assert!(args.windows(2).any(|w| w[0] == "-pix_fmt" && w[1] == "yuv420p"));
        assert!(args
            .windows(2)
            .any(|w| w[0] == "-movflags" && w[1] == "+faststart"));
        assert!(args.windows(2).any(|w| w[0] == "-f" && w[1] == "mp4"));
        assert_eq!(args.last().unwrap(), "out/.x.part");
    }

    #[test]
    fn nvenc_codec_skips_crf() {
        let config = EncoderConfig {
            codec: "h264_nvenc".to_string(),
            ..EncoderConfig::default()
        };
        let args = FfmpegEncoder::new(config).build_ffmpeg_args(64, 64, Path::new("o.part"));
        assert!(!args.contains(&"-crf".to_string()));
    }
}
