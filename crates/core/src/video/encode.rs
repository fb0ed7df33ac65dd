//! FFmpeg encode: raw RGB frames in over stdin, H.264 out.
//!
//! Fixed codec settings (libx264, crf 18, yuv420p) so graded output is
//! broadly playable. Drains stderr in a background thread, kills FFmpeg
//! on [`Drop`].

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;

use crate::error::GradeError;
use crate::types::RgbFrame;

pub const OUTPUT_CODEC: &str = "libx264";
pub const OUTPUT_CRF: i64 = 18;
pub const OUTPUT_PIX_FMT: &str = "yuv420p";

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub output_path: PathBuf,
    pub width: u32,
    pub height: u32,
    /// Frame rate as rational string (e.g. "29970/1000").
    pub fps: String,
}

impl EncoderConfig {
    pub fn build_ffmpeg_args(&self) -> Vec<String> {
        vec![
            "-nostdin".into(),
            "-y".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-s".into(),
            format!("{}x{}", self.width, self.height),
            "-r".into(),
            self.fps.clone(),
            "-i".into(),
            "pipe:0".into(),
            "-c:v".into(),
            OUTPUT_CODEC.into(),
            "-crf".into(),
            OUTPUT_CRF.to_string(),
            "-pix_fmt".into(),
            OUTPUT_PIX_FMT.into(),
            "-v".into(),
            "error".into(),
            self.output_path.to_string_lossy().into_owned(),
        ]
    }

    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// FFmpeg encode subprocess fed one frame at a time.
pub struct VideoEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_thread: Option<JoinHandle<()>>,
    frame_size: usize,
    output_path: PathBuf,
}

impl VideoEncoder {
    pub fn new(config: &EncoderConfig) -> Result<Self> {
        let args = config.build_ffmpeg_args();
        let frame_size = config.frame_size();

        debug!(
            cmd = %format!("ffmpeg {}", args.join(" ")),
            "launching FFmpeg encoder"
        );

        let mut child = crate::runtime::command_for("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg — is it installed?")?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stdin"))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stderr not piped"))?;
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

        debug!(
            width = config.width,
            height = config.height,
            fps = %config.fps,
            "FFmpeg encoder started"
        );

        Ok(Self {
            child,
            stdin: Some(stdin),
            stderr_thread: Some(stderr_thread),
            frame_size,
            output_path: config.output_path.clone(),
        })
    }

    /// Frame dimensions must match the encoder configuration.
    pub fn write_frame(&mut self, frame: &RgbFrame) -> Result<()> {
        if frame.data.len() != self.frame_size {
            bail!(
                "frame size mismatch: expected {} bytes, got {}",
                self.frame_size,
                frame.data.len()
            );
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("encoder stdin already closed"))?;

        stdin
            .write_all(&frame.data)
            .context("failed to write frame to ffmpeg stdin")?;

        Ok(())
    }

    /// Closes stdin and waits for FFmpeg to finalize the container.
    pub fn finish(&mut self) -> Result<()> {
        drop(self.stdin.take());

        let status = self.child.wait().context("failed to wait for ffmpeg")?;

        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }

        if !status.success() {
            return Err(anyhow!("ffmpeg encoder exited with status {}", status)).context(
                GradeError::Encode(format!(
                    "failed to encode output: {}",
                    self.output_path.display()
                )),
            );
        }

        debug!(path = %self.output_path.display(), "FFmpeg encoder finished");
        Ok(())
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}
