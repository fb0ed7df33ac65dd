//! FFmpeg decode: sequential raw RGB streaming plus single-frame and
//! range random access.
//!
//! The bulk path is [`FrameStream`]: one FFmpeg subprocess for the whole
//! clip, frames pulled off its stdout pipe in decode order. Random
//! access (`read_frame`, `read_batch`) spawns a short-lived subprocess
//! with a `select` filter; fine for grabbing the analysis frame, too
//! slow to drive the main loop.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, warn};

use crate::error::GradeError;
use crate::types::RgbFrame;
use crate::video::probe::{probe_video, VideoInfo};

fn build_stream_args(path: &Path, stream_index: usize, filter: Option<&str>) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-nostdin".to_string(),
        "-i".to_string(),
        path.to_string_lossy().into_owned(),
        "-map".to_string(),
        format!("0:{stream_index}"),
    ];

    if let Some(expr) = filter {
        args.extend(["-vf".to_string(), expr.to_string()]);
        // select passes a sparse frame set; CFR resampling would refill the gaps
        args.extend(["-vsync".to_string(), "0".to_string()]);
    } else {
        args.extend(["-vsync".to_string(), "cfr".to_string()]);
    }

    args.extend([
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgb24".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "pipe:1".to_string(),
    ]);
    args
}

fn spawn_ffmpeg(args: &[String]) -> Result<(Child, thread::JoinHandle<()>)> {
    let mut child = crate::runtime::command_for("ffmpeg")
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to launch ffmpeg — is it installed?")?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("ffmpeg stderr not piped"))?;
    let stderr_thread = thread::spawn(move || {
        let reader = BufReader::new(stderr);
        for line in reader.lines() {
            match line {
                Ok(line) if !line.is_empty() => {
                    debug!(target: "ffmpeg_stderr", "{}", line);
                }
                Err(e) => {
                    debug!(target: "ffmpeg_stderr", "read error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    });

    Ok((child, stderr_thread))
}

/// Sequential frame iterator over one FFmpeg decode subprocess. Kills
/// FFmpeg on [`Drop`].
pub struct FrameStream {
    child: Child,
    width: u32,
    height: u32,
    frame_size: usize,
    _stderr_thread: Option<thread::JoinHandle<()>>,
    buf: Vec<u8>,
    done: bool,
}

impl FrameStream {
    fn new(path: &Path, info: &VideoInfo, filter: Option<&str>) -> Result<Self> {
        let frame_size = info.width as usize * info.height as usize * 3;
        let args = build_stream_args(path, info.stream_index, filter);
        let (child, stderr_thread) = spawn_ffmpeg(&args)?;

        Ok(Self {
            child,
            width: info.width,
            height: info.height,
            frame_size,
            _stderr_thread: Some(stderr_thread),
            buf: vec![0u8; frame_size],
            done: false,
        })
    }

    fn read_next(&mut self) -> Result<Option<RgbFrame>> {
        let stdout = self
            .child
            .stdout
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg stdout not available"))?;

        let mut total_read = 0;
        while total_read < self.frame_size {
            match stdout.read(&mut self.buf[total_read..self.frame_size]) {
                Ok(0) => {
                    if total_read == 0 {
                        return Ok(None);
                    }
                    warn!(
                        "partial frame at EOF ({total_read}/{} bytes), discarding",
                        self.frame_size
                    );
                    return Ok(None);
                }
                Ok(n) => {
                    total_read += n;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    continue;
                }
                Err(e) => {
                    return Err(e).context("failed to read frame from ffmpeg stdout");
                }
            }
        }

        RgbFrame::new(
            self.buf[..self.frame_size].to_vec(),
            self.width,
            self.height,
        )
        .map(Some)
    }
}

impl Iterator for FrameStream {
    type Item = Result<RgbFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_next() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self._stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Handle to a probed clip offering sequential and random access.
#[derive(Debug)]
pub struct VideoReader {
    path: PathBuf,
    info: VideoInfo,
}

impl VideoReader {
    /// Probes and opens a clip. Missing or undecodable files fail as
    /// caller faults.
    pub fn open(path: &Path) -> Result<Self> {
        let info = probe_video(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            info,
        })
    }

    pub fn info(&self) -> &VideoInfo {
        &self.info
    }

    /// Sequential decode of the whole clip, one subprocess end to end.
    pub fn stream(&self) -> Result<FrameStream> {
        FrameStream::new(&self.path, &self.info, None)
    }

    /// Decodes a single frame by index.
    pub fn read_frame(&self, index: usize) -> Result<RgbFrame> {
        if index >= self.info.frame_count {
            return Err(GradeError::Input(format!(
                "frame index {index} out of range (clip has {} frames)",
                self.info.frame_count
            ))
            .into());
        }

        let filter = format!("select=eq(n\\,{index})");
        let mut stream = FrameStream::new(&self.path, &self.info, Some(&filter))?;
        let frame = stream
            .next()
            .transpose()?
            .ok_or_else(|| anyhow!("ffmpeg produced no output for frame {index}"))?;
        Ok(frame)
    }

    /// Decodes a contiguous frame range `[start, end)` in index order.
    pub fn read_batch(&self, range: std::ops::Range<usize>) -> Result<Vec<RgbFrame>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        if range.end > self.info.frame_count {
            return Err(GradeError::Input(format!(
                "frame range {}..{} out of range (clip has {} frames)",
                range.start, range.end, self.info.frame_count
            ))
            .into());
        }

        let filter = format!(
            "select=between(n\\,{}\\,{})",
            range.start,
            range.end - 1
        );
        let expected = range.len();
        let stream = FrameStream::new(&self.path, &self.info, Some(&filter))?;
        let frames: Vec<RgbFrame> = stream.collect::<Result<_>>()?;
        if frames.len() != expected {
            bail!(
                "expected {expected} frames for range {}..{}, got {}",
                range.start,
                range.end,
                frames.len()
            );
        }
        Ok(frames)
    }
}

/// Decodes a still image to a single RGB frame. Used for reference
/// style images; failures are caller faults.
pub fn read_image(path: &Path) -> Result<RgbFrame> {
    if !path.exists() {
        return Err(
            GradeError::Input(format!("image file does not exist: {}", path.display())).into(),
        );
    }

    let output = crate::runtime::command_for("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-select_streams",
            "v:0",
        ])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe — is FFmpeg installed?")?;
    if !output.status.success() {
        return Err(GradeError::Input(format!(
            "unreadable image file: {}",
            path.display()
        ))
        .into());
    }

    let probe: serde_json::Value =
        serde_json::from_slice(&output.stdout).context("failed to parse ffprobe JSON")?;
    let stream = probe["streams"]
        .get(0)
        .ok_or_else(|| GradeError::Input(format!("no image stream: {}", path.display())))
        .map_err(anyhow::Error::from)?;
    let width = stream["width"]
        .as_u64()
        .ok_or_else(|| anyhow!("image stream missing width"))? as u32;
    let height = stream["height"]
        .as_u64()
        .ok_or_else(|| anyhow!("image stream missing height"))? as u32;

    let decoded = crate::runtime::command_for("ffmpeg")
        .args([
            "-nostdin",
            "-i",
            &path.to_string_lossy(),
            "-frames:v",
            "1",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgb24",
            "-v",
            "error",
            "pipe:1",
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to launch ffmpeg — is it installed?")?;
    if !decoded.status.success() {
        let stderr = String::from_utf8_lossy(&decoded.stderr);
        return Err(anyhow!(
            "ffmpeg exited with status {}: {}",
            decoded.status,
            stderr.trim()
        ))
        .context(GradeError::Input(format!(
            "failed to decode image: {}",
            path.display()
        )));
    }

    RgbFrame::new(decoded.stdout, width, height)
}
