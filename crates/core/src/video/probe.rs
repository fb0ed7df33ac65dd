//! ffprobe metadata extraction.
//!
//! A clip is characterized once up front: primary video stream, pixel
//! dimensions, frame rate, and total frame count. The frame count comes
//! from the container's `nb_frames` tag when declared; containers that
//! omit it (MKV commonly does) get a second packet-counting probe.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, warn};

use crate::error::GradeError;

#[derive(serde::Deserialize, Debug)]
pub struct FfprobeOutput {
    streams: Vec<FfprobeStream>,
}

#[derive(serde::Deserialize, Debug)]
#[allow(dead_code)]
struct FfprobeStream {
    index: usize,
    codec_name: Option<String>,
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    nb_read_packets: Option<String>,
    #[serde(default)]
    disposition: HashMap<String, serde_json::Value>,
}

/// Metadata for the primary video stream of a clip.
#[derive(Debug, Clone)]
pub struct VideoInfo {
    pub stream_index: usize,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_count: usize,
}

impl VideoInfo {
    /// Frame rate as a rational string for FFmpeg args.
    pub fn fps_rational(&self) -> String {
        format!("{}/{}", (self.fps * 1000.0).round() as u64, 1000)
    }

    /// Index of the frame used for style analysis: the clip midpoint.
    pub fn midpoint_frame(&self) -> usize {
        self.frame_count / 2
    }
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() == 2 {
        let num: f64 = parts[0].parse().ok()?;
        let den: f64 = parts[1].parse().ok()?;
        if den > 0.0 {
            return Some(num / den);
        }
    }
    s.parse().ok()
}

fn disposition_flag(stream: &FfprobeStream, key: &str) -> bool {
    stream
        .disposition
        .get(key)
        .and_then(|value| {
            value
                .as_bool()
                .or_else(|| value.as_i64().map(|n| n != 0))
                .or_else(|| value.as_str().map(|s| s != "0"))
        })
        .unwrap_or(false)
}

/// Picks the real video stream, skipping attached pictures (cover art)
/// and preferring the default-flagged stream.
fn select_primary_video_stream(streams: &[FfprobeStream]) -> Option<&FfprobeStream> {
    streams
        .iter()
        .filter(|stream| stream.codec_type.as_deref() == Some("video"))
        .min_by_key(|stream| {
            let is_attached_picture = disposition_flag(stream, "attached_pic");
            let is_default = disposition_flag(stream, "default");
            (is_attached_picture, !is_default, stream.index)
        })
}

fn run_ffprobe(path: &Path, extra_args: &[&str]) -> Result<FfprobeOutput> {
    let output = crate::runtime::command_for("ffprobe")
        .args(["-v", "quiet", "-print_format", "json", "-show_streams"])
        .args(extra_args)
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe — is FFmpeg installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        ))
        .context(GradeError::Input(format!(
            "unreadable video file: {}",
            path.display()
        )));
    }

    parse_ffprobe_json(&output.stdout)
}

pub fn parse_ffprobe_json(json: &[u8]) -> Result<FfprobeOutput> {
    serde_json::from_slice(json).context("failed to parse ffprobe JSON")
}

/// Extracts the primary stream metadata from a probe result. The frame
/// count is taken from `nb_frames` when present (0 otherwise; callers
/// that need an exact count fall back to [`count_frames`]).
pub fn extract_video_info(probe: &FfprobeOutput) -> Result<VideoInfo> {
    let stream = select_primary_video_stream(&probe.streams)
        .ok_or_else(|| GradeError::Input("no video stream found".to_string()))
        .map_err(anyhow::Error::from)?;

    let width = stream
        .width
        .ok_or_else(|| anyhow!("video stream missing width"))?;
    let height = stream
        .height
        .ok_or_else(|| anyhow!("video stream missing height"))?;
    if width == 0 || height == 0 {
        bail!("video stream has degenerate dimensions {width}x{height}");
    }

    let fps_str = stream
        .r_frame_rate
        .as_deref()
        .or(stream.avg_frame_rate.as_deref())
        .unwrap_or("0/0");
    let fps = parse_frame_rate(fps_str).unwrap_or(0.0);
    if fps <= 0.0 {
        warn!("could not determine frame rate (got {fps_str}), defaulting to 30");
    }
    let fps = if fps <= 0.0 { 30.0 } else { fps };

    let frame_count = stream
        .nb_frames
        .as_deref()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(0);

    Ok(VideoInfo {
        stream_index: stream.index,
        width,
        height,
        fps,
        frame_count,
    })
}

/// Counts frames by scanning packets. Slow on long clips; only used when
/// the container does not declare `nb_frames`.
fn count_frames(path: &Path, stream_index: usize) -> Result<usize> {
    let select = format!("v:{stream_index}");
    let probe = run_ffprobe(
        path,
        &["-count_packets", "-select_streams", select.as_str()],
    )?;

    let count = probe
        .streams
        .first()
        .and_then(|s| s.nb_read_packets.as_deref())
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| anyhow!("packet count probe returned no usable count"))?;

    Ok(count)
}

/// Probes a clip and returns complete metadata including an exact frame
/// count. Fails with a caller-fault error when the file is missing,
/// unreadable, or carries no video stream.
pub fn probe_video(path: &Path) -> Result<VideoInfo> {
    if !path.exists() {
        return Err(
            GradeError::Input(format!("input file does not exist: {}", path.display())).into(),
        );
    }

    debug!(path = %path.display(), "running ffprobe");
    let probe = run_ffprobe(path, &[])?;
    let mut info = extract_video_info(&probe)?;

    if info.frame_count == 0 {
        debug!("container did not declare nb_frames, counting packets");
        info.frame_count = count_frames(path, info.stream_index).with_context(|| {
            format!("failed to determine frame count: {}", path.display())
        })?;
    }

    if info.frame_count == 0 {
        return Err(GradeError::Input(format!(
            "video contains no frames: {}",
            path.display()
        ))
        .into());
    }

    debug!(
        stream_index = info.stream_index,
        width = info.width,
        height = info.height,
        fps = info.fps,
        frames = info.frame_count,
        "video probed"
    );

    Ok(info)
}
