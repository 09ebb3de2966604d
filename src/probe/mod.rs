//! Source inspection with ffprobe and external tool discovery.

use crate::config::ToolsConfig;
use crate::pipeline::ToolCommand;
use encodeforge_common::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;

/// What the pipeline needs to know about a source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceInfo {
    /// Container duration in seconds.
    pub duration: Option<f64>,
    pub width: u32,
    pub height: u32,
    /// Average frame rate of the first video stream.
    pub frame_rate: Option<f64>,
    /// Frame count reported by the container, when it reports one.
    pub frame_count: Option<u64>,
    pub audio_streams: usize,
    pub subtitle_streams: usize,
}

impl SourceInfo {
    /// Frames to encode: the container's count, else duration × frame rate.
    pub fn total_frames(&self) -> Option<u64> {
        if let Some(count) = self.frame_count.filter(|&c| c > 0) {
            return Some(count);
        }
        let estimate = self.duration? * self.frame_rate?;
        (estimate.is_finite() && estimate >= 1.0).then(|| estimate.round() as u64)
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
}

/// Probe a source with ffprobe.
///
/// # Errors
///
/// - [`Error::Tool`] if ffprobe fails or prints something unparseable
/// - [`Error::Pipeline`] if the source has no video or no audio stream
pub async fn probe_source(ffprobe: &Path, source: &Path) -> Result<SourceInfo> {
    let output = ToolCommand::new(ffprobe)
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .path_arg(source)
        .execute()
        .await?;

    parse_ffprobe_json(&output.stdout)
}

/// Interpret `ffprobe -print_format json -show_format -show_streams` output.
pub fn parse_ffprobe_json(json: &str) -> Result<SourceInfo> {
    let output: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| Error::tool("ffprobe", format!("invalid JSON output: {e}")))?;

    let kind = |s: &FfprobeStream, k: &str| s.codec_type.as_deref() == Some(k);
    let video = output
        .streams
        .iter()
        .find(|s| kind(s, "video"))
        .ok_or_else(|| Error::pipeline("probe", "no video stream found"))?;
    let audio_streams = output.streams.iter().filter(|s| kind(s, "audio")).count();
    if audio_streams == 0 {
        return Err(Error::pipeline("probe", "no audio streams found"));
    }

    let duration = output
        .format
        .duration
        .as_deref()
        .and_then(parse_seconds)
        .or_else(|| video.duration.as_deref().and_then(parse_seconds));

    Ok(SourceInfo {
        duration,
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        frame_rate: video
            .avg_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .or_else(|| video.r_frame_rate.as_deref().and_then(parse_frame_rate)),
        frame_count: video.nb_frames.as_deref().and_then(|n| n.parse().ok()),
        audio_streams,
        subtitle_streams: output.streams.iter().filter(|s| kind(s, "subtitle")).count(),
    })
}

fn parse_seconds(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|d| d.is_finite() && *d > 0.0)
}

/// Parse a rational frame rate such as `24000/1001`.
fn parse_frame_rate(s: &str) -> Option<f64> {
    let rate = match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => s.parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

/// Information about an external tool.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub available: bool,
    /// First line of the version banner.
    pub version: Option<String>,
    pub path: Option<PathBuf>,
}

/// Resolve a tool: the configured path if set, else a PATH lookup, else the
/// bare name (so the spawn error names it).
pub fn tool_path(name: &str, configured: Option<&Path>) -> PathBuf {
    if let Some(path) = configured {
        return path.to_path_buf();
    }
    which::which(name).unwrap_or_else(|_| PathBuf::from(name))
}

/// Check if a tool runs, using `version_arg` to ask for its version.
pub fn check_tool_with_arg(name: &str, program: &Path, version_arg: &str) -> ToolInfo {
    match Command::new(program).arg(version_arg).output() {
        Ok(output) if output.status.success() => ToolInfo {
            name: name.to_string(),
            available: true,
            version: String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .map(|s| s.to_string()),
            path: which::which(program).ok(),
        },
        _ => ToolInfo {
            name: name.to_string(),
            available: false,
            version: None,
            path: None,
        },
    }
}

/// Check the tools the built-in pipeline depends on.
pub fn check_tools(tools: &ToolsConfig) -> Vec<ToolInfo> {
    [
        ("ffmpeg", tools.ffmpeg_path.as_deref()),
        ("ffprobe", tools.ffprobe_path.as_deref()),
    ]
    .into_iter()
    .map(|(name, configured)| check_tool_with_arg(name, &tool_path(name, configured), "-version"))
    .collect()
}
