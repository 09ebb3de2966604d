//! The SVT-AV1 encode.

use std::path::{Path, PathBuf};

use encodeforge_common::Result;
use encodeforge_protocol::CropRect;

use crate::pipeline::{Reporter, ToolCommand};
use crate::state::ConversionSettings;

/// Everything the encode needs once the measurements are in.
#[derive(Debug, Clone)]
pub struct EncodePlan<'a> {
    pub source: &'a Path,
    /// Hidden temp file the encode writes to.
    pub temp_output: PathBuf,
    pub settings: &'a ConversionSettings,
    pub crop: Option<CropRect>,
    /// Second-pass loudnorm filter.
    pub audio_filter: String,
    pub muxer: &'static str,
}

/// ffmpeg muxer for the output's extension. The temp file's `.tmp`
/// extension says nothing, so the muxer is always named explicitly.
pub fn muxer_for(output: &Path) -> &'static str {
    let ext = output
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" | "m4v" | "mov" => "mp4",
        "webm" => "webm",
        _ => "matroska",
    }
}

pub fn encode_command(ffmpeg: &Path, plan: &EncodePlan<'_>) -> ToolCommand {
    let mut cmd = ToolCommand::new(ffmpeg);
    cmd.args(["-hide_banner", "-nostdin", "-y", "-loglevel", "error", "-i"])
        .path_arg(plan.source)
        .args(["-map", "0:v:0", "-map", "0:a"]);
    if plan.muxer == "matroska" {
        cmd.args(["-map", "0:s?", "-c:s", "copy"]);
    }
    if let Some(crop) = &plan.crop {
        cmd.arg("-vf").arg(crop.filter());
    }
    cmd.args(["-c:v", "libsvtav1", "-crf"])
        .arg(plan.settings.crf.to_string())
        .arg("-preset")
        .arg(plan.settings.preset.to_string());
    if !plan.settings.svt_params.is_empty() {
        cmd.arg("-svtav1-params").arg(plan.settings.svt_params.clone());
    }
    cmd.args(["-c:a", "libopus", "-b:a"])
        .arg(plan.settings.audio_bitrate.clone())
        .arg("-af")
        .arg(plan.audio_filter.clone())
        .args(["-progress", "pipe:1", "-nostats", "-f", plan.muxer])
        .path_arg(&plan.temp_output);
    cmd
}

/// Run the encode, passing its `-progress` stream through unchanged.
pub async fn run_encode(mut cmd: ToolCommand, reporter: &Reporter) -> Result<()> {
    cmd.stream(|line| reporter.raw(line)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan<'a>(settings: &'a ConversionSettings, output: &str) -> EncodePlan<'a> {
        EncodePlan {
            source: Path::new("/v/a.mkv"),
            temp_output: PathBuf::from(format!("/v/.{output}.tmp")),
            settings,
            crop: None,
            audio_filter: "loudnorm=I=-16".into(),
            muxer: muxer_for(Path::new(output)),
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_muxer_for() {
        assert_eq!(muxer_for(Path::new("a_conv.mkv")), "matroska");
        assert_eq!(muxer_for(Path::new("a_conv.MP4")), "mp4");
        assert_eq!(muxer_for(Path::new("a_conv.webm")), "webm");
        assert_eq!(muxer_for(Path::new("a_conv")), "matroska");
    }

    #[test]
    fn test_encode_command_carries_settings() {
        let settings = ConversionSettings {
            crf: 30,
            preset: 6,
            ..ConversionSettings::default()
        };
        let cmd = encode_command(Path::new("ffmpeg"), &plan(&settings, "a_conv.mkv"));
        let args = cmd.get_args();

        assert_eq!(value_after(args, "-c:v"), Some("libsvtav1"));
        assert_eq!(value_after(args, "-crf"), Some("30"));
        assert_eq!(value_after(args, "-preset"), Some("6"));
        assert_eq!(value_after(args, "-svtav1-params"), Some("tune=0:film-grain=8"));
        assert_eq!(value_after(args, "-c:a"), Some("libopus"));
        assert_eq!(value_after(args, "-b:a"), Some("96k"));
        assert_eq!(value_after(args, "-af"), Some("loudnorm=I=-16"));
        assert_eq!(value_after(args, "-progress"), Some("pipe:1"));
        assert_eq!(value_after(args, "-f"), Some("matroska"));
        assert_eq!(args.last().map(String::as_str), Some("/v/.a_conv.mkv.tmp"));
        assert!(value_after(args, "-vf").is_none());
    }

    #[test]
    fn test_crop_and_mp4_output() {
        let settings = ConversionSettings::default();
        let mut plan = plan(&settings, "a_conv.mp4");
        plan.crop = Some("1920:800:0:140".parse().unwrap());
        let cmd = encode_command(Path::new("ffmpeg"), &plan);
        let args = cmd.get_args();

        assert_eq!(value_after(args, "-vf"), Some("crop=1920:800:0:140"));
        assert_eq!(value_after(args, "-f"), Some("mp4"));
        assert!(!args.iter().any(|a| a == "0:s?"));
    }
}
