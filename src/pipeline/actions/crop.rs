//! Crop detection by sampling and majority vote.

use std::path::Path;

use encodeforge_common::{Error, Result};
use encodeforge_protocol::crop::{parse_cropdetect_output, sample_offsets};
use encodeforge_protocol::{consensus, CropRect};

use crate::config::CropConfig;
use crate::pipeline::{Reporter, ToolCommand};
use crate::probe::SourceInfo;

/// One cropdetect pass over `seconds` of video starting at `offset`.
pub fn cropdetect_command(ffmpeg: &Path, source: &Path, offset: f64, seconds: f64) -> ToolCommand {
    let mut cmd = ToolCommand::new(ffmpeg);
    cmd.args(["-hide_banner", "-nostdin", "-ss"])
        .arg(format!("{offset:.3}"))
        .arg("-i")
        .path_arg(source)
        .arg("-t")
        .arg(format!("{seconds:.3}"))
        .args(["-map", "0:v:0", "-vf", "cropdetect=24:16:0", "-an", "-sn", "-f", "null", "-"]);
    cmd
}

/// Sample the source and vote. `None` means encode at the original size.
///
/// # Errors
///
/// Fails when the source duration is unknown; individual samples that fail
/// only lose their vote.
pub async fn detect_crop(
    ffmpeg: &Path,
    source: &Path,
    info: &SourceInfo,
    config: &CropConfig,
    reporter: &Reporter,
) -> Result<Option<CropRect>> {
    let duration = info
        .duration
        .ok_or_else(|| Error::pipeline("crop_detect", "could not determine duration"))?;

    let offsets = sample_offsets(duration, config.samples);
    reporter.status(format!("Detecting crop from {} samples", offsets.len()));

    let mut votes = Vec::with_capacity(offsets.len());
    for (i, offset) in offsets.iter().enumerate() {
        let result = cropdetect_command(ffmpeg, source, *offset, config.sample_seconds)
            .execute()
            .await;
        match result {
            Ok(output) => match parse_cropdetect_output(&output.stderr) {
                Some(rect) => {
                    tracing::debug!(sample = i + 1, offset, crop = %rect, "Crop sample");
                    votes.push(rect);
                }
                None => tracing::debug!(sample = i + 1, offset, "Crop sample found nothing"),
            },
            Err(e) => tracing::warn!(sample = i + 1, offset, error = %e, "Crop sample failed"),
        }
    }

    let Some(winner) = consensus(&votes, config.min_agreement) else {
        reporter.status(format!(
            "No crop reached {} of {} votes, keeping original resolution",
            config.min_agreement,
            votes.len()
        ));
        return Ok(None);
    };

    if winner.is_full_frame(info.width, info.height) {
        reporter.status("No crop needed");
        return Ok(None);
    }

    reporter.status(format!("Crop detected: {}", winner.filter()));
    Ok(Some(winner))
}
