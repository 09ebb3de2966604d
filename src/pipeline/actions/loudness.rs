//! First loudnorm pass.

use std::path::Path;

use encodeforge_common::{Error, Result};
use encodeforge_protocol::{LoudnormMeasurement, LoudnormTarget};

use crate::pipeline::ToolCommand;

/// Analysis-only pass over the first audio stream.
pub fn measurement_command(ffmpeg: &Path, source: &Path, target: &LoudnormTarget) -> ToolCommand {
    let mut cmd = ToolCommand::new(ffmpeg);
    cmd.args(["-hide_banner", "-nostdin", "-i"])
        .path_arg(source)
        .args(["-map", "0:a:0", "-af"])
        .arg(target.first_pass_filter())
        .args(["-vn", "-sn", "-f", "null", "-"]);
    cmd
}

/// Measure the source's loudness.
///
/// The report goes to a scratch file in `temp_dir` that is removed however
/// this returns, including when the future is dropped.
pub async fn measure_loudness(
    ffmpeg: &Path,
    source: &Path,
    target: &LoudnormTarget,
    temp_dir: &Path,
) -> Result<LoudnormMeasurement> {
    std::fs::create_dir_all(temp_dir)?;
    let scratch = tempfile::Builder::new()
        .prefix("loudnorm-")
        .suffix(".log")
        .tempfile_in(temp_dir)?;

    measurement_command(ffmpeg, source, target)
        .stderr_to(scratch.reopen()?)
        .execute()
        .await?;

    let report = std::fs::read_to_string(scratch.path())?;
    LoudnormMeasurement::parse(&report).map_err(|e| {
        Error::pipeline(
            "audio_measure",
            format!("failed to parse loudness measurement: {e}"),
        )
    })
}


#[cfg(all(test, unix))]
mod script_tests {
    use super::*;
    use crate::pipeline::executor::tests::fake_tool;
    use assert_matches::assert_matches;

    const REPORT: &str = r#"[Parsed_loudnorm_0 @ 0x1]
{
	"input_i" : "-23.54",
	"input_tp" : "-4.12",
	"input_lra" : "9.80",
	"input_thresh" : "-34.05",
	"output_i" : "-16.02",
	"output_tp" : "-1.50",
	"output_lra" : "7.60",
	"output_thresh" : "-26.41",
	"normalization_type" : "dynamic",
	"target_offset" : "0.02"
}"#;

    #[tokio::test]
    async fn test_measurement_is_parsed_and_scratch_removed() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = fake_tool(dir.path(), "ffmpeg", &format!("cat >&2 <<'JSON'\n{REPORT}\nJSON"));
        let temp = dir.path().join("work");

        let m = measure_loudness(&ffmpeg, Path::new("/v/a.mkv"), &LoudnormTarget::default(), &temp)
            .await
            .unwrap();

        assert_eq!(m.input_i, -23.54);
        assert_eq!(m.target_offset, 0.02);
        assert_eq!(std::fs::read_dir(&temp).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_report_fails_and_scratch_removed() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = fake_tool(dir.path(), "ffmpeg", "echo 'no audio' >&2");
        let temp = dir.path().join("work");

        let result =
            measure_loudness(&ffmpeg, Path::new("/v/a.mkv"), &LoudnormTarget::default(), &temp).await;

        assert_matches!(result, Err(Error::Pipeline { step, .. }) if step == "audio_measure");
        assert_eq!(std::fs::read_dir(&temp).unwrap().count(), 0);
    }
}
