//! Stamp the encode command into the container and move it into place.

use std::path::Path;

use encodeforge_common::paths::tagged_temp_path;
use encodeforge_common::Result;

use crate::pipeline::ToolCommand;

/// Container tag holding the command that produced the file.
pub const ENCODER_COMMAND_TAG: &str = "ENCODER_COMMAND";

pub fn finalize_command(
    ffmpeg: &Path,
    encoded: &Path,
    staged: &Path,
    muxer: &str,
    encode_command: &str,
) -> ToolCommand {
    let mut cmd = ToolCommand::new(ffmpeg);
    cmd.args(["-hide_banner", "-nostdin", "-y", "-loglevel", "error", "-i"])
        .path_arg(encoded)
        .args(["-map", "0", "-c", "copy", "-metadata"])
        .arg(format!("{ENCODER_COMMAND_TAG}={encode_command}"))
        .args(["-f", muxer])
        .path_arg(staged);
    cmd
}

/// Remux `encoded` with the command tag, rename the result onto `output` and
/// drop the encode temp.
pub async fn finalize(
    ffmpeg: &Path,
    encoded: &Path,
    output: &Path,
    muxer: &str,
    encode_command: &str,
) -> Result<()> {
    let staged = tagged_temp_path(output, "finalize");
    finalize_command(ffmpeg, encoded, &staged, muxer, encode_command)
        .execute()
        .await?;

    std::fs::rename(&staged, output)?;
    if let Err(e) = std::fs::remove_file(encoded) {
        tracing::warn!(path = %encoded.display(), error = %e, "Failed to remove encode temp");
    }
    Ok(())
}
