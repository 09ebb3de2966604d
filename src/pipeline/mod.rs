//! The built-in conversion pipeline.
//!
//! Run as `encodeforge pipeline <source> <output> <crf> <preset>
//! <svt-params> <audio-bitrate> <skip-crop-detect>`, it converts one file and
//! reports progress on stdout in the line protocol the supervisor reads.
//! The supervisor treats it like any other external program.

pub mod actions;
mod command;
mod executor;

pub use command::{shell_quote, ToolCommand, ToolOutput};
pub use executor::{PipelineArgs, PipelineExecutor, PipelineSettings, Reporter};

use encodeforge_common::Error;

use crate::conversion::remove_temp_artifacts;
use crate::shutdown::shutdown_signal;

/// Exit status after a failure.
pub const EXIT_FAILURE: i32 = 1;

/// Exit status after SIGTERM or SIGINT, as a shell reports death by SIGTERM.
pub const EXIT_INTERRUPTED: i32 = 143;

/// Run the pipeline to completion or until interrupted. Returns the exit
/// status for the process.
///
/// On any exit but success the hidden temp artifacts of the output are
/// removed; the measurement scratch file and any running ffmpeg are released
/// when the pipeline future is dropped.
pub async fn run(executor: PipelineExecutor, args: PipelineArgs) -> i32 {
    let result = tokio::select! {
        result = executor.execute(&args) => Some(result),
        _ = shutdown_signal() => None,
    };

    match result {
        Some(Ok(())) => 0,
        Some(Err(e)) => {
            tracing::error!(source = %args.source.display(), error = %e, "Conversion failed");
            executor.reporter().error(failure_message(&e));
            remove_temp_artifacts(&args.output);
            EXIT_FAILURE
        }
        None => {
            tracing::warn!(source = %args.source.display(), "Interrupted, cleaning up");
            let removed = remove_temp_artifacts(&args.output);
            tracing::debug!(removed, "Removed temp artifacts");
            EXIT_INTERRUPTED
        }
    }
}

/// The text that goes after `ERROR:`. Stage failures are reported by their
/// message alone.
pub fn failure_message(error: &Error) -> String {
    match error {
        Error::Pipeline { message, .. } => message.clone(),
        other => other.to_string(),
    }
}
