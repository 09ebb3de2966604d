//! Single protocol lines.
//!
//! [`ProtocolLine`] is shared by both ends of the pipe: the pipeline renders
//! lines with [`Display`](std::fmt::Display) and the supervisor classifies them
//! with [`ProtocolLine::parse`]. Classification is stateless; anything that
//! needs memory across lines (progress groups, frame totals) lives in
//! [`ProtocolParser`](crate::ProtocolParser).

use std::fmt;

use crate::stage::Stage;

const STAGE_PREFIX: &str = "STAGE:";
const STATUS_PREFIX: &str = "STATUS:";
const COMMAND_PREFIX: &str = "CMD:";
const ERROR_PREFIX: &str = "ERROR:";
const TOTAL_FRAMES_KEY: &str = "total_frames";

/// One classified line of pipeline output.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolLine {
    /// `total_frames=<int>`
    TotalFrames(u64),
    /// `STAGE:<name>`
    Stage(Stage),
    /// `STATUS:<text>`
    Status(String),
    /// `CMD:<text>`
    Command(String),
    /// `ERROR:<text>`
    Error(String),
    /// A native encoder progress pair such as `frame=120`.
    Progress { key: String, value: String },
    /// Anything else: banners, warnings, lines from newer pipelines.
    Other(String),
}

impl ProtocolLine {
    /// Classify one line of output. Surrounding whitespace is ignored.
    pub fn parse(line: &str) -> Self {
        let line = line.trim();

        if let Some(rest) = line.strip_prefix(STAGE_PREFIX) {
            return match rest.trim().parse() {
                Ok(stage) => ProtocolLine::Stage(stage),
                Err(never) => match never {},
            };
        }
        if let Some(rest) = line.strip_prefix(STATUS_PREFIX) {
            return ProtocolLine::Status(rest.trim().to_string());
        }
        if let Some(rest) = line.strip_prefix(COMMAND_PREFIX) {
            return ProtocolLine::Command(rest.trim().to_string());
        }
        if let Some(rest) = line.strip_prefix(ERROR_PREFIX) {
            return ProtocolLine::Error(rest.trim().to_string());
        }

        if let Some((key, value)) = line.split_once('=') {
            if is_progress_key(key) {
                let value = value.trim();
                if key == TOTAL_FRAMES_KEY {
                    return match value.parse() {
                        Ok(total) => ProtocolLine::TotalFrames(total),
                        Err(_) => ProtocolLine::Other(line.to_string()),
                    };
                }
                return ProtocolLine::Progress {
                    key: key.to_string(),
                    value: value.to_string(),
                };
            }
        }

        ProtocolLine::Other(line.to_string())
    }
}

/// ffmpeg progress keys are lowercase identifiers (`out_time_ms`,
/// `stream_0_0_q`). Requiring that shape keeps free-form log lines that merely
/// contain `=` out of the progress stream.
fn is_progress_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

impl fmt::Display for ProtocolLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolLine::TotalFrames(total) => write!(f, "{TOTAL_FRAMES_KEY}={total}"),
            ProtocolLine::Stage(stage) => write!(f, "{STAGE_PREFIX}{stage}"),
            ProtocolLine::Status(text) => write!(f, "{STATUS_PREFIX}{}", single_line(text)),
            ProtocolLine::Command(text) => write!(f, "{COMMAND_PREFIX}{}", single_line(text)),
            ProtocolLine::Error(text) => write!(f, "{ERROR_PREFIX}{}", single_line(text)),
            ProtocolLine::Progress { key, value } => write!(f, "{key}={value}"),
            ProtocolLine::Other(text) => f.write_str(&single_line(text)),
        }
    }
}

/// Embedded newlines would split one directive into several lines.
fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}
