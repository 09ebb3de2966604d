//! Stateful decoding of a pipeline's output into [`ProtocolEvent`]s.

use serde::{Deserialize, Serialize};

use crate::line::ProtocolLine;
use crate::stage::Stage;

/// Percent reported while the output is not yet finalized.
const MAX_IN_FLIGHT_PERCENT: f64 = 99.9;

/// A typed event decoded from pipeline output.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// The frame denominator for the rest of the run.
    TotalFrames(u64),
    /// The pipeline moved to a new phase.
    Stage(Stage),
    /// Narration for the job log.
    Status(String),
    /// The reconstructed encode invocation.
    Command(String),
    /// One complete group of encoder progress keys.
    Progress(ProgressSample),
    /// A line the protocol does not assign meaning to.
    Log(String),
    /// Fatal failure. Always the last event a parser yields.
    Error(String),
}

/// Progress computed from one `-progress` group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSample {
    pub frame: Option<u64>,
    pub total_frames: Option<u64>,
    pub fps: Option<f64>,
    /// `frame / total_frames` as a percentage, never above 99.9.
    pub percent: Option<f64>,
    /// Seconds left at the current rate; absent when the rate is zero.
    pub eta_seconds: Option<f64>,
    pub out_time_ms: Option<i64>,
    pub total_size: Option<u64>,
    pub bitrate: Option<String>,
    /// The group was closed by `progress=end`.
    pub complete: bool,
}

impl ProgressSample {
    /// One-line summary suitable for a job log.
    ///
    /// ```
    /// use encodeforge_protocol::ProgressSample;
    ///
    /// let sample = ProgressSample {
    ///     frame: Some(240),
    ///     fps: Some(48.0),
    ///     total_size: Some(1_048_576),
    ///     bitrate: Some("1200.5kbits/s".into()),
    ///     ..Default::default()
    /// };
    /// assert_eq!(
    ///     sample.summary(),
    ///     "Frame: 240 | FPS: 48.0 | Size: 1.0 MiB | Bitrate: 1200.5kbits/s"
    /// );
    /// ```
    pub fn summary(&self) -> String {
        let na = || "N/A".to_string();
        format!(
            "Frame: {} | FPS: {} | Size: {} | Bitrate: {}",
            self.frame.map(|f| f.to_string()).unwrap_or_else(na),
            self.fps.map(|f| format!("{f:.1}")).unwrap_or_else(na),
            self.total_size.map(format_size).unwrap_or_else(na),
            self.bitrate.clone().unwrap_or_else(na),
        )
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Keys of the progress group currently being assembled.
#[derive(Debug, Default)]
struct PendingGroup {
    frame: Option<u64>,
    fps: Option<f64>,
    out_time_ms: Option<i64>,
    total_size: Option<u64>,
    bitrate: Option<String>,
    dirty: bool,
}

/// Decodes one process's output, line by line.
///
/// A parser belongs to a single run: the frame total it learns and the
/// progress group it is assembling carry across lines, and once it has seen
/// `ERROR:` it ignores everything else.
#[derive(Debug, Default)]
pub struct ProtocolParser {
    total_frames: Option<u64>,
    group: PendingGroup,
    failed: bool,
}

impl ProtocolParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// The frame total announced so far.
    pub fn total_frames(&self) -> Option<u64> {
        self.total_frames
    }

    /// Whether an `ERROR:` line has been seen.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Decode one line. Returns `None` for lines that only update parser
    /// state (progress keys inside a group) and for anything after an error.
    pub fn feed(&mut self, line: &str) -> Option<ProtocolEvent> {
        if self.failed {
            return None;
        }

        match ProtocolLine::parse(line) {
            ProtocolLine::TotalFrames(total) => {
                self.total_frames = Some(total);
                Some(ProtocolEvent::TotalFrames(total))
            }
            ProtocolLine::Stage(stage) => Some(ProtocolEvent::Stage(stage)),
            ProtocolLine::Status(text) => Some(ProtocolEvent::Status(text)),
            ProtocolLine::Command(text) => Some(ProtocolEvent::Command(text)),
            ProtocolLine::Error(text) => {
                self.failed = true;
                Some(ProtocolEvent::Error(text))
            }
            ProtocolLine::Progress { key, value } => self.progress_key(&key, value),
            ProtocolLine::Other(text) if text.is_empty() => None,
            ProtocolLine::Other(text) => Some(ProtocolEvent::Log(text)),
        }
    }

    /// Flush a progress group the stream closed before terminating.
    pub fn finish(&mut self) -> Option<ProtocolEvent> {
        if self.failed || !self.group.dirty {
            return None;
        }
        Some(ProtocolEvent::Progress(self.close_group(false)))
    }

    fn progress_key(&mut self, key: &str, value: String) -> Option<ProtocolEvent> {
        let group = &mut self.group;
        match key {
            "frame" => group.frame = value.parse().ok().or(group.frame),
            "fps" => group.fps = value.parse().ok().or(group.fps),
            "out_time_ms" => group.out_time_ms = value.parse().ok().or(group.out_time_ms),
            "total_size" => group.total_size = value.parse().ok().or(group.total_size),
            "bitrate" => group.bitrate = Some(value),
            "progress" => {
                let complete = value == "end";
                return Some(ProtocolEvent::Progress(self.close_group(complete)));
            }
            _ => {}
        }
        group.dirty = true;
        None
    }

    fn close_group(&mut self, complete: bool) -> ProgressSample {
        let group = std::mem::take(&mut self.group);
        let total_frames = self.total_frames.filter(|total| *total > 0);

        let percent = match (group.frame, total_frames) {
            (Some(frame), Some(total)) => Some(
                (frame as f64 / total as f64 * 100.0)
                    .clamp(0.0, 100.0)
                    .min(MAX_IN_FLIGHT_PERCENT),
            ),
            _ => None,
        };

        let eta_seconds = match (group.frame, total_frames, group.fps) {
            (Some(frame), Some(total), Some(fps)) if fps > 0.0 => {
                Some(total.saturating_sub(frame) as f64 / fps)
            }
            _ => None,
        };

        ProgressSample {
            frame: group.frame,
            total_frames,
            fps: group.fps,
            percent,
            eta_seconds,
            out_time_ms: group.out_time_ms,
            total_size: group.total_size,
            bitrate: group.bitrate,
            complete,
        }
    }
}

/// Lazy event stream over a sequence of lines.
///
/// Ends when the lines run out (after flushing a trailing progress group) or
/// right after an [`ProtocolEvent::Error`].
pub struct Events<I> {
    lines: I,
    parser: ProtocolParser,
    done: bool,
}

/// Decode every line of `lines` into events.
pub fn parse_lines<I, S>(lines: I) -> Events<I::IntoIter>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    Events {
        lines: lines.into_iter(),
        parser: ProtocolParser::new(),
        done: false,
    }
}

impl<I, S> Iterator for Events<I>
where
    I: Iterator<Item = S>,
    S: AsRef<str>,
{
    type Item = ProtocolEvent;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let Some(line) = self.lines.next() else {
                self.done = true;
                return self.parser.finish();
            };
            if let Some(event) = self.parser.feed(line.as_ref()) {
                if matches!(event, ProtocolEvent::Error(_)) {
                    self.done = true;
                }
                return Some(event);
            }
        }
    }
}
