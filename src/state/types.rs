use chrono::{DateTime, Utc};
use encodeforge_common::{Error, JobId, Result};
use encodeforge_protocol::{ProgressSample, Stage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Lifecycle state of a [`Job`].
///
/// ```text
/// pending ──► processing ──► completed | failed
///    │             │
///    └──► cancelled ◄──┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pending" | "queued" => Ok(JobStatus::Pending),
            "processing" | "running" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            other => Err(Error::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Content hint chosen at submission. Recorded with the job, not interpreted
/// by the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversionMode {
    #[default]
    Default,
    Animated,
    Grainy,
}

impl ConversionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversionMode::Default => "default",
            ConversionMode::Animated => "animated",
            ConversionMode::Grainy => "grainy",
        }
    }
}

impl fmt::Display for ConversionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "default" => Ok(ConversionMode::Default),
            "animated" => Ok(ConversionMode::Animated),
            "grainy" => Ok(ConversionMode::Grainy),
            other => Err(Error::validation(format!(
                "unknown mode '{other}' (expected default, animated or grainy)"
            ))),
        }
    }
}

/// Encoder settings requested for one conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionSettings {
    /// SVT-AV1 constant rate factor, 0-51.
    #[serde(default = "default_crf")]
    pub crf: u8,

    /// SVT-AV1 preset, 0 (slowest) to 13 (fastest).
    #[serde(default = "default_preset")]
    pub preset: u8,

    /// Extra `-svtav1-params` string.
    #[serde(default = "default_svt_params")]
    pub svt_params: String,

    /// Opus bitrate such as `96k`.
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,

    #[serde(default)]
    pub skip_crop_detect: bool,
}

fn default_crf() -> u8 {
    26
}

fn default_preset() -> u8 {
    4
}

fn default_svt_params() -> String {
    "tune=0:film-grain=8".to_string()
}

fn default_audio_bitrate() -> String {
    "96k".to_string()
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            crf: default_crf(),
            preset: default_preset(),
            svt_params: default_svt_params(),
            audio_bitrate: default_audio_bitrate(),
            skip_crop_detect: false,
        }
    }
}

impl ConversionSettings {
    pub const MAX_CRF: u8 = 51;
    pub const MAX_PRESET: u8 = 13;

    /// Reject settings the encoder would refuse.
    pub fn validate(&self) -> Result<()> {
        if self.crf > Self::MAX_CRF {
            return Err(Error::validation(format!(
                "crf must be between 0 and {}, got {}",
                Self::MAX_CRF,
                self.crf
            )));
        }
        if self.preset > Self::MAX_PRESET {
            return Err(Error::validation(format!(
                "preset must be between 0 and {}, got {}",
                Self::MAX_PRESET,
                self.preset
            )));
        }
        if !is_bitrate(&self.audio_bitrate) {
            return Err(Error::validation(format!(
                "audio bitrate must look like '96k', got '{}'",
                self.audio_bitrate
            )));
        }
        if self.svt_params.contains(char::is_whitespace) {
            return Err(Error::validation("svt params must not contain whitespace"));
        }
        Ok(())
    }

    /// The five settings arguments the pipeline takes after its two paths.
    pub fn pipeline_args(&self) -> [String; 5] {
        [
            self.crf.to_string(),
            self.preset.to_string(),
            self.svt_params.clone(),
            self.audio_bitrate.clone(),
            if self.skip_crop_detect { "1" } else { "0" }.to_string(),
        ]
    }
}

fn is_bitrate(value: &str) -> bool {
    value
        .strip_suffix('k')
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

/// Live progress of a job, overwritten in place as the pipeline reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub stage: Stage,
    pub status_text: Option<String>,
    pub frame: Option<u64>,
    pub total_frames: Option<u64>,
    pub fps: Option<f64>,
    pub percent: f64,
    pub eta_seconds: Option<f64>,
    /// The last `CMD:` line, i.e. the encode that produced the output.
    pub command: Option<String>,
}

impl ProgressSnapshot {
    pub fn apply_sample(&mut self, sample: &ProgressSample) {
        if sample.frame.is_some() {
            self.frame = sample.frame;
        }
        if sample.total_frames.is_some() {
            self.total_frames = sample.total_frames;
        }
        if sample.fps.is_some() {
            self.fps = sample.fps;
        }
        if let Some(percent) = sample.percent {
            self.percent = percent;
        }
        self.eta_seconds = sample.eta_seconds;
    }
}

/// One requested source-to-output conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub mode: ConversionMode,
    pub settings: ConversionSettings,
    pub status: JobStatus,
    pub progress: ProgressSnapshot,
    pub error_message: Option<String>,
    pub log: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        source_path: PathBuf,
        output_path: PathBuf,
        mode: ConversionMode,
        settings: ConversionSettings,
    ) -> Self {
        Self {
            id: JobId::new(),
            source_path,
            output_path,
            mode,
            settings,
            status: JobStatus::Pending,
            progress: ProgressSnapshot::default(),
            error_message: None,
            log: String::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// `pending → processing`. Returns whether the transition happened.
    pub fn start(&mut self) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        self.status = JobStatus::Processing;
        self.started_at = Some(Utc::now());
        true
    }

    /// `processing → completed`.
    pub fn complete(&mut self) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        self.status = JobStatus::Completed;
        self.progress.percent = 100.0;
        self.progress.stage = Stage::Complete;
        self.progress.eta_seconds = None;
        self.completed_at = Some(Utc::now());
        true
    }

    /// `processing → failed`.
    pub fn fail(&mut self, error: &str) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        self.status = JobStatus::Failed;
        self.error_message = Some(error.to_string());
        self.progress.eta_seconds = None;
        self.completed_at = Some(Utc::now());
        true
    }

    /// `pending | processing → cancelled`. Cancellation is not an error, so
    /// no error message is recorded.
    pub fn cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Cancelled;
        self.progress.eta_seconds = None;
        self.completed_at = Some(Utc::now());
        true
    }

    pub fn append_log(&mut self, line: &str) {
        if !self.log.is_empty() {
            self.log.push('\n');
        }
        self.log.push_str(line);
    }

    /// The last `lines` lines of the log.
    pub fn log_tail(&self, lines: usize) -> String {
        if lines == 0 {
            return String::new();
        }
        let mut start = self.log.len();
        for _ in 0..lines {
            match self.log[..start].rfind('\n') {
                Some(pos) => start = pos,
                None => return self.log.clone(),
            }
        }
        self.log[start + 1..].to_string()
    }
}

/// Listing query: optional status filter plus pagination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub status: Option<JobStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl ListQuery {
    pub const DEFAULT_LIMIT: usize = 100;
    pub const MAX_LIMIT: usize = 1000;

    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Clamp the limit into `1..=1000`.
    pub fn normalized(&self) -> Self {
        Self {
            status: self.status,
            limit: self.limit.clamp(1, Self::MAX_LIMIT),
            offset: self.offset,
        }
    }
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            status: None,
            limit: Self::DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

/// One page of a listing; `total` counts every job matching the filter.
#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: usize,
}
