use crate::state::{ConversionMode, ConversionSettings};
use encodeforge_protocol::{crop, LoudnormTarget};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub crop: CropConfig,

    #[serde(default)]
    pub loudness: LoudnessConfig,

    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Inserted between the source file stem and its extension to name the
    /// output (default: "_conv")
    #[serde(default = "default_output_suffix")]
    pub output_suffix: String,

    /// Log lines carried in each progress event (default: 20)
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,

    /// Seconds between compact progress summaries in a job log (default: 5)
    #[serde(default = "default_log_summary_interval")]
    pub log_summary_interval_secs: u64,
}

fn default_output_suffix() -> String {
    "_conv".to_string()
}

fn default_log_tail_lines() -> usize {
    20
}

fn default_log_summary_interval() -> u64 {
    5
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            output_suffix: default_output_suffix(),
            log_tail_lines: default_log_tail_lines(),
            log_summary_interval_secs: default_log_summary_interval(),
        }
    }
}

impl QueueConfig {
    pub fn log_summary_interval(&self) -> Duration {
        Duration::from_secs(self.log_summary_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// External pipeline program. When unset the built-in `pipeline`
    /// subcommand of this binary is used.
    #[serde(default)]
    pub program: Option<PathBuf>,

    /// Scratch directory handed to the pipeline as TEMP_DIR. Emptied on
    /// startup and shutdown.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// How long a stopped pipeline may clean up before SIGKILL (default: 500)
    #[serde(default = "default_termination_grace")]
    pub termination_grace_ms: u64,

    /// PATH given to the pipeline. Its environment is otherwise empty.
    #[serde(default = "default_path_env")]
    pub path_env: String,

    /// Bytes of pipeline stderr kept for the job log (default: 64 KiB)
    #[serde(default = "default_stderr_limit")]
    pub stderr_limit: usize,
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("encodeforge")
}

fn default_termination_grace() -> u64 {
    500
}

fn default_path_env() -> String {
    "/usr/bin:/bin:/usr/local/bin".to_string()
}

fn default_stderr_limit() -> usize {
    64 * 1024
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            program: None,
            temp_dir: default_temp_dir(),
            termination_grace_ms: default_termination_grace(),
            path_env: default_path_env(),
            stderr_limit: default_stderr_limit(),
        }
    }
}

impl PipelineConfig {
    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }
}

/// Settings used when a submission does not override them.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DefaultsConfig {
    #[serde(default)]
    pub mode: ConversionMode,

    #[serde(flatten)]
    pub settings: ConversionSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventsConfig {
    /// Undelivered events buffered per observer (default: 64)
    #[serde(default = "default_observer_capacity")]
    pub observer_capacity: usize,
}

fn default_observer_capacity() -> usize {
    64
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            observer_capacity: default_observer_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CropConfig {
    /// Evenly spaced windows sampled with cropdetect (default: 8)
    #[serde(default = "default_crop_samples")]
    pub samples: usize,

    /// Length of each sampled window in seconds (default: 2)
    #[serde(default = "default_crop_sample_seconds")]
    pub sample_seconds: f64,

    /// Votes a crop needs to be applied (default: 3)
    #[serde(default = "default_crop_min_agreement")]
    pub min_agreement: usize,
}

fn default_crop_samples() -> usize {
    crop::DEFAULT_SAMPLE_COUNT
}

fn default_crop_sample_seconds() -> f64 {
    2.0
}

fn default_crop_min_agreement() -> usize {
    crop::DEFAULT_MIN_AGREEMENT
}

impl Default for CropConfig {
    fn default() -> Self {
        Self {
            samples: default_crop_samples(),
            sample_seconds: default_crop_sample_seconds(),
            min_agreement: default_crop_min_agreement(),
        }
    }
}

/// Two-pass loudnorm targets.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoudnessConfig {
    #[serde(default = "default_integrated")]
    pub integrated: f64,

    #[serde(default = "default_true_peak")]
    pub true_peak: f64,

    #[serde(default = "default_lra")]
    pub lra: f64,
}

fn default_integrated() -> f64 {
    LoudnormTarget::default().integrated
}

fn default_true_peak() -> f64 {
    LoudnormTarget::default().true_peak
}

fn default_lra() -> f64 {
    LoudnormTarget::default().lra
}

impl Default for LoudnessConfig {
    fn default() -> Self {
        Self {
            integrated: default_integrated(),
            true_peak: default_true_peak(),
            lra: default_lra(),
        }
    }
}

impl LoudnessConfig {
    pub fn target(&self) -> LoudnormTarget {
        LoudnormTarget {
            integrated: self.integrated,
            true_peak: self.true_peak,
            lra: self.lra,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    #[serde(default)]
    pub ffprobe_path: Option<PathBuf>,
}
