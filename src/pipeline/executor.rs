use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use encodeforge_common::paths::temp_output_path;
use encodeforge_common::{Error, Result};
use encodeforge_protocol::{LoudnormTarget, ProtocolLine, Stage};
use parking_lot::Mutex;

use super::actions;
use crate::config::{Config, CropConfig};
use crate::probe::{probe_source, tool_path};
use crate::state::ConversionSettings;

/// Writes protocol lines for the supervising process.
#[derive(Clone)]
pub struct Reporter {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Reporter {
    /// Report on this process's stdout.
    pub fn stdout() -> Self {
        Self::to_writer(std::io::stdout())
    }

    pub fn to_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn emit(&self, line: ProtocolLine) {
        let mut sink = self.sink.lock();
        if let Err(e) = writeln!(sink, "{line}").and_then(|()| sink.flush()) {
            tracing::debug!(error = %e, "Failed to write protocol line");
        }
    }

    pub fn stage(&self, stage: Stage) {
        self.emit(ProtocolLine::Stage(stage));
    }

    pub fn status(&self, text: impl Into<String>) {
        self.emit(ProtocolLine::Status(text.into()));
    }

    pub fn command(&self, text: impl Into<String>) {
        self.emit(ProtocolLine::Command(text.into()));
    }

    pub fn total_frames(&self, total: u64) {
        self.emit(ProtocolLine::TotalFrames(total));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(ProtocolLine::Error(message.into()));
    }

    /// Pass a line through untouched.
    pub fn raw(&self, line: &str) {
        self.emit(ProtocolLine::Other(line.to_string()));
    }
}

/// One conversion request, as given on the command line.
#[derive(Debug, Clone)]
pub struct PipelineArgs {
    pub source: PathBuf,
    pub output: PathBuf,
    pub settings: ConversionSettings,
}

/// Where the tools are and how the measurements are taken.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub temp_dir: PathBuf,
    pub crop: CropConfig,
    pub loudness: LoudnormTarget,
}

impl PipelineSettings {
    /// Settings from `config`, with `TEMP_DIR` from the environment taking
    /// precedence over the configured temp directory.
    pub fn from_config(config: &Config) -> Self {
        let temp_dir = std::env::var_os("TEMP_DIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| config.pipeline.temp_dir.clone());

        Self {
            ffmpeg: tool_path("ffmpeg", config.tools.ffmpeg_path.as_deref()),
            ffprobe: tool_path("ffprobe", config.tools.ffprobe_path.as_deref()),
            temp_dir,
            crop: config.crop.clone(),
            loudness: config.loudness.target(),
        }
    }
}

/// Drives one source through probe, crop detection, loudness measurement,
/// encode and finalize, reporting each step as protocol lines.
pub struct PipelineExecutor {
    settings: PipelineSettings,
    reporter: Reporter,
}

impl PipelineExecutor {
    pub fn new(settings: PipelineSettings, reporter: Reporter) -> Self {
        Self { settings, reporter }
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub async fn execute(&self, args: &PipelineArgs) -> Result<()> {
        let tools = &self.settings;
        let report = &self.reporter;
        args.settings.validate()?;
        if !args.source.is_file() {
            return Err(Error::not_found("source file", args.source.display()));
        }

        report.stage(Stage::Initializing);
        report.status(format!("Analyzing {}", args.source.display()));
        let info = probe_source(&tools.ffprobe, &args.source).await?;
        let total = info.total_frames().ok_or_else(|| {
            Error::pipeline("probe", "could not determine frame count or duration")
        })?;
        report.total_frames(total);
        tracing::info!(
            source = %args.source.display(),
            width = info.width,
            height = info.height,
            total_frames = total,
            audio_streams = info.audio_streams,
            "Probed source"
        );

        let crop = if args.settings.skip_crop_detect {
            report.status("Crop detection disabled");
            None
        } else {
            report.stage(Stage::CropDetect);
            actions::detect_crop(&tools.ffmpeg, &args.source, &info, &tools.crop, report).await?
        };

        report.stage(Stage::AudioMeasure);
        report.status("Measuring loudness");
        let measured = actions::measure_loudness(
            &tools.ffmpeg,
            &args.source,
            &tools.loudness,
            &tools.temp_dir,
        )
        .await?;
        report.status(format!(
            "Measured loudness: I={} TP={} LRA={}",
            measured.input_i, measured.input_tp, measured.input_lra
        ));

        report.stage(Stage::Encoding);
        let muxer = actions::muxer_for(&args.output);
        let plan = actions::EncodePlan {
            source: &args.source,
            temp_output: temp_output_path(&args.output),
            settings: &args.settings,
            crop,
            audio_filter: tools.loudness.second_pass_filter(&measured),
            muxer,
        };
        let encode = actions::encode_command(&tools.ffmpeg, &plan);
        let command_line = encode.display();
        report.command(command_line.clone());
        actions::run_encode(encode, report).await?;

        report.stage(Stage::Finalizing);
        report.status("Writing metadata");
        actions::finalize(
            &tools.ffmpeg,
            &plan.temp_output,
            &args.output,
            muxer,
            &command_line,
        )
        .await?;

        report.status("Conversion complete");
        report.stage(Stage::Complete);
        Ok(())
    }
}
