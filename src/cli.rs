use clap::{Parser, Subcommand};
use encodeforge::state::ConversionMode;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "encodeforge")]
#[command(author, version, about = "Sequential AV1 conversion queue")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, env = "ENCODEFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Convert files one at a time, reporting progress until all are done
    Run {
        /// Source files to convert
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Content hint recorded with each job (default, animated, grainy)
        #[arg(long)]
        mode: Option<ConversionMode>,

        /// SVT-AV1 CRF, 0-51
        #[arg(long)]
        crf: Option<u8>,

        /// SVT-AV1 preset, 0-13
        #[arg(long)]
        preset: Option<u8>,

        /// Extra -svtav1-params string
        #[arg(long)]
        svt_params: Option<String>,

        /// Opus bitrate, e.g. 96k
        #[arg(long)]
        audio_bitrate: Option<String>,

        /// Encode at the source resolution without crop detection
        #[arg(long)]
        skip_crop_detect: bool,

        /// Print every event as a JSON line on stdout
        #[arg(long)]
        json_events: bool,
    },

    /// Convert one file, speaking the progress line protocol on stdout
    #[command(hide = true)]
    Pipeline {
        source: PathBuf,
        output: PathBuf,
        crf: u8,
        preset: u8,
        svt_params: String,
        audio_bitrate: String,
        /// 1 to skip crop detection, 0 to run it
        #[arg(value_parser = parse_flag, action = clap::ArgAction::Set)]
        skip_crop_detect: bool,
    },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

fn parse_flag(s: &str) -> Result<bool, String> {
    match s {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(format!("expected 1 or 0, got '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_positionals() {
        let cli = Cli::try_parse_from([
            "encodeforge",
            "pipeline",
            "/v/a.mkv",
            "/v/a_conv.mkv",
            "26",
            "4",
            "tune=0:film-grain=8",
            "96k",
            "1",
        ])
        .unwrap();
        match cli.command {
            Commands::Pipeline {
                crf,
                preset,
                skip_crop_detect,
                ..
            } => {
                assert_eq!(crf, 26);
                assert_eq!(preset, 4);
                assert!(skip_crop_detect);
            }
            _ => panic!("expected pipeline command"),
        }
    }

    #[test]
    fn test_run_options() {
        let cli = Cli::try_parse_from([
            "encodeforge",
            "-v",
            "run",
            "--mode",
            "animated",
            "--crf",
            "30",
            "a.mkv",
            "b.mkv",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run {
                files, mode, crf, ..
            } => {
                assert_eq!(files.len(), 2);
                assert_eq!(mode, Some(ConversionMode::Animated));
                assert_eq!(crf, Some(30));
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_rejects_bad_flag() {
        assert!(parse_flag("yes").is_err());
    }
}
