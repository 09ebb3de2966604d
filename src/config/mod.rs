mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    match resolve_config_path(custom_path) {
        Some(path) => load_config(&path),
        None => Ok(Config::default()),
    }
}

/// The config file that [`load_config_or_default`] reads: `custom_path` if
/// given, else the first default location that exists.
pub fn resolve_config_path(custom_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = custom_path {
        return Some(path.to_path_buf());
    }

    let default_paths = [
        "./encodeforge.toml",
        "~/.config/encodeforge/config.toml",
        "/etc/encodeforge/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            tracing::debug!("Using config file {:?}", path);
            return Some(path.to_path_buf());
        }
    }

    None
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.queue.output_suffix.is_empty() {
        anyhow::bail!("queue.output_suffix cannot be empty");
    }
    if config.queue.output_suffix.contains(std::path::MAIN_SEPARATOR) {
        anyhow::bail!(
            "queue.output_suffix cannot contain a path separator: {:?}",
            config.queue.output_suffix
        );
    }
    if config.queue.log_summary_interval_secs == 0 {
        anyhow::bail!("queue.log_summary_interval_secs must be at least 1");
    }

    if config.pipeline.temp_dir.as_os_str().is_empty() {
        anyhow::bail!("pipeline.temp_dir cannot be empty");
    }
    if config.pipeline.path_env.is_empty() {
        anyhow::bail!("pipeline.path_env cannot be empty");
    }
    if let Some(program) = &config.pipeline.program {
        if !program.exists() {
            tracing::warn!("Pipeline program does not exist: {:?}", program);
        }
    }

    config
        .defaults
        .settings
        .validate()
        .context("Invalid [defaults] conversion settings")?;

    if config.events.observer_capacity == 0 {
        anyhow::bail!("events.observer_capacity must be at least 1");
    }

    if config.crop.samples == 0 {
        anyhow::bail!("crop.samples must be at least 1");
    }
    if config.crop.min_agreement == 0 || config.crop.min_agreement > config.crop.samples {
        anyhow::bail!(
            "crop.min_agreement must be between 1 and crop.samples ({}), got {}",
            config.crop.samples,
            config.crop.min_agreement
        );
    }
    if !(config.crop.sample_seconds.is_finite() && config.crop.sample_seconds > 0.0) {
        anyhow::bail!("crop.sample_seconds must be a positive number");
    }

    let loudness = &config.loudness;
    if !(-70.0..=-5.0).contains(&loudness.integrated) {
        anyhow::bail!(
            "loudness.integrated must be between -70 and -5 LUFS, got {}",
            loudness.integrated
        );
    }
    if !(-9.0..=0.0).contains(&loudness.true_peak) {
        anyhow::bail!(
            "loudness.true_peak must be between -9 and 0 dBTP, got {}",
            loudness.true_peak
        );
    }
    if !(1.0..=50.0).contains(&loudness.lra) {
        anyhow::bail!("loudness.lra must be between 1 and 50 LU, got {}", loudness.lra);
    }

    for (name, path) in [
        ("ffmpeg", &config.tools.ffmpeg_path),
        ("ffprobe", &config.tools.ffprobe_path),
    ] {
        if let Some(path) = path {
            if !path.exists() {
                tracing::warn!("Configured {} path does not exist: {:?}", name, path);
            }
        }
    }

    Ok(())
}
