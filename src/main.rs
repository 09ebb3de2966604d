mod cli;

use encodeforge::{
    config,
    conversion::{ProcessSupervisor, SupervisorConfig},
    events::{EventHub, EventPayload, Subscription},
    pipeline, probe,
    queue::{JobQueue, QueueOptions},
    shutdown::shutdown_signal,
    state::{ConversionMode, JobStatus, ListQuery},
};

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use std::path::{Path, PathBuf};

/// Per-run overrides of the `[defaults]` table.
struct RunOverrides {
    mode: Option<ConversionMode>,
    crf: Option<u8>,
    preset: Option<u8>,
    svt_params: Option<String>,
    audio_bitrate: Option<String>,
    skip_crop_detect: bool,
}

/// The program and leading arguments the supervisor runs for each job.
///
/// Unless `[pipeline] program` names another executable, jobs re-run this
/// binary as `encodeforge [--config <path>] pipeline ...` so the pipeline
/// sees the same configuration file as the queue.
fn pipeline_command(
    config: &config::Config,
    config_path: Option<&Path>,
) -> Result<(PathBuf, Vec<String>)> {
    if let Some(program) = &config.pipeline.program {
        return Ok((program.clone(), Vec::new()));
    }

    let exe = std::env::current_exe().context("Failed to locate the encodeforge executable")?;
    let mut args = Vec::new();
    if let Some(path) = config::resolve_config_path(config_path) {
        let path = std::fs::canonicalize(&path).unwrap_or(path);
        args.push("--config".to_string());
        args.push(path.to_string_lossy().into_owned());
    }
    args.push("pipeline".to_string());
    Ok((exe, args))
}

async fn run_files(
    files: Vec<PathBuf>,
    overrides: RunOverrides,
    json_events: bool,
    config_path: Option<&Path>,
) -> Result<bool> {
    let mut config = config::load_config_or_default(config_path)?;

    let settings = &mut config.defaults.settings;
    if let Some(crf) = overrides.crf {
        settings.crf = crf;
    }
    if let Some(preset) = overrides.preset {
        settings.preset = preset;
    }
    if let Some(svt_params) = overrides.svt_params {
        settings.svt_params = svt_params;
    }
    if let Some(audio_bitrate) = overrides.audio_bitrate {
        settings.audio_bitrate = audio_bitrate;
    }
    if overrides.skip_crop_detect {
        settings.skip_crop_detect = true;
    }
    settings.validate()?;
    let mode = overrides.mode.unwrap_or(config.defaults.mode);

    let (program, leading_args) = pipeline_command(&config, config_path)?;

    let supervisor = ProcessSupervisor::new(SupervisorConfig {
        program,
        leading_args,
        temp_dir: config.pipeline.temp_dir.clone(),
        path_env: config.pipeline.path_env.clone(),
        extra_env: Vec::new(),
        termination_grace: config.pipeline.termination_grace(),
        stderr_limit: config.pipeline.stderr_limit,
    });
    tracing::debug!(
        program = %supervisor.config().program.display(),
        leading_args = ?supervisor.config().leading_args,
        "Pipeline command"
    );
    let queue = JobQueue::new(
        supervisor,
        EventHub::new(config.events.observer_capacity),
        QueueOptions::from_config(&config),
    );

    // Register before submitting so the first queue_update is seen.
    let events = queue.subscribe();
    queue.start();

    let batch = queue.submit_batch(files, mode, config.defaults.settings.clone());
    for (source, reason) in &batch.rejected {
        eprintln!("✗ {}: {}", source.display(), reason);
    }
    if batch.created.is_empty() {
        queue.shutdown().await;
        anyhow::bail!("No files were queued");
    }
    tracing::info!(
        queued = batch.created.len(),
        rejected = batch.rejected.len(),
        "Starting conversions"
    );

    let observer = tokio::spawn(render_events(events, json_events));

    let interrupted = tokio::select! {
        _ = queue.wait_until_idle() => false,
        _ = shutdown_signal() => {
            tracing::warn!("Interrupted, stopping the current conversion");
            true
        }
    };

    queue.shutdown().await;
    if let Err(e) = observer.await {
        tracing::error!("Event observer failed: {}", e);
    }

    let page = queue.list(&ListQuery {
        limit: ListQuery::MAX_LIMIT,
        ..ListQuery::default()
    });
    let mut all_ok = batch.rejected.is_empty() && !interrupted;

    if !json_events {
        println!();
    }
    for job in &page.jobs {
        match job.status {
            JobStatus::Completed => {
                if !json_events {
                    println!("✓ {}", job.output_path.display());
                }
            }
            JobStatus::Failed => {
                all_ok = false;
                eprintln!(
                    "✗ {}: {}",
                    job.source_path.display(),
                    job.error_message.as_deref().unwrap_or("failed")
                );
            }
            JobStatus::Cancelled => {
                all_ok = false;
                eprintln!("- {}: cancelled", job.source_path.display());
            }
            JobStatus::Pending | JobStatus::Processing => {
                all_ok = false;
                eprintln!("- {}: not converted", job.source_path.display());
            }
        }
    }

    Ok(all_ok)
}

/// Print events until the hub closes.
async fn render_events(mut events: Subscription, json: bool) {
    while let Some(event) = events.recv().await {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Failed to serialize event: {}", e),
            }
            continue;
        }

        match &event.payload {
            EventPayload::JobProgress {
                job_id,
                percent,
                fps,
                eta_seconds,
                stage,
                ..
            } => {
                tracing::debug!(
                    job_id = %job_id,
                    stage = %stage,
                    percent = %format!("{:.1}", percent),
                    fps = ?fps,
                    eta_seconds = ?eta_seconds,
                    "Progress"
                );
            }
            EventPayload::JobStatus {
                job_id,
                status,
                error,
            } => match error {
                Some(error) => tracing::error!(job_id = %job_id, status = %status, "{}", error),
                None => tracing::info!(job_id = %job_id, status = %status, "Job status changed"),
            },
            EventPayload::QueueUpdate => {}
        }
    }

    if events.dropped() > 0 {
        tracing::debug!(dropped = events.dropped(), "Observer fell behind");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag.
    // Logs go to stderr: the pipeline command owns stdout for its progress lines.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "encodeforge=trace,encodeforge_protocol=debug,encodeforge_common=debug".to_string()
        } else if matches!(cli.command, Commands::Pipeline { .. }) {
            "encodeforge=warn".to_string()
        } else {
            "encodeforge=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            files,
            mode,
            crf,
            preset,
            svt_params,
            audio_bitrate,
            skip_crop_detect,
            json_events,
        } => {
            let overrides = RunOverrides {
                mode,
                crf,
                preset,
                svt_params,
                audio_bitrate,
                skip_crop_detect,
            };
            let rt = tokio::runtime::Runtime::new()?;
            let all_ok = rt.block_on(run_files(
                files,
                overrides,
                json_events,
                cli.config.as_deref(),
            ))?;
            drop(rt);
            if !all_ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Pipeline {
            source,
            output,
            crf,
            preset,
            svt_params,
            audio_bitrate,
            skip_crop_detect,
        } => {
            let code = run_pipeline(
                pipeline::PipelineArgs {
                    source,
                    output,
                    settings: encodeforge::state::ConversionSettings {
                        crf,
                        preset,
                        svt_params,
                        audio_bitrate,
                        skip_crop_detect,
                    },
                },
                cli.config.as_deref(),
            )?;
            std::process::exit(code);
        }
        Commands::CheckTools => check_tools(cli.config.as_deref()),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("encodeforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Run the pipeline for one file and return its exit status. Every failure,
/// including a bad config, is reported as an `ERROR:` line.
fn run_pipeline(args: pipeline::PipelineArgs, config_path: Option<&Path>) -> Result<i32> {
    let reporter = pipeline::Reporter::stdout();
    let config = match config::load_config_or_default(config_path) {
        Ok(config) => config,
        Err(e) => {
            reporter.error(format!("{:#}", e));
            return Ok(pipeline::EXIT_FAILURE);
        }
    };

    let executor = pipeline::PipelineExecutor::new(
        pipeline::PipelineSettings::from_config(&config),
        reporter,
    );
    let rt = tokio::runtime::Runtime::new()?;
    Ok(rt.block_on(pipeline::run(executor, args)))
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    println!("Checking external tools...\n");

    let tools = probe::check_tools(&config.tools);
    let mut all_ok = true;

    for tool in &tools {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Conversions will fail until they are installed.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            config::Config::default()
        }
    };

    let settings = &config.defaults.settings;
    println!("  Output suffix: {}", config.queue.output_suffix);
    println!("  Temp dir: {}", config.pipeline.temp_dir.display());
    match &config.pipeline.program {
        Some(program) => println!("  Pipeline: {}", program.display()),
        None => println!("  Pipeline: built-in"),
    }
    println!(
        "  Defaults: mode={} crf={} preset={} audio={}",
        config.defaults.mode, settings.crf, settings.preset, settings.audio_bitrate
    );
    println!(
        "  Loudness target: I={} TP={} LRA={}",
        config.loudness.integrated, config.loudness.true_peak, config.loudness.lra
    );

    Ok(())
}
