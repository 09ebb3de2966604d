//! The single worker loop.

use std::sync::Arc;

use encodeforge_common::JobId;
use encodeforge_protocol::ProtocolEvent;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::QueueInner;
use crate::conversion::ExitOutcome;
use crate::events::EventPayload;
use crate::state::Job;

pub(super) async fn run(inner: Arc<QueueInner>) {
    tracing::info!("Conversion worker started");

    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }

        match inner.table.claim_next(&inner.shutdown) {
            Some((job, cancel)) => run_job(&inner, job, cancel).await,
            None => {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = inner.wake.notified() => {}
                }
            }
        }
    }

    tracing::info!("Conversion worker stopped");
}

async fn run_job(inner: &QueueInner, job: Job, cancel: CancellationToken) {
    let job_id = job.id;
    tracing::info!(
        job_id = %job_id,
        source = %job.source_path.display(),
        "Processing conversion job"
    );
    inner.publish(EventPayload::status(&job));
    inner.publish(EventPayload::QueueUpdate);

    if cancel.is_cancelled() {
        finish(inner, job_id, ExitOutcome::Cancelled);
        return;
    }

    let mut process = match inner.supervisor.spawn(&job, cancel) {
        Ok(process) => process,
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Failed to start pipeline");
            finish(
                inner,
                job_id,
                ExitOutcome::Failed {
                    message: e.to_string(),
                },
            );
            return;
        }
    };

    let mut last_summary: Option<Instant> = None;
    while let Some(event) = process.next_event().await {
        apply_event(inner, job_id, event, &mut last_summary);
    }

    let exit = process.wait().await;
    if !exit.stderr.is_empty() {
        inner
            .table
            .update(job_id, |job| job.append_log(&format!("STDERR: {}", exit.stderr)));
    }
    finish(inner, job_id, exit.outcome);
}

/// Fold one pipeline event into the job and publish progress where the
/// event is worth showing.
fn apply_event(
    inner: &QueueInner,
    job_id: JobId,
    event: ProtocolEvent,
    last_summary: &mut Option<Instant>,
) {
    let interval = inner.options.log_summary_interval;
    let tail_lines = inner.options.log_tail_lines;

    let payload = inner.table.update(job_id, |job| {
        let publish = match event {
            ProtocolEvent::TotalFrames(total) => {
                job.progress.total_frames = Some(total);
                false
            }
            ProtocolEvent::Stage(stage) => {
                tracing::debug!(job_id = %job_id, stage = %stage, "Pipeline stage");
                job.append_log(&format!("STAGE:{stage}"));
                job.progress.stage = stage;
                true
            }
            ProtocolEvent::Status(text) => {
                job.append_log(&format!("STATUS:{text}"));
                job.progress.status_text = Some(text);
                true
            }
            ProtocolEvent::Command(command) => {
                job.append_log(&format!("CMD:{command}"));
                job.progress.command = Some(command);
                true
            }
            ProtocolEvent::Progress(sample) => {
                job.progress.apply_sample(&sample);
                let due = last_summary.map_or(true, |at| at.elapsed() >= interval);
                if due {
                    job.append_log(&sample.summary());
                    *last_summary = Some(Instant::now());
                }
                true
            }
            ProtocolEvent::Log(line) => {
                job.append_log(&line);
                false
            }
            ProtocolEvent::Error(message) => {
                tracing::warn!(job_id = %job_id, error = %message, "Pipeline reported an error");
                job.append_log(&format!("ERROR:{message}"));
                false
            }
        };
        publish.then(|| EventPayload::progress(job, tail_lines))
    });

    if let Some(Some(payload)) = payload {
        inner.publish(payload);
    }
}

/// Apply the terminal outcome, announce it and release anyone waiting on it.
fn finish(inner: &QueueInner, job_id: JobId, outcome: ExitOutcome) {
    let tail_lines = inner.options.log_tail_lines;

    let finished = inner.table.update(job_id, |job| {
        let changed = match &outcome {
            ExitOutcome::Succeeded => {
                let done = job.complete();
                if done {
                    job.progress.status_text = Some("Conversion complete".to_string());
                }
                done
            }
            ExitOutcome::Failed { message } => {
                let failed = job.fail(message);
                if failed {
                    job.append_log(&format!("FAILED: {message}"));
                }
                failed
            }
            ExitOutcome::Cancelled => {
                let cancelled = job.cancel();
                if cancelled {
                    job.append_log("Cancelled by user");
                }
                cancelled
            }
        };
        changed.then(|| job.clone())
    });

    match finished {
        Some(Some(job)) => {
            match &job.error_message {
                Some(error) => {
                    tracing::error!(job_id = %job_id, status = %job.status, error = %error, "Job finished")
                }
                None => tracing::info!(job_id = %job_id, status = %job.status, "Job finished"),
            }
            if matches!(outcome, ExitOutcome::Succeeded) {
                inner.publish(EventPayload::progress(&job, tail_lines));
            }
            inner.publish(EventPayload::status(&job));
            inner.publish(EventPayload::QueueUpdate);
        }
        Some(None) => {
            tracing::warn!(job_id = %job_id, outcome = ?outcome, "Job was already terminal");
        }
        None => {
            tracing::warn!(job_id = %job_id, "Job disappeared while processing");
        }
    }

    inner.settled.send_modify(|n| *n = n.wrapping_add(1));
}
