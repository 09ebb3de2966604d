//! Job queue integration tests.
//!
//! Each test drives a real [`JobQueue`] whose pipeline is a shell script, so
//! spawning, progress parsing, cancellation and cleanup are all exercised
//! end to end.

#![cfg(unix)]

mod common;

use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use common::{
    events_until_status, process_gone, wait_gone, TestHarness, ORPHANING_SCRIPT, SLOW_SCRIPT,
    SUCCESS_SCRIPT,
};
use encodeforge::events::EventPayload;
use encodeforge::queue::{ClearFilter, Removal};
use encodeforge::state::{ConversionMode, ConversionSettings, JobStatus, ListQuery};
use encodeforge_common::Error;
use encodeforge_protocol::Stage;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_pipeline_completes_job() {
    let harness = TestHarness::new(SUCCESS_SCRIPT);
    let mut events = harness.queue.subscribe();

    let id = harness.submit("movie.mkv");
    let seen = events_until_status(&mut events, id, JobStatus::Completed).await;

    let job = harness.queue.get(id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress.percent, 100.0);
    assert_eq!(job.progress.stage, Stage::Complete);
    assert_eq!(job.progress.total_frames, Some(100));
    assert_eq!(job.progress.status_text.as_deref(), Some("Conversion complete"));
    assert!(job.progress.command.as_deref().unwrap().starts_with("ffmpeg -i "));
    assert!(job.error_message.is_none());
    assert!(job.started_at.is_some() && job.completed_at.is_some());
    assert!(job.log.contains("STAGE:encoding"));

    assert!(job.output_path.ends_with("movie_conv.mkv"));
    assert_eq!(std::fs::read_to_string(&job.output_path).unwrap(), "encoded\n");
    assert!(!harness.temp_artifact(&job).exists());

    // queue_update on submit, processing, progress, then the final status.
    assert_matches!(seen[0].payload, EventPayload::QueueUpdate);
    assert!(seen.iter().any(|e| matches!(
        e.payload,
        EventPayload::JobStatus { status: JobStatus::Processing, .. }
    )));
    let halfway = seen.iter().any(|e| match &e.payload {
        EventPayload::JobProgress { percent, frame, .. } => {
            *percent == 50.0 && *frame == Some(50)
        }
        _ => false,
    });
    assert!(halfway, "no 50% progress event in {seen:#?}");
}

#[tokio::test]
async fn error_line_fails_job_with_its_message() {
    let harness = TestHarness::new(
        r#"tmp="$(dirname "$2")/.$(basename "$2").tmp"
echo "STAGE:initializing"
echo "partial" > "$tmp"
echo "ERROR:no audio streams found"
exit 1"#,
    );
    let mut events = harness.queue.subscribe();

    let id = harness.submit("silent.mkv");
    let seen = events_until_status(&mut events, id, JobStatus::Failed).await;

    let job = harness.queue.get(id).unwrap();
    assert_eq!(job.error_message.as_deref(), Some("no audio streams found"));
    assert!(job.log.contains("ERROR:no audio streams found"));
    assert!(job.log.contains("FAILED: no audio streams found"));
    assert!(!harness.temp_artifact(&job).exists());
    assert!(!job.output_path.exists());
    assert!(!seen.iter().any(|e| matches!(
        e.payload,
        EventPayload::JobStatus { status: JobStatus::Completed, .. }
    )));
}

#[tokio::test]
async fn nonzero_exit_without_error_line_reports_code() {
    let harness = TestHarness::new("echo 'x264 blew up' >&2\nexit 3");

    let id = harness.submit("broken.mkv");
    let job = harness.wait_for_status(id, JobStatus::Failed).await;

    assert_eq!(job.error_message.as_deref(), Some("process exited with code 3"));
    assert!(job.log.contains("STDERR: x264 blew up"));
}

#[tokio::test]
async fn missing_pipeline_program_fails_job() {
    let dir = tempfile::tempdir().unwrap();
    let program = dir.path().join("no-such-pipeline");
    let harness = TestHarness::with_program(dir, program);

    let id = harness.submit("movie.mkv");
    let job = harness.wait_for_status(id, JobStatus::Failed).await;

    assert!(job.error_message.unwrap().contains("failed to start"));
    assert!(harness.queue.status().worker_running);
}

#[tokio::test]
async fn pipeline_exit_settles_job_despite_lingering_child() {
    let harness = TestHarness::new(ORPHANING_SCRIPT);

    let started = Instant::now();
    let id = harness.submit("movie.mkv");
    let job = harness
        .wait_for(id, |job| job.status.is_terminal())
        .await;

    assert_eq!(job.status, JobStatus::Completed);
    assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    let child = harness.child_pid("movie.mkv");
    assert!(wait_gone(child).await, "pipeline child {child} outlived the job");
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn jobs_run_one_at_a_time_in_submission_order() {
    let harness = TestHarness::new(
        r#"name="$(basename "$1")"
echo "start $name" >> "$MARKER_DIR/order"
sleep 0.2
echo "end $name" >> "$MARKER_DIR/order""#,
    );

    let ids = [
        harness.submit("c.mkv"),
        harness.submit("a.mkv"),
        harness.submit("b.mkv"),
    ];
    let mut max_processing = 0;
    while harness.queue.status().pending > 0 || harness.queue.status().processing.is_some() {
        let processing = harness
            .queue
            .list(&ListQuery::with_status(JobStatus::Processing))
            .total;
        max_processing = max_processing.max(processing);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    harness.queue.wait_until_idle().await;

    assert!(max_processing <= 1);
    for id in ids {
        assert_eq!(harness.queue.get(id).unwrap().status, JobStatus::Completed);
    }
    let order = std::fs::read_to_string(harness.dir.path().join("markers/order")).unwrap();
    assert_eq!(
        order.lines().collect::<Vec<_>>(),
        ["start c.mkv", "end c.mkv", "start a.mkv", "end a.mkv", "start b.mkv", "end b.mkv"]
    );
}

#[tokio::test]
async fn duplicate_and_missing_sources_are_rejected() {
    let harness = TestHarness::new(SLOW_SCRIPT);
    let source = harness.source("movie.mkv");

    harness
        .queue
        .submit(&source, ConversionMode::Default, ConversionSettings::default())
        .unwrap();
    let duplicate =
        harness
            .queue
            .submit(&source, ConversionMode::Animated, ConversionSettings::default());
    assert_matches!(duplicate, Err(Error::Conflict(_)));

    let missing = harness.queue.submit(
        harness.dir.path().join("missing.mkv"),
        ConversionMode::Default,
        ConversionSettings::default(),
    );
    assert_matches!(missing, Err(Error::NotFound { .. }));

    let bad_settings = ConversionSettings {
        crf: 99,
        ..ConversionSettings::default()
    };
    let other = harness.source("other.mkv");
    assert_matches!(
        harness.queue.submit(&other, ConversionMode::Default, bad_settings),
        Err(Error::Validation(_))
    );

    harness.queue.clear(ClearFilter::All).await;
}

#[tokio::test]
async fn batch_reports_rejected_sources() {
    let harness = TestHarness::new(SUCCESS_SCRIPT);
    let good = harness.source("good.mkv");
    let missing = harness.dir.path().join("missing.mkv");

    let outcome = harness.queue.submit_batch(
        [good, missing.clone()],
        ConversionMode::Default,
        ConversionSettings::default(),
    );

    assert_eq!(outcome.created.len(), 1);
    assert_eq!(outcome.rejected.len(), 1);
    assert_eq!(outcome.rejected[0].0, missing);
    harness.wait_for_status(outcome.created[0], JobStatus::Completed).await;
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelling_processing_job_stops_pipeline_and_removes_temp() {
    let harness = TestHarness::new(SLOW_SCRIPT);
    let mut events = harness.queue.subscribe();

    let id = harness.submit("movie.mkv");
    let job = harness
        .wait_for(id, |job| job.log.contains("STATUS:started"))
        .await;
    let temp = harness.temp_artifact(&job);
    assert!(temp.exists());
    let child = harness.child_pid("movie.mkv");
    assert!(!process_gone(child));

    let started = Instant::now();
    assert!(harness.queue.cancel(id).await.unwrap());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(wait_gone(child).await, "pipeline child {child} outlived the cancel");

    let job = harness.queue.get(id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.error_message.is_none());
    assert!(job.log.contains("Cancelled by user"));
    assert!(!temp.exists());
    assert!(!job.output_path.exists());
    events_until_status(&mut events, id, JobStatus::Cancelled).await;

    // Cancelling again is a no-op.
    assert!(!harness.queue.cancel(id).await.unwrap());
}

#[tokio::test]
async fn cancelling_pending_job_never_starts_it() {
    let harness = TestHarness::new(SLOW_SCRIPT);

    let first = harness.submit("first.mkv");
    let second = harness.submit("second.mkv");
    harness
        .wait_for_status(first, JobStatus::Processing)
        .await;

    assert!(harness.queue.cancel(second).await.unwrap());
    assert_eq!(harness.queue.get(second).unwrap().status, JobStatus::Cancelled);

    assert!(harness.queue.cancel(first).await.unwrap());
    harness.queue.wait_until_idle().await;

    assert!(harness.pipeline_ran_for("first.mkv"));
    assert!(!harness.pipeline_ran_for("second.mkv"));
}

#[tokio::test]
async fn cancel_unknown_job_is_not_found() {
    let harness = TestHarness::new(SUCCESS_SCRIPT);
    let result = harness.queue.cancel(encodeforge_common::JobId::new()).await;
    assert_matches!(result, Err(Error::NotFound { .. }));
}

// ---------------------------------------------------------------------------
// Removal
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_removes_finished_and_cancels_active() {
    let harness = TestHarness::new(SLOW_SCRIPT);

    let active = harness.submit("active.mkv");
    harness.wait_for_status(active, JobStatus::Processing).await;

    assert_eq!(harness.queue.delete(active).await.unwrap(), Removal::Cancelled);
    assert_eq!(harness.queue.get(active).unwrap().status, JobStatus::Cancelled);

    assert_eq!(harness.queue.delete(active).await.unwrap(), Removal::Deleted);
    assert!(harness.queue.get(active).is_none());
    assert_matches!(
        harness.queue.delete(active).await,
        Err(Error::NotFound { .. })
    );
}

#[tokio::test]
async fn clear_all_stops_processing_and_empties_queue() {
    let harness = TestHarness::new(SLOW_SCRIPT);

    let first = harness.submit("first.mkv");
    harness.submit("second.mkv");
    let job = harness
        .wait_for(first, |job| job.log.contains("STATUS:started"))
        .await;

    let child = harness.child_pid("first.mkv");
    assert!(!process_gone(child));

    let removed = harness.queue.clear(ClearFilter::All).await;

    assert_eq!(removed, 2);
    assert_eq!(harness.queue.list(&ListQuery::default()).total, 0);
    let status = harness.queue.status();
    assert_eq!(status.pending, 0);
    assert!(status.processing.is_none());
    assert!(!harness.temp_artifact(&job).exists());
    assert!(!harness.pipeline_ran_for("second.mkv"));
    assert!(wait_gone(child).await, "pipeline child {child} outlived the clear");
}

#[tokio::test]
async fn clear_all_removes_jobs_submitted_while_it_runs() {
    // Ignores SIGTERM so the clear spends the grace period waiting.
    let harness = TestHarness::new(&format!("trap '' TERM\n{SLOW_SCRIPT}"));

    let first = harness.submit("first.mkv");
    harness
        .wait_for(first, |job| job.log.contains("STATUS:started"))
        .await;

    let queue = harness.queue.clone();
    let clear = tokio::spawn(async move { queue.clear(ClearFilter::All).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let late = harness.submit("late.mkv");

    assert_eq!(clear.await.unwrap(), 2);
    assert!(harness.queue.get(late).is_none());
    assert_eq!(harness.queue.list(&ListQuery::default()).total, 0);
    assert!(harness.queue.status().processing.is_none());
    assert!(!harness.pipeline_ran_for("late.mkv"));

    // The worker picks up new work once the clear is over.
    let next = harness.submit("next.mkv");
    harness.wait_for_status(next, JobStatus::Processing).await;
    assert!(harness.queue.cancel(next).await.unwrap());
}

#[tokio::test]
async fn clear_finished_keeps_active_jobs() {
    let harness = TestHarness::new(SUCCESS_SCRIPT);

    let done = harness.submit("done.mkv");
    harness.wait_for_status(done, JobStatus::Completed).await;

    assert_eq!(harness.queue.clear(ClearFilter::Finished).await, 1);
    assert!(harness.queue.get(done).is_none());
    assert_eq!(harness.queue.clear(ClearFilter::Finished).await, 0);
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_cancels_processing_and_leaves_pending() {
    let harness = TestHarness::new(SLOW_SCRIPT);

    let first = harness.submit("first.mkv");
    let second = harness.submit("second.mkv");
    let job = harness
        .wait_for(first, |job| job.log.contains("STATUS:started"))
        .await;
    let mut events = harness.queue.subscribe();

    harness.queue.shutdown().await;

    assert_eq!(harness.queue.get(first).unwrap().status, JobStatus::Cancelled);
    assert_eq!(harness.queue.get(second).unwrap().status, JobStatus::Pending);
    assert!(!harness.temp_artifact(&job).exists());
    assert!(!harness.queue.status().worker_running);

    // The hub is closed: buffered events drain, then the stream ends.
    while events.recv().await.is_some() {}
}
