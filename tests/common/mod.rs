//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which owns a scratch directory, a fake pipeline
//! script and a started [`JobQueue`] that runs it for every job.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use encodeforge::conversion::{ProcessSupervisor, SupervisorConfig};
use encodeforge::events::{Event, EventHub, EventPayload, Subscription};
use encodeforge::queue::{JobQueue, QueueOptions};
use encodeforge::state::{ConversionMode, ConversionSettings, Job, JobStatus};
use encodeforge_common::JobId;
use tempfile::TempDir;

/// Pipeline that reports progress, writes its temp output and then moves it
/// into place.
pub const SUCCESS_SCRIPT: &str = r#"tmp="$(dirname "$2")/.$(basename "$2").tmp"
echo "STAGE:initializing"
echo "total_frames=100"
echo "STAGE:encoding"
echo "CMD:ffmpeg -i $1"
echo "frame=50"
echo "fps=25.0"
echo "progress=continue"
echo "encoded" > "$tmp"
mv "$tmp" "$2"
echo "STATUS:Conversion complete"
echo "STAGE:complete""#;

/// Pipeline that writes a temp artifact, starts a background child, says so,
/// then runs until stopped. The child's pid lands in `$MARKER_DIR/<name>.child`.
pub const SLOW_SCRIPT: &str = r#"touch "$MARKER_DIR/$(basename "$1")"
tmp="$(dirname "$2")/.$(basename "$2").tmp"
echo "STAGE:encoding"
echo "partial" > "$tmp"
sleep 30 &
echo $! > "$MARKER_DIR/$(basename "$1").child"
echo "STATUS:started"
wait"#;

/// Pipeline that finishes at once but leaves a child holding its stdout.
pub const ORPHANING_SCRIPT: &str = r#"sleep 30 &
echo $! > "$MARKER_DIR/$(basename "$1").child"
echo "STAGE:complete"
exit 0"#;

/// Test harness wrapping a started [`JobQueue`] whose pipeline is a shell
/// script.
pub struct TestHarness {
    pub dir: TempDir,
    pub queue: JobQueue,
}

impl TestHarness {
    /// Harness whose pipeline runs `body` as a `#!/bin/sh` script.
    pub fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let program = write_script(dir.path(), "pipeline.sh", body);
        Self::with_program(dir, program)
    }

    /// Harness whose pipeline is `program`, which need not exist.
    pub fn with_program(dir: TempDir, program: PathBuf) -> Self {
        let markers = dir.path().join("markers");
        std::fs::create_dir_all(&markers).expect("failed to create marker dir");

        let temp_dir = dir.path().join("work");
        let supervisor = ProcessSupervisor::new(SupervisorConfig {
            program,
            leading_args: Vec::new(),
            temp_dir: temp_dir.clone(),
            path_env: "/usr/local/bin:/usr/bin:/bin".into(),
            extra_env: vec![("MARKER_DIR".into(), markers.display().to_string())],
            termination_grace: Duration::from_millis(200),
            stderr_limit: 4096,
        });
        let options = QueueOptions {
            temp_dir,
            ..QueueOptions::default()
        };

        let queue = JobQueue::new(supervisor, EventHub::new(256), options);
        queue.start();
        Self { dir, queue }
    }

    /// Create a source file in the scratch directory.
    pub fn source(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, b"source").expect("failed to write source");
        std::fs::canonicalize(&path).expect("failed to canonicalize source")
    }

    /// Queue `name` with default settings.
    pub fn submit(&self, name: &str) -> JobId {
        let source = self.source(name);
        self.queue
            .submit(source, ConversionMode::Default, ConversionSettings::default())
            .expect("submit failed")
    }

    /// Whether the pipeline was ever started for the source named `name`.
    pub fn pipeline_ran_for(&self, name: &str) -> bool {
        self.dir.path().join("markers").join(name).exists()
    }

    /// Pid of the background child the pipeline for `name` recorded.
    pub fn child_pid(&self, name: &str) -> i32 {
        let path = self.dir.path().join("markers").join(format!("{name}.child"));
        std::fs::read_to_string(&path)
            .expect("no child pid recorded")
            .trim()
            .parse()
            .expect("bad child pid")
    }

    /// Hidden temp artifact the scripts write for `job`.
    pub fn temp_artifact(&self, job: &Job) -> PathBuf {
        encodeforge_common::paths::temp_output_path(&job.output_path)
    }

    /// Poll until `pred` holds for the job, panicking after 10 seconds.
    pub async fn wait_for(&self, id: JobId, pred: impl Fn(&Job) -> bool) -> Job {
        wait_for(&self.queue, id, pred).await
    }

    pub async fn wait_for_status(&self, id: JobId, status: JobStatus) -> Job {
        self.wait_for(id, |job| job.status == status).await
    }
}

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("failed to write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("failed to chmod script");
    path
}

pub async fn wait_for(queue: &JobQueue, id: JobId, pred: impl Fn(&Job) -> bool) -> Job {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(job) = queue.get(id) {
            if pred(&job) {
                return job;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting on job {id}: {:?}", queue.get(id));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Whether `pid` has exited. A zombie counts, it only waits to be reaped.
pub fn process_gone(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/status")) {
        Ok(status) => status
            .lines()
            .any(|l| l.starts_with("State:") && l.contains('Z')),
        Err(_) => nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err(),
    }
}

/// Poll until `pid` has exited, giving up after 5 seconds.
pub async fn wait_gone(pid: i32) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if process_gone(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Receive events until one has the given status for `id`, returning
/// everything received along the way.
pub async fn events_until_status(
    events: &mut Subscription,
    id: JobId,
    status: JobStatus,
) -> Vec<Event> {
    let mut seen = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = events.recv().await {
            let done = matches!(
                &event.payload,
                EventPayload::JobStatus { job_id, status: s, .. } if *job_id == id && *s == status
            );
            seen.push(event);
            if done {
                return true;
            }
        }
        false
    })
    .await;

    match result {
        Ok(true) => seen,
        _ => panic!("no {status} event for job {id}; saw {seen:#?}"),
    }
}
