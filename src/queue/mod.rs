//! The job queue: submission, cancellation, listing and the single worker.
//!
//! [`JobQueue`] is a cheap handle. Every clone talks to the same job table,
//! event hub and worker task. At most one job is `processing` at a time, and
//! the next pending job is only claimed after the previous pipeline process
//! has fully exited.

mod worker;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use encodeforge_common::paths::{is_video_file, output_path_for};
use encodeforge_common::{Error, JobId, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::conversion::{reset_temp_dir, ProcessSupervisor};
use crate::events::{EventHub, EventPayload, Subscription};
use crate::state::{
    CancelRequest, ConversionMode, ConversionSettings, Job, JobPage, JobStatus, JobTable,
    ListQuery,
};

/// Scheduler knobs.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Inserted before the source extension to name the output.
    pub output_suffix: String,
    /// Log lines carried by each progress event.
    pub log_tail_lines: usize,
    /// Minimum time between progress summaries in a job log.
    pub log_summary_interval: Duration,
    /// Pipeline scratch directory, emptied on start and shutdown.
    pub temp_dir: PathBuf,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl QueueOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            output_suffix: config.queue.output_suffix.clone(),
            log_tail_lines: config.queue.log_tail_lines,
            log_summary_interval: config.queue.log_summary_interval(),
            temp_dir: config.pipeline.temp_dir.clone(),
        }
    }
}

/// Which jobs [`JobQueue::clear`] removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearFilter {
    /// Pending jobs only.
    Queued,
    /// Completed, failed and cancelled jobs.
    Finished,
    /// Everything. The processing job is cancelled first.
    All,
}

impl FromStr for ClearFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "queued" | "pending" => Ok(ClearFilter::Queued),
            "finished" | "completed" | "done" => Ok(ClearFilter::Finished),
            "all" => Ok(ClearFilter::All),
            other => Err(Error::validation(format!("unknown clear filter: {other}"))),
        }
    }
}

/// Result of [`JobQueue::delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The job had finished and is gone from the table.
    Deleted,
    /// The job was still active and is now `cancelled`.
    Cancelled,
}

/// Result of [`JobQueue::submit_batch`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub created: Vec<JobId>,
    /// Sources that were not queued, with the reason.
    pub rejected: Vec<(PathBuf, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub processing: Option<JobId>,
    pub worker_running: bool,
}

struct QueueInner {
    table: JobTable,
    hub: EventHub,
    supervisor: ProcessSupervisor,
    options: QueueOptions,
    /// Wakes the worker when work may be available.
    wake: Notify,
    shutdown: CancellationToken,
    /// Bumped each time the worker finalizes a job.
    settled: watch::Sender<u64>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueueInner {
    fn publish(&self, payload: EventPayload) {
        self.hub.publish(payload);
    }
}

/// Handle to the job queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    pub fn new(supervisor: ProcessSupervisor, hub: EventHub, options: QueueOptions) -> Self {
        let (settled, _) = watch::channel(0);
        Self {
            inner: Arc::new(QueueInner {
                table: JobTable::new(),
                hub,
                supervisor,
                options,
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                settled,
                worker: Mutex::new(None),
            }),
        }
    }

    /// Spawn the worker task. Orphans left in the temp directory by an
    /// earlier run are removed first. Calling this twice is a no-op.
    pub fn start(&self) {
        let mut worker = self.inner.worker.lock();
        if worker.is_some() {
            return;
        }

        match reset_temp_dir(&self.inner.options.temp_dir) {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "Cleaned temp directory"),
            Err(e) => tracing::warn!(
                path = %self.inner.options.temp_dir.display(),
                error = %e,
                "Failed to prepare temp directory"
            ),
        }

        *worker = Some(tokio::spawn(worker::run(self.inner.clone())));
        tracing::info!("Job queue started");
    }

    /// Queue one conversion.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for out-of-range settings or a source that is
    ///   not a regular file
    /// - [`Error::NotFound`] if the source does not exist
    /// - [`Error::Conflict`] if the source or its output already has an
    ///   active job
    pub fn submit(
        &self,
        source: impl AsRef<Path>,
        mode: ConversionMode,
        settings: ConversionSettings,
    ) -> Result<JobId> {
        settings.validate()?;

        let source = source.as_ref();
        let source = std::fs::canonicalize(source).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found("source file", source.display()),
            _ => Error::from(e),
        })?;
        if !source.is_file() {
            return Err(Error::validation(format!(
                "source is not a file: {}",
                source.display()
            )));
        }

        if !is_video_file(&source) {
            tracing::warn!(source = %source.display(), "Source has no known video extension");
        }

        let output = output_path_for(&source, &self.inner.options.output_suffix);
        let job = self
            .inner
            .table
            .insert(Job::new(source, output, mode, settings))?;

        tracing::info!(
            job_id = %job.id,
            source = %job.source_path.display(),
            output = %job.output_path.display(),
            mode = %job.mode,
            "Job queued"
        );
        self.inner.publish(EventPayload::QueueUpdate);
        self.inner.wake.notify_one();
        Ok(job.id)
    }

    /// Queue several conversions in path order. A source that cannot be
    /// queued is reported in [`BatchOutcome::rejected`] and does not stop the
    /// rest of the batch.
    pub fn submit_batch<I, P>(
        &self,
        sources: I,
        mode: ConversionMode,
        settings: ConversionSettings,
    ) -> BatchOutcome
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut sources: Vec<PathBuf> = sources.into_iter().map(Into::into).collect();
        sources.sort();

        let mut outcome = BatchOutcome::default();
        for source in sources {
            match self.submit(&source, mode, settings.clone()) {
                Ok(id) => outcome.created.push(id),
                Err(e) => {
                    tracing::warn!(source = %source.display(), error = %e, "Skipping source");
                    outcome.rejected.push((source, e.to_string()));
                }
            }
        }
        outcome
    }

    /// Cancel a job. A pending job is cancelled on the spot; for a processing
    /// job this waits until its pipeline process has exited.
    ///
    /// Returns `false` if the job had already finished.
    pub async fn cancel(&self, id: JobId) -> Result<bool> {
        match self.inner.table.request_cancel(id)? {
            CancelRequest::Dequeued => {
                tracing::info!(job_id = %id, "Cancelled pending job");
                if let Some(job) = self.inner.table.get(id) {
                    self.inner.publish(EventPayload::status(&job));
                }
                self.inner.publish(EventPayload::QueueUpdate);
                Ok(true)
            }
            CancelRequest::Signalled => {
                tracing::info!(job_id = %id, "Cancelling processing job");
                self.wait_terminal(id).await;
                Ok(true)
            }
            CancelRequest::AlreadyTerminal => Ok(false),
        }
    }

    /// Cancel an active job or remove a finished one.
    pub async fn delete(&self, id: JobId) -> Result<Removal> {
        let status = self
            .inner
            .table
            .status(id)
            .ok_or_else(|| Error::not_found("job", id))?;

        if status.is_terminal() {
            self.inner.table.remove_terminal(id)?;
            tracing::info!(job_id = %id, "Deleted job");
            self.inner.publish(EventPayload::QueueUpdate);
            return Ok(Removal::Deleted);
        }

        self.cancel(id).await?;
        Ok(Removal::Cancelled)
    }

    /// Snapshot of one job, including its full log.
    pub fn get(&self, id: JobId) -> Option<Job> {
        self.inner.table.get(id)
    }

    pub fn list(&self, query: &ListQuery) -> JobPage {
        self.inner.table.list(query)
    }

    /// Remove jobs matching `filter`. Returns how many were removed.
    pub async fn clear(&self, filter: ClearFilter) -> usize {
        let table = &self.inner.table;
        let removed = match filter {
            ClearFilter::Queued => table.remove_where(|s| s == JobStatus::Pending),
            ClearFilter::Finished => table.remove_where(JobStatus::is_terminal),
            ClearFilter::All => {
                // Nothing new may start until the table is empty.
                let hold = table.hold_claims();
                let mut removed = table.remove_where(|s| s == JobStatus::Pending);
                if let Some(id) = table.processing() {
                    if let Err(e) = self.cancel(id).await {
                        tracing::debug!(job_id = %id, error = %e, "Processing job vanished during clear");
                    }
                }
                removed += table.remove_where(|s| s != JobStatus::Processing);
                drop(hold);
                self.inner.wake.notify_one();
                removed
            }
        };

        tracing::info!(?filter, removed, "Cleared jobs");
        if removed > 0 {
            self.inner.publish(EventPayload::QueueUpdate);
        }
        removed
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            pending: self.inner.table.pending_count(),
            processing: self.inner.table.processing(),
            worker_running: self
                .inner
                .worker
                .lock()
                .as_ref()
                .is_some_and(|h| !h.is_finished()),
        }
    }

    /// Register a new observer.
    pub fn subscribe(&self) -> Subscription {
        self.inner.hub.register()
    }

    pub fn hub(&self) -> &EventHub {
        &self.inner.hub
    }

    /// Wait until nothing is pending or processing. Needs a started worker.
    pub async fn wait_until_idle(&self) {
        let mut settled = self.inner.settled.subscribe();
        loop {
            if self.inner.table.pending_count() == 0 && self.inner.table.processing().is_none() {
                return;
            }
            if settled.changed().await.is_err() {
                return;
            }
        }
    }

    /// Cancel the processing job, stop the worker and wait for it, end every
    /// subscription and empty the temp directory. Pending jobs stay pending.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down job queue");
        self.inner.shutdown.cancel();

        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task failed");
            }
        }

        self.inner.hub.close();
        if let Err(e) = reset_temp_dir(&self.inner.options.temp_dir) {
            tracing::warn!(error = %e, "Failed to clean temp directory");
        }
    }

    async fn wait_terminal(&self, id: JobId) {
        let mut settled = self.inner.settled.subscribe();
        loop {
            match self.inner.table.status(id) {
                Some(status) if !status.is_terminal() => {}
                _ => return,
            }
            if settled.changed().await.is_err() {
                return;
            }
        }
    }
}
