//! The job table: every job known to this process, plus the FIFO of jobs
//! waiting for the worker.
//!
//! All access goes through one short-held mutex. Nothing here awaits or does
//! I/O while the lock is held.

mod types;

pub use types::*;

use encodeforge_common::{Error, JobId, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio_util::sync::CancellationToken;

struct Entry {
    /// Insertion order, breaks `created_at` ties when listing.
    seq: u64,
    job: Job,
    /// Present while the job is `processing`.
    cancel: Option<CancellationToken>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Entry>,
    pending: VecDeque<JobId>,
    next_seq: u64,
    /// Outstanding [`ClaimHold`]s. Nothing is claimed while non-zero.
    holds: usize,
}

/// What [`JobTable::request_cancel`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelRequest {
    /// The job was pending and is now `cancelled`.
    Dequeued,
    /// The job is processing; its stop token has been triggered.
    Signalled,
    /// The job had already finished.
    AlreadyTerminal,
}

#[derive(Default)]
pub struct JobTable {
    inner: Mutex<Inner>,
}

/// Keeps [`JobTable::claim_next`] from starting anything until dropped.
#[must_use = "claims resume as soon as the hold is dropped"]
pub struct ClaimHold<'a> {
    table: &'a JobTable,
}

impl Drop for ClaimHold<'_> {
    fn drop(&mut self) {
        let mut inner = self.table.inner.lock();
        inner.holds = inner.holds.saturating_sub(1);
    }
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pending job. Rejects a job whose source or output path belongs to
    /// a job that is still pending or processing.
    pub fn insert(&self, job: Job) -> Result<Job> {
        let mut inner = self.inner.lock();

        if let Some(active) = inner.jobs.values().map(|e| &e.job).find(|j| {
            !j.status.is_terminal()
                && (j.source_path == job.source_path || j.output_path == job.output_path)
        }) {
            return Err(Error::conflict(format!(
                "{} already has an active job ({}, {})",
                job.source_path.display(),
                active.id,
                active.status
            )));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.pending.push_back(job.id);
        inner.jobs.insert(
            job.id,
            Entry {
                seq,
                job: job.clone(),
                cancel: None,
            },
        );
        Ok(job)
    }

    /// Take the oldest pending job and mark it `processing`. The returned
    /// token is the job's stop signal, derived from `parent`.
    ///
    /// Returns `None` while another job is still processing or a
    /// [`ClaimHold`] is alive.
    pub fn claim_next(&self, parent: &CancellationToken) -> Option<(Job, CancellationToken)> {
        let mut inner = self.inner.lock();
        if inner.holds > 0 {
            return None;
        }
        if inner
            .jobs
            .values()
            .any(|e| e.job.status == JobStatus::Processing)
        {
            return None;
        }
        while let Some(id) = inner.pending.pop_front() {
            let Some(entry) = inner.jobs.get_mut(&id) else {
                continue;
            };
            if !entry.job.start() {
                continue;
            }
            let token = parent.child_token();
            entry.cancel = Some(token.clone());
            return Some((entry.job.clone(), token));
        }
        None
    }

    /// Pause claiming. Jobs can still be inserted, they wait as `pending`.
    pub fn hold_claims(&self) -> ClaimHold<'_> {
        self.inner.lock().holds += 1;
        ClaimHold { table: self }
    }

    /// Stop a job: pending jobs are cancelled on the spot, processing jobs
    /// get their stop token triggered and finish through the worker.
    pub fn request_cancel(&self, id: JobId) -> Result<CancelRequest> {
        let mut inner = self.inner.lock();
        let entry = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("job", id))?;

        match entry.job.status {
            JobStatus::Pending => {
                entry.job.cancel();
                inner.pending.retain(|p| *p != id);
                Ok(CancelRequest::Dequeued)
            }
            JobStatus::Processing => {
                if let Some(token) = &entry.cancel {
                    token.cancel();
                }
                Ok(CancelRequest::Signalled)
            }
            _ => Ok(CancelRequest::AlreadyTerminal),
        }
    }

    /// Run `f` against a job. Returns `None` if the job no longer exists.
    pub fn update<R>(&self, id: JobId, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        let entry = inner.jobs.get_mut(&id)?;
        let result = f(&mut entry.job);
        if entry.job.status.is_terminal() {
            entry.cancel = None;
        }
        Some(result)
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.inner.lock().jobs.get(&id).map(|e| e.job.clone())
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.inner.lock().jobs.get(&id).map(|e| e.job.status)
    }

    /// Remove a terminal job. Non-terminal jobs are left alone.
    pub fn remove_terminal(&self, id: JobId) -> Result<Job> {
        let mut inner = self.inner.lock();
        let entry = inner
            .jobs
            .get(&id)
            .ok_or_else(|| Error::not_found("job", id))?;
        if !entry.job.status.is_terminal() {
            return Err(Error::conflict(format!("job {id} is {}", entry.job.status)));
        }
        inner
            .jobs
            .remove(&id)
            .map(|e| e.job)
            .ok_or_else(|| Error::not_found("job", id))
    }

    /// Remove every job whose status satisfies `pred`. Pending jobs removed
    /// this way never start.
    pub fn remove_where(&self, pred: impl Fn(JobStatus) -> bool) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.jobs.len();
        inner.jobs.retain(|_, e| !pred(e.job.status));
        let Inner { jobs, pending, .. } = &mut *inner;
        pending.retain(|id| jobs.contains_key(id));
        before - jobs.len()
    }

    /// Newest first, filtered and paginated.
    pub fn list(&self, query: &ListQuery) -> JobPage {
        let query = query.normalized();
        let inner = self.inner.lock();

        let mut matching: Vec<&Entry> = inner
            .jobs
            .values()
            .filter(|e| query.status.map_or(true, |s| e.job.status == s))
            .collect();
        matching.sort_by(|a, b| {
            b.job
                .created_at
                .cmp(&a.job.created_at)
                .then(b.seq.cmp(&a.seq))
        });

        JobPage {
            total: matching.len(),
            jobs: matching
                .into_iter()
                .skip(query.offset)
                .take(query.limit)
                .map(|e| e.job.clone())
                .collect(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// The job currently `processing`, if any.
    pub fn processing(&self) -> Option<JobId> {
        self.inner
            .lock()
            .jobs
            .values()
            .find(|e| e.job.status == JobStatus::Processing)
            .map(|e| e.job.id)
    }

    pub fn count_where(&self, pred: impl Fn(JobStatus) -> bool) -> usize {
        self.inner
            .lock()
            .jobs
            .values()
            .filter(|e| pred(e.job.status))
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
