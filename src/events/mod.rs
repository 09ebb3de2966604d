//! Job lifecycle and progress events for real-time observers.
//!
//! [`EventHub`] fans each published [`Event`] out to every registered
//! observer through a bounded per-observer mailbox.

mod hub;

pub use hub::{EventHub, Subscription};

use chrono::{DateTime, Utc};
use encodeforge_common::JobId;
use encodeforge_protocol::Stage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::{Job, JobStatus};

// ---------------------------------------------------------------------------
// EventPayload
// ---------------------------------------------------------------------------

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Live progress of the processing job.
    JobProgress {
        job_id: JobId,
        percent: f64,
        fps: Option<f64>,
        eta_seconds: Option<f64>,
        frame: Option<u64>,
        total_frames: Option<u64>,
        stage: Stage,
        log_tail: String,
    },
    /// A job changed status.
    JobStatus {
        job_id: JobId,
        status: JobStatus,
        error: Option<String>,
    },
    /// Membership of the job list changed; observers should re-fetch it.
    QueueUpdate,
}

impl EventPayload {
    /// Progress payload from a job snapshot.
    pub fn progress(job: &Job, log_tail_lines: usize) -> Self {
        EventPayload::JobProgress {
            job_id: job.id,
            percent: job.progress.percent,
            fps: job.progress.fps,
            eta_seconds: job.progress.eta_seconds,
            frame: job.progress.frame,
            total_frames: job.progress.total_frames,
            stage: job.progress.stage.clone(),
            log_tail: job.log_tail(log_tail_lines),
        }
    }

    /// Status payload from a job snapshot.
    pub fn status(job: &Job) -> Self {
        EventPayload::JobStatus {
            job_id: job.id,
            status: job.status,
            error: job.error_message.clone(),
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            EventPayload::JobProgress { job_id, .. } | EventPayload::JobStatus { job_id, .. } => {
                Some(*job_id)
            }
            EventPayload::QueueUpdate => None,
        }
    }

    pub fn is_progress(&self) -> bool {
        matches!(self, EventPayload::JobProgress { .. })
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A timestamped event ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier.
    pub id: Uuid,
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// Create a new event with a fresh UUID and the current timestamp.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ConversionMode, ConversionSettings};
    use std::path::PathBuf;

    #[test]
    fn event_serializes_with_type_tag() {
        let job_id = JobId::new();
        let event = Event::new(EventPayload::JobStatus {
            job_id,
            status: JobStatus::Failed,
            error: Some("no audio streams found".into()),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_status");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "no audio streams found");
        assert_eq!(json["job_id"], job_id.to_string());

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn queue_update_has_no_payload_fields() {
        let json = serde_json::to_value(Event::new(EventPayload::QueueUpdate)).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj["type"], "queue_update");
        assert_eq!(obj.len(), 3); // id, timestamp, type
    }

    #[test]
    fn progress_payload_carries_log_tail() {
        let mut job = Job::new(
            PathBuf::from("/v/a.mkv"),
            PathBuf::from("/v/a_conv.mkv"),
            ConversionMode::Default,
            ConversionSettings::default(),
        );
        job.append_log("STAGE:encoding");
        job.append_log("Frame: 10 | FPS: 5.0 | Size: N/A | Bitrate: N/A");
        job.progress.percent = 12.5;

        match EventPayload::progress(&job, 1) {
            EventPayload::JobProgress {
                percent, log_tail, ..
            } => {
                assert_eq!(percent, 12.5);
                assert!(log_tail.starts_with("Frame: 10"));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }
}
