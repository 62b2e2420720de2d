//! Job tracker (§4.4): sticky job status, received-image counter, and the
//! per-job pixel offsets to skip (carried over from the option state at
//! `start` time, §4.5).

use crate::device::options::AxisWindow;
use crate::error::Status;

/// Sticky status tracked across the lifetime of one job (§3, §4.4).
#[derive(Debug)]
pub struct JobTracker {
    status: Status,
    images_received: u64,
    job_uri: Option<String>,
    failed_attempts: u32,
    pub skip_x: AxisWindow,
    pub skip_y: AxisWindow,
}

impl Default for JobTracker {
    fn default() -> Self {
        JobTracker {
            status: Status::Good,
            images_received: 0,
            job_uri: None,
            failed_attempts: 0,
            skip_x: AxisWindow::default(),
            skip_y: AxisWindow::default(),
        }
    }
}

impl JobTracker {
    pub fn reset(&mut self, skip_x: AxisWindow, skip_y: AxisWindow) {
        *self = JobTracker { skip_x, skip_y, ..JobTracker::default() };
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn images_received(&self) -> u64 {
        self.images_received
    }

    pub fn job_uri(&self) -> Option<&str> {
        self.job_uri.as_deref()
    }

    pub fn set_job_uri(&mut self, uri: String) {
        self.job_uri = Some(uri);
        self.failed_attempts = 0;
    }

    pub fn clear_job_uri(&mut self) {
        self.job_uri = None;
    }

    pub fn note_image_received(&mut self) {
        self.images_received += 1;
        self.failed_attempts = 0;
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn note_retry(&mut self) -> u32 {
        self.failed_attempts += 1;
        self.failed_attempts
    }

    /// Apply §4.4's sticky-status rule. Returns `true` if the image queue
    /// must now be purged (only `Cancelled` does that).
    #[must_use]
    pub fn set_status(&mut self, status: Status) -> bool {
        match status {
            Status::Good => false,
            Status::Cancelled => {
                self.status = Status::Cancelled;
                true
            }
            other => {
                if self.images_received == 0 && !self.status.is_sticky_error() {
                    self.status = other;
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn good_is_ignored() {
        let mut job = JobTracker::default();
        assert!(!job.set_status(Status::Good));
        assert_eq!(job.status(), Status::Good);
    }

    #[test]
    fn first_error_wins_before_any_image() {
        let mut job = JobTracker::default();
        job.set_status(Status::IoError);
        job.set_status(Status::NoMem);
        assert_eq!(job.status(), Status::IoError);
    }

    #[test]
    fn error_is_suppressed_after_an_image_was_delivered() {
        let mut job = JobTracker::default();
        job.note_image_received();
        job.set_status(Status::IoError);
        assert_eq!(job.status(), Status::Good);
    }

    #[test]
    fn cancelled_always_overrides_and_requests_a_purge() {
        let mut job = JobTracker::default();
        job.note_image_received();
        job.set_status(Status::IoError);
        assert_eq!(job.status(), Status::Good);

        let purge = job.set_status(Status::Cancelled);
        assert!(purge);
        assert_eq!(job.status(), Status::Cancelled);

        // Cancelled dominates even a later error (§9 open question).
        let purge_again = job.set_status(Status::IoError);
        assert!(!purge_again);
        assert_eq!(job.status(), Status::Cancelled);
    }

    #[test]
    fn retry_counter_resets_on_progress() {
        let mut job = JobTracker::default();
        job.note_retry();
        job.note_retry();
        assert_eq!(job.failed_attempts(), 2);
        job.set_job_uri("http://x/ScanJobs/1".to_string());
        assert_eq!(job.failed_attempts(), 0);
    }
}
