//! Matrix status polling.
//!
//! The poller runs one status fetch per iteration and pauses for a fixed
//! interval after each fetch returns. The interval is constant; there is no
//! backoff.
//!
//! ```text
//!            ┌──────────────── sleep(interval) ◄──────────────┐
//!            ▼                                                 │
//!   get_matrix ──► ids seen for the first time? ── link event  │
//!            │          └─ async mode ──► Detached             │
//!            │                                                 │
//!            ├─ VALIDATING / PENDING / RUNNING ────────────────┘
//!            ├─ FINISHED ──────────────────────► Finished(matrix)
//!            ├─ ERROR / INVALID / CANCELLED ... ► LabError::Job
//!            └─ anything else ─────────────────► LabError::UnknownState
//! ```
//!
//! Cancellation and the optional deadline are checked before every fetch and
//! interrupt the sleep between fetches.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{LabError, LabResult};
use crate::model::{ConsoleLinks, MatrixPhase, TestMatrix, invalid_detail_message};
use crate::report::Reporter;
use crate::service::TestLabService;

/// How a poll loop ended without an error.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The matrix reached `FINISHED`.
    Finished(TestMatrix),
    /// Async mode returned as soon as the result ids appeared.
    Detached {
        matrix: TestMatrix,
        console_url: String,
    },
}

/// Drives the status loop for a single matrix.
pub struct StatusPoller<'a, S> {
    service: &'a S,
    project: &'a str,
    links: &'a ConsoleLinks,
    interval: Duration,
    async_mode: bool,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl<'a, S: TestLabService> StatusPoller<'a, S> {
    /// Creates a poller that waits `interval` between fetches.
    pub fn new(
        service: &'a S,
        project: &'a str,
        links: &'a ConsoleLinks,
        interval: Duration,
    ) -> Self {
        Self {
            service,
            project,
            links,
            interval,
            async_mode: false,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Return as soon as the result ids appear.
    pub fn with_async_mode(mut self, async_mode: bool) -> Self {
        self.async_mode = async_mode;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Abort with [`LabError::Cancelled`] once `max_wait` has elapsed.
    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.deadline = max_wait.map(|wait| Instant::now() + wait);
        self
    }

    /// Polls `matrix_id` until it finishes, fails or detaches.
    ///
    /// # Errors
    ///
    /// - [`LabError::Job`] when the matrix reaches a known error state
    /// - [`LabError::UnknownState`] for any state outside the known set
    /// - [`LabError::Cancelled`] on cancellation or when the deadline passes
    /// - any error from the service's status fetch
    pub async fn poll<R: Reporter>(&self, matrix_id: &str, reporter: &R) -> LabResult<PollOutcome> {
        let mut link_announced = false;

        loop {
            self.check_interrupted(matrix_id)?;

            let matrix = self.service.get_matrix(self.project, matrix_id).await?;
            debug!("Test matrix {} status: {}", matrix_id, matrix.state);
            reporter.on_matrix_update(&matrix).await;

            if !link_announced && let Some(location) = &matrix.result_location {
                link_announced = true;
                let url = self.links.matrix_url(location);
                info!("Test results will be available at {}", url);
                reporter.on_results_link(&url).await;

                if self.async_mode {
                    return Ok(PollOutcome::Detached {
                        matrix,
                        console_url: url,
                    });
                }
            }

            match matrix.state.phase() {
                MatrixPhase::InFlight => {}
                MatrixPhase::Finished => return Ok(PollOutcome::Finished(matrix)),
                MatrixPhase::Failed => return Err(job_error(&matrix)),
                MatrixPhase::Unknown => {
                    return Err(LabError::UnknownState(matrix.state.as_str().to_string()));
                }
            }

            tokio::select! {
                _ = tokio::time::sleep_until(self.next_wake()) => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }

    /// End of the pause after a fetch, never past the deadline.
    fn next_wake(&self) -> Instant {
        let wake = Instant::now() + self.interval;
        self.deadline.map_or(wake, |deadline| wake.min(deadline))
    }

    fn check_interrupted(&self, matrix_id: &str) -> LabResult<()> {
        if self.cancel.is_cancelled() {
            return Err(LabError::Cancelled(format!(
                "stopped waiting for test matrix {matrix_id}"
            )));
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(LabError::Cancelled(format!(
                "test matrix {matrix_id} did not finish within the configured wait time"
            )));
        }
        Ok(())
    }
}

fn job_error(matrix: &TestMatrix) -> LabError {
    let mut message = matrix
        .state
        .failure_message()
        .unwrap_or("The test matrix failed")
        .to_string();

    if let Some(detail) = matrix.invalid_detail.as_deref().and_then(invalid_detail_message) {
        message.push_str(": ");
        message.push_str(detail);
    }

    LabError::Job {
        state: matrix.state.clone(),
        message,
    }
}
