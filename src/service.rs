//! Remote Test Lab service abstraction.
//!
//! [`TestLabService`] is a stateless request/response wrapper around the
//! operations a run needs. It owns no polling logic: the
//! [`StatusPoller`](crate::orchestrator::StatusPoller) decides when to call
//! it and what the answers mean.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        TestLabService                          │
//! │                                                                │
//! │  default_bucket(project)            Tool Results settings     │
//! │  submit_matrix(project, payload)    Testing API (not idempotent)│
//! │  get_matrix(project, id)            Testing API               │
//! │  list_steps(project, location)      Tool Results, paginated   │
//! │  list_test_cases(project, loc, step) Tool Results, paginated  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every operation fails with a fatal [`LabError`](crate::error::LabError);
//! nothing is retried at this layer.

pub mod http;
pub mod wire;

#[cfg(test)]
pub(crate) mod scripted;

use async_trait::async_trait;

use crate::error::LabResult;
use crate::model::{MatrixAck, ResultLocation, StepResult, TestCaseResult, TestMatrix};
use crate::submission::TestMatrixPayload;

pub use http::HttpTestLabClient;

/// Page size used for step and test case listings.
pub const PAGE_SIZE: u32 = 100;

/// Operations consumed from the remote device-testing service.
#[async_trait]
pub trait TestLabService: Send + Sync {
    /// Resolves the project's default result bucket.
    ///
    /// Implementations may initialize the project settings on first use and
    /// should cache the answer for their own lifetime.
    async fn default_bucket(&self, project: &str) -> LabResult<String>;

    /// Submits a new test matrix. Not idempotent.
    async fn submit_matrix(
        &self,
        project: &str,
        payload: &TestMatrixPayload,
    ) -> LabResult<MatrixAck>;

    /// Fetches the current snapshot of a matrix.
    async fn get_matrix(&self, project: &str, matrix_id: &str) -> LabResult<TestMatrix>;

    /// Lists every step recorded for an execution.
    async fn list_steps(
        &self,
        project: &str,
        location: &ResultLocation,
    ) -> LabResult<Vec<StepResult>>;

    /// Lists every test case recorded for a step.
    async fn list_test_cases(
        &self,
        project: &str,
        location: &ResultLocation,
        step_id: &str,
    ) -> LabResult<Vec<TestCaseResult>>;

    /// Service name for logging.
    fn name(&self) -> &str;
}
