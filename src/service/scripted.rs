//! In-memory [`TestLabService`] replaying canned responses.
//!
//! Matrix snapshots are served in order; once the script runs out the last
//! snapshot repeats, like a settled matrix would.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::TestLabService;
use crate::error::{LabError, LabResult};
use crate::model::{
    DimensionValue, ExecutionRecord, MatrixAck, MatrixState, ResultLocation, StepOutcome,
    StepResult, TestCaseResult, TestMatrix,
};
use crate::submission::TestMatrixPayload;

pub(crate) struct ScriptedService {
    bucket: String,
    ack: MatrixAck,
    matrices: Mutex<VecDeque<TestMatrix>>,
    last_matrix: Mutex<Option<TestMatrix>>,
    steps: Vec<StepResult>,
    test_cases: HashMap<String, Vec<TestCaseResult>>,
    pub submitted: Mutex<Vec<TestMatrixPayload>>,
    pub bucket_calls: AtomicUsize,
    pub matrix_calls: AtomicUsize,
    pub step_calls: AtomicUsize,
    pub test_case_calls: AtomicUsize,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self {
            bucket: "test-lab-default-bucket".to_string(),
            ack: MatrixAck {
                matrix_id: Some(MATRIX_ID.to_string()),
                state: Some(MatrixState::Validating),
            },
            matrices: Mutex::new(VecDeque::new()),
            last_matrix: Mutex::new(None),
            steps: Vec::new(),
            test_cases: HashMap::new(),
            submitted: Mutex::new(Vec::new()),
            bucket_calls: AtomicUsize::new(0),
            matrix_calls: AtomicUsize::new(0),
            step_calls: AtomicUsize::new(0),
            test_case_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_ack(mut self, ack: MatrixAck) -> Self {
        self.ack = ack;
        self
    }

    pub fn with_matrices(self, matrices: Vec<TestMatrix>) -> Self {
        *self.matrices.lock().unwrap() = matrices.into();
        self
    }

    pub fn with_step(mut self, step: StepResult, cases: Vec<TestCaseResult>) -> Self {
        self.test_cases.insert(step.step_id.clone(), cases);
        self.steps.push(step);
        self
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TestLabService for ScriptedService {
    async fn default_bucket(&self, _project: &str) -> LabResult<String> {
        self.bucket_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.bucket.clone())
    }

    async fn submit_matrix(
        &self,
        _project: &str,
        payload: &TestMatrixPayload,
    ) -> LabResult<MatrixAck> {
        self.submitted.lock().unwrap().push(payload.clone());
        Ok(self.ack.clone())
    }

    async fn get_matrix(&self, _project: &str, _matrix_id: &str) -> LabResult<TestMatrix> {
        self.matrix_calls.fetch_add(1, Ordering::SeqCst);
        let mut last = self.last_matrix.lock().unwrap();
        if let Some(next) = self.matrices.lock().unwrap().pop_front() {
            *last = Some(next);
        }
        last.clone()
            .ok_or_else(|| LabError::protocol("no scripted matrix"))
    }

    async fn list_steps(
        &self,
        _project: &str,
        _location: &ResultLocation,
    ) -> LabResult<Vec<StepResult>> {
        self.step_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.steps.clone())
    }

    async fn list_test_cases(
        &self,
        _project: &str,
        _location: &ResultLocation,
        step_id: &str,
    ) -> LabResult<Vec<TestCaseResult>> {
        self.test_case_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.test_cases.get(step_id).cloned().unwrap_or_default())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub const MATRIX_ID: &str = "matrix-abc";

pub fn location() -> ResultLocation {
    ResultLocation {
        history_id: "bh.1".to_string(),
        execution_id: "5555".to_string(),
    }
}

/// A snapshot without result ids.
pub fn matrix(state: &str) -> TestMatrix {
    TestMatrix {
        id: MATRIX_ID.to_string(),
        state: MatrixState::from_wire(state),
        result_location: None,
        invalid_detail: None,
        result_storage: None,
        timestamp: None,
        executions: Vec::new(),
    }
}

/// A snapshot with result ids and storage.
pub fn traceable(state: &str) -> TestMatrix {
    TestMatrix {
        result_location: Some(location()),
        result_storage: Some("gs://bucket/run/".to_string()),
        ..matrix(state)
    }
}

pub fn finished(executions: &[(&str, &str)]) -> TestMatrix {
    TestMatrix {
        executions: executions
            .iter()
            .map(|(id, state)| ExecutionRecord {
                id: id.to_string(),
                state: MatrixState::from_wire(state),
                progress_messages: Vec::new(),
            })
            .collect(),
        ..traceable("FINISHED")
    }
}

pub fn step(id: &str, model: &str, outcome: &str) -> StepResult {
    StepResult {
        step_id: id.to_string(),
        dimensions: vec![
            DimensionValue {
                key: "Model".to_string(),
                value: model.to_string(),
            },
            DimensionValue {
                key: "Version".to_string(),
                value: "15.7".to_string(),
            },
        ],
        outcome: StepOutcome::from_wire(outcome),
        process_duration: Some(Duration::from_secs(65)),
        run_duration: Some(Duration::from_secs(130)),
    }
}

pub fn passed(name: &str) -> TestCaseResult {
    TestCaseResult {
        name: name.to_string(),
        status: None,
    }
}

pub fn with_status(name: &str, status: &str) -> TestCaseResult {
    TestCaseResult {
        name: name.to_string(),
        status: Some(status.to_string()),
    }
}
