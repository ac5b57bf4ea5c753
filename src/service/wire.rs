//! JSON shapes returned by the Testing and Tool Results APIs.
//!
//! Only the fields devicelab reads are modelled. Everything is optional on
//! the wire; the `into_*` conversions decide which absences are protocol
//! violations and which have a defined meaning.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{LabError, LabResult};
use crate::model::{
    DimensionValue, ExecutionRecord, MatrixAck, MatrixState, ResultLocation, StepOutcome,
    StepResult, TestCaseResult, TestMatrix,
};

/// Tool Results project settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSettings {
    pub default_bucket: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTestMatrix {
    pub test_matrix_id: Option<String>,
    pub state: Option<String>,
    pub invalid_matrix_details: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub result_storage: Option<WireResultStorage>,
    #[serde(default)]
    pub test_executions: Vec<WireTestExecution>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireResultStorage {
    pub google_cloud_storage: Option<GcsPath>,
    pub tool_results_execution: Option<ToolResultsExecution>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcsPath {
    pub gcs_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultsExecution {
    pub history_id: Option<String>,
    pub execution_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTestExecution {
    pub id: Option<String>,
    pub state: Option<String>,
    pub test_details: Option<TestDetails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDetails {
    #[serde(default)]
    pub progress_messages: Vec<String>,
    pub error_message: Option<String>,
}

const UNSPECIFIED_STATE: &str = "TEST_STATE_UNSPECIFIED";

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl WireTestMatrix {
    /// Converts a submit acknowledgement. A missing id is left for the caller.
    pub fn into_ack(self) -> MatrixAck {
        MatrixAck {
            matrix_id: non_empty(self.test_matrix_id),
            state: self.state.as_deref().map(MatrixState::from_wire),
        }
    }

    /// Converts a status snapshot.
    ///
    /// `fallback_id` is used when the service omits the id from the body.
    pub fn into_matrix(self, fallback_id: &str) -> TestMatrix {
        let storage = self.result_storage.unwrap_or_default();

        let result_location = storage.tool_results_execution.and_then(|exec| {
            match (non_empty(exec.history_id), non_empty(exec.execution_id)) {
                (Some(history_id), Some(execution_id)) => Some(ResultLocation {
                    history_id,
                    execution_id,
                }),
                _ => None,
            }
        });

        let executions = self
            .test_executions
            .into_iter()
            .enumerate()
            .map(|(idx, exec)| {
                let details = exec.test_details.unwrap_or_default();
                let mut progress_messages = details.progress_messages;
                if let Some(err) = details.error_message {
                    progress_messages.push(err);
                }
                ExecutionRecord {
                    id: exec.id.unwrap_or_else(|| format!("#{idx}")),
                    state: MatrixState::from_wire(
                        exec.state.as_deref().unwrap_or(UNSPECIFIED_STATE),
                    ),
                    progress_messages,
                }
            })
            .collect();

        TestMatrix {
            id: non_empty(self.test_matrix_id).unwrap_or_else(|| fallback_id.to_string()),
            state: MatrixState::from_wire(self.state.as_deref().unwrap_or(UNSPECIFIED_STATE)),
            result_location,
            invalid_detail: non_empty(self.invalid_matrix_details),
            result_storage: storage.google_cloud_storage.and_then(|g| non_empty(g.gcs_path)),
            timestamp: self.timestamp,
            executions,
        }
    }
}

/// Protobuf `int64` values arrive either as JSON numbers or as strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Int64 {
    Number(i64),
    Text(String),
}

impl Int64 {
    fn value(&self) -> Option<i64> {
        match self {
            Int64::Number(n) => Some(*n),
            Int64::Text(s) => s.parse().ok(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireDuration {
    pub seconds: Option<Int64>,
    pub nanos: Option<i32>,
}

impl WireDuration {
    pub fn to_duration(&self) -> Duration {
        let secs = self
            .seconds
            .as_ref()
            .and_then(Int64::value)
            .unwrap_or(0)
            .max(0) as u64;
        let nanos = self.nanos.unwrap_or(0).max(0) as u32;
        Duration::new(secs, nanos)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListStepsResponse {
    #[serde(default)]
    pub steps: Vec<WireStep>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireStep {
    pub step_id: Option<String>,
    #[serde(default)]
    pub dimension_value: Vec<WireDimension>,
    pub outcome: Option<WireOutcome>,
    pub run_duration: Option<WireDuration>,
    pub test_execution_step: Option<TestExecutionStep>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireDimension {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireOutcome {
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestExecutionStep {
    pub test_timing: Option<TestTiming>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestTiming {
    pub test_process_duration: Option<WireDuration>,
}

impl WireStep {
    pub fn into_step(self) -> LabResult<StepResult> {
        let step_id = non_empty(self.step_id)
            .ok_or_else(|| LabError::protocol("Tool Results returned a step without a stepId"))?;

        let outcome = StepOutcome::from_wire(
            self.outcome
                .and_then(|o| o.summary)
                .as_deref()
                .unwrap_or("unset"),
        );

        let process_duration = self
            .test_execution_step
            .and_then(|s| s.test_timing)
            .and_then(|t| t.test_process_duration)
            .map(|d| d.to_duration());

        Ok(StepResult {
            step_id,
            dimensions: self
                .dimension_value
                .into_iter()
                .map(|d| DimensionValue {
                    key: d.key,
                    value: d.value,
                })
                .collect(),
            outcome,
            process_duration,
            run_duration: self.run_duration.map(|d| d.to_duration()),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTestCasesResponse {
    #[serde(default)]
    pub test_cases: Vec<WireTestCase>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTestCase {
    pub test_case_id: Option<String>,
    pub test_case_reference: Option<TestCaseReference>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseReference {
    pub name: Option<String>,
    pub class_name: Option<String>,
}

impl WireTestCase {
    pub fn into_test_case(self) -> TestCaseResult {
        let reference = self.test_case_reference.unwrap_or_default();
        let name = match (non_empty(reference.class_name), non_empty(reference.name)) {
            (Some(class), Some(name)) => format!("{class}.{name}"),
            (None, Some(name)) => name,
            (_, None) => non_empty(self.test_case_id).unwrap_or_else(|| "unnamed".to_string()),
        };

        TestCaseResult {
            name,
            status: self.status,
        }
    }
}

/// A listing that may continue on another page.
pub trait Page: serde::de::DeserializeOwned {
    type Item;

    fn into_parts(self) -> (Vec<Self::Item>, Option<String>);
}

impl Page for ListStepsResponse {
    type Item = WireStep;

    fn into_parts(self) -> (Vec<WireStep>, Option<String>) {
        (self.steps, non_empty(self.next_page_token))
    }
}

impl Page for ListTestCasesResponse {
    type Item = WireTestCase;

    fn into_parts(self) -> (Vec<WireTestCase>, Option<String>) {
        (self.test_cases, non_empty(self.next_page_token))
    }
}

/// Google API error envelope.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorEnvelope {
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    pub code: Option<u16>,
    pub status: Option<String>,
    pub message: Option<String>,
}

/// Summarizes an error response into one line.
pub fn summarize_error(http_status: u16, body: &str) -> String {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|e| e.error);

    match parsed {
        Some(ErrorBody {
            status, message, ..
        }) if message.is_some() || status.is_some() => {
            let status = status.unwrap_or_else(|| "UNKNOWN".to_string());
            match message {
                Some(message) => format!("HTTP {http_status} {status}: {message}"),
                None => format!("HTTP {http_status} {status}"),
            }
        }
        _ => {
            let snippet: String = body.trim().chars().take(200).collect();
            if snippet.is_empty() {
                format!("HTTP {http_status}")
            } else {
                format!("HTTP {http_status}: {snippet}")
            }
        }
    }
}
