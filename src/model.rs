//! Domain types for a Test Lab run.
//!
//! These types sit between the wire shapes in [`crate::service::wire`] and the
//! orchestration logic. A run walks a small resource graph:
//!
//! ```text
//! TestMatrix ──► ExecutionRecord (one per device configuration)
//!     │
//!     └─ ResultLocation {history, execution}
//!            └──► StepResult (one per device) ──► TestCaseResult*
//! ```
//!
//! Everything derived from the graph ends up in an [`AggregateOutcome`].

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Locale used when a device entry doesn't specify one.
pub const DEFAULT_LOCALE: &str = "en_US";

/// Orientation used when a device entry doesn't specify one.
pub const DEFAULT_ORIENTATION: &str = "portrait";

/// Target mobile platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Ios => write!(f, "ios"),
            Platform::Android => write!(f, "android"),
        }
    }
}

/// One device configuration in the matrix.
///
/// Model and version are always present; locale and orientation have been
/// defaulted during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub model: String,
    pub version: String,
    pub locale: String,
    pub orientation: String,
}

/// Already-uploaded artifacts, one shape per platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSet {
    Ios {
        /// `gs://` reference to the zipped XCTest bundle.
        test_bundle: String,
        /// Overrides the Xcode version used on the devices.
        xcode_version: Option<String>,
    },
    Android {
        app_apk: String,
        test_apk: String,
        /// Restricts the run to these instrumentation targets.
        test_targets: Vec<String>,
    },
}

impl ArtifactSet {
    pub fn platform(&self) -> Platform {
        match self {
            ArtifactSet::Ios { .. } => Platform::Ios,
            ArtifactSet::Android { .. } => Platform::Android,
        }
    }
}

/// Boolean switches for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFlags {
    pub disable_video: bool,
    pub disable_metrics: bool,
    pub retry_on_failure: bool,
    /// Return as soon as the matrix is traceable instead of waiting for it.
    pub async_mode: bool,
}

/// A normalized, validated job ready to be turned into a submit payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub artifacts: ArtifactSet,
    pub devices: Vec<DeviceDescriptor>,
    pub timeout: Duration,
    pub flags: JobFlags,
    /// `gs://bucket/folder/` where the service writes results.
    pub result_storage: String,
}

impl JobRequest {
    pub fn platform(&self) -> Platform {
        self.artifacts.platform()
    }
}

/// State of a test matrix or of one of its executions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatrixState {
    Validating,
    Pending,
    Running,
    Finished,
    Error,
    UnsupportedEnvironment,
    IncompatibleEnvironment,
    IncompatibleArchitecture,
    Cancelled,
    Invalid,
    /// Anything the service sends that isn't in the list above.
    Unrecognized(String),
}

/// What the poller should do with a matrix in a given state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatrixPhase {
    InFlight,
    Finished,
    Failed,
    Unknown,
}

impl MatrixState {
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "VALIDATING" => MatrixState::Validating,
            "PENDING" => MatrixState::Pending,
            "RUNNING" => MatrixState::Running,
            "FINISHED" => MatrixState::Finished,
            "ERROR" => MatrixState::Error,
            "UNSUPPORTED_ENVIRONMENT" => MatrixState::UnsupportedEnvironment,
            "INCOMPATIBLE_ENVIRONMENT" => MatrixState::IncompatibleEnvironment,
            "INCOMPATIBLE_ARCHITECTURE" => MatrixState::IncompatibleArchitecture,
            "CANCELLED" => MatrixState::Cancelled,
            "INVALID" => MatrixState::Invalid,
            other => MatrixState::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MatrixState::Validating => "VALIDATING",
            MatrixState::Pending => "PENDING",
            MatrixState::Running => "RUNNING",
            MatrixState::Finished => "FINISHED",
            MatrixState::Error => "ERROR",
            MatrixState::UnsupportedEnvironment => "UNSUPPORTED_ENVIRONMENT",
            MatrixState::IncompatibleEnvironment => "INCOMPATIBLE_ENVIRONMENT",
            MatrixState::IncompatibleArchitecture => "INCOMPATIBLE_ARCHITECTURE",
            MatrixState::Cancelled => "CANCELLED",
            MatrixState::Invalid => "INVALID",
            MatrixState::Unrecognized(raw) => raw,
        }
    }

    pub fn phase(&self) -> MatrixPhase {
        match self {
            MatrixState::Validating | MatrixState::Pending | MatrixState::Running => {
                MatrixPhase::InFlight
            }
            MatrixState::Finished => MatrixPhase::Finished,
            MatrixState::Error
            | MatrixState::UnsupportedEnvironment
            | MatrixState::IncompatibleEnvironment
            | MatrixState::IncompatibleArchitecture
            | MatrixState::Cancelled
            | MatrixState::Invalid => MatrixPhase::Failed,
            MatrixState::Unrecognized(_) => MatrixPhase::Unknown,
        }
    }

    /// User-facing message for an error terminal state.
    pub fn failure_message(&self) -> Option<&'static str> {
        let msg = match self {
            MatrixState::Error => {
                "The test matrix failed with an infrastructure error. Check the Test Lab console for details"
            }
            MatrixState::UnsupportedEnvironment => {
                "The requested device environment is not supported by Test Lab"
            }
            MatrixState::IncompatibleEnvironment => {
                "The app is not compatible with the requested device environment"
            }
            MatrixState::IncompatibleArchitecture => {
                "The app is not compatible with the CPU architecture of the requested devices"
            }
            MatrixState::Cancelled => "The test matrix was cancelled",
            MatrixState::Invalid => "The test matrix is invalid",
            _ => return None,
        };
        Some(msg)
    }
}

impl fmt::Display for MatrixState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explains a recognized invalid-matrix detail code.
///
/// Returns `None` for codes we have no message for; callers fall back to the
/// plain state message.
pub fn invalid_detail_message(code: &str) -> Option<&'static str> {
    let msg = match code {
        "MALFORMED_XC_TEST_ZIP" => "The XCTest zip file is malformed",
        "NO_TESTS_IN_XC_TEST_ZIP" => "The XCTest zip does not contain any tests",
        "BUILT_FOR_IOS_SIMULATOR" => {
            "The test bundle was built for the iOS simulator rather than for a physical device"
        }
        "USE_DESTINATION_ARTIFACTS" => {
            "The XCTest run file contains a destination that is not supported"
        }
        "TEST_NOT_APP_HOSTED" => "XCTest tests must be hosted by an app",
        "PLIST_CANNOT_BE_PARSED" => "An Info.plist in the test bundle could not be parsed",
        "MALFORMED_IPA" => "The app IPA is malformed",
        "MALFORMED_APK" => "The app APK is malformed",
        "MALFORMED_TEST_APK" => "The test APK is malformed",
        "NO_MANIFEST" => "The AndroidManifest.xml could not be found",
        "NO_PACKAGE_NAME" => "The APK manifest does not declare a package name",
        "TEST_SAME_AS_APP" => "The test package and the app package are the same",
        "NO_INSTRUMENTATION" => "The test APK does not declare an instrumentation",
        "NO_SIGNATURE" => "The app APK is not signed",
        "INSTRUMENTATION_ORCHESTRATOR_INCOMPATIBLE" => {
            "The test runner class does not support the Android Test Orchestrator"
        }
        "NO_TEST_RUNNER_CLASS" => "The test APK does not declare a test runner class",
        "TEST_ONLY_APK" => "The app APK is marked as test-only",
        "NO_CODE_APK" => "The app APK contains no code",
        "MATRIX_TOO_LARGE" => "The matrix expands to too many device configurations",
        "TEST_QUOTA_EXCEEDED" => "The project has exceeded its Test Lab quota",
        "SERVICE_NOT_ACTIVATED" => "A required cloud service API is not activated for the project",
        _ => return None,
    };
    Some(msg)
}

/// Where the service records results for a matrix.
///
/// Once both ids are known they don't change for the life of the matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultLocation {
    pub history_id: String,
    pub execution_id: String,
}

/// Read-only snapshot of a matrix, refreshed on every poll.
#[derive(Debug, Clone, PartialEq)]
pub struct TestMatrix {
    pub id: String,
    pub state: MatrixState,
    pub result_location: Option<ResultLocation>,
    pub invalid_detail: Option<String>,
    /// `gs://` folder the service writes results into.
    pub result_storage: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub executions: Vec<ExecutionRecord>,
}

/// Acknowledgement returned by the submit operation.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixAck {
    pub matrix_id: Option<String>,
    pub state: Option<MatrixState>,
}

/// One device configuration's run within a matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub id: String,
    pub state: MatrixState,
    pub progress_messages: Vec<String>,
}

impl ExecutionRecord {
    pub fn is_finished(&self) -> bool {
        self.state == MatrixState::Finished
    }
}

/// Summary outcome of a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    Failure,
    Inconclusive,
    Skipped,
    /// Passed after a retry.
    Flaky,
    /// Missing, `unset`, or a value we don't know.
    Unrecognized(String),
}

impl StepOutcome {
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "success" => StepOutcome::Success,
            "failure" => StepOutcome::Failure,
            "inconclusive" => StepOutcome::Inconclusive,
            "skipped" => StepOutcome::Skipped,
            "flaky" => StepOutcome::Flaky,
            other => StepOutcome::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            StepOutcome::Success => "success",
            StepOutcome::Failure => "failure",
            StepOutcome::Inconclusive => "inconclusive",
            StepOutcome::Skipped => "skipped",
            StepOutcome::Flaky => "flaky",
            StepOutcome::Unrecognized(raw) => raw,
        }
    }
}

/// A `key=value` pair describing the device a step ran on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionValue {
    pub key: String,
    pub value: String,
}

/// Recorded result of one device's execution.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub step_id: String,
    pub dimensions: Vec<DimensionValue>,
    pub outcome: StepOutcome,
    pub process_duration: Option<Duration>,
    pub run_duration: Option<Duration>,
}

impl StepResult {
    /// Device label: dimension values in order, space separated, trimmed.
    pub fn device_label(&self) -> String {
        self.dimensions
            .iter()
            .map(|d| d.value.as_str())
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string()
    }
}

/// One test case within a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCaseResult {
    pub name: String,
    /// `None` means the service reported no status, which counts as passed.
    pub status: Option<String>,
}

/// How a test case counts toward a step's totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestCaseVerdict {
    Passed,
    NotPassed,
    Skipped,
}

impl TestCaseResult {
    pub fn verdict(&self) -> TestCaseVerdict {
        match self.status.as_deref() {
            None => TestCaseVerdict::Passed,
            Some("skipped") => TestCaseVerdict::Skipped,
            Some(_) => TestCaseVerdict::NotPassed,
        }
    }
}

/// Builds Test Lab console deep links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLinks {
    host: String,
    project: String,
}

impl ConsoleLinks {
    pub fn new(host: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            host: host.into().trim_end_matches('/').to_string(),
            project: project.into(),
        }
    }

    pub fn matrix_url(&self, location: &ResultLocation) -> String {
        format!(
            "{}/project/{}/testlab/histories/{}/matrices/{}",
            self.host, self.project, location.history_id, location.execution_id
        )
    }

    pub fn step_url(&self, location: &ResultLocation, step_id: &str) -> String {
        format!("{}/executions/{}", self.matrix_url(location), step_id)
    }
}

/// Per-device result, in the order the service listed the steps.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSummary {
    pub label: String,
    pub step_id: String,
    pub outcome: StepOutcome,
    pub total_tests: usize,
    pub passed_tests: usize,
    /// `None` when the step has no countable test cases.
    pub success_percent: Option<usize>,
    pub process_duration: Option<Duration>,
    pub run_duration: Option<Duration>,
    pub test_cases: Vec<TestCaseResult>,
    pub console_url: String,
    /// Rendered human-readable summary.
    pub summary: String,
}

/// Final result of a completed run. Never mutated once built.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateOutcome {
    pub success: bool,
    pub executions_completed: bool,
    pub failed_executions: usize,
    pub failed_steps: usize,
    pub inconclusive_steps: usize,
    pub devices: Vec<DeviceSummary>,
    pub console_url: String,
    pub started_at: Option<DateTime<Utc>>,
}

impl AggregateOutcome {
    /// Failures across executions and steps.
    pub fn failures(&self) -> usize {
        self.failed_executions + self.failed_steps
    }

    pub fn exit_code(&self) -> i32 {
        if self.success { 0 } else { 1 }
    }
}

/// Formats a duration as minutes and seconds, e.g. `2m 5s`.
pub fn format_minutes_seconds(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}m {}s", secs / 60, secs % 60)
}
