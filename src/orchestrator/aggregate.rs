//! Reduction of a finished matrix into an [`AggregateOutcome`].
//!
//! The reduction has two levels:
//!
//! 1. **Executions**: every execution that did not finish counts as a
//!    failure, and the walk carries on with the remaining ones.
//! 2. **Steps**: every step's test cases are tallied, and the step's outcome
//!    summary feeds the failure / inconclusive counters.
//!
//! The verdict is `executions completed && no failing steps && no
//! inconclusive steps`. Test-level failures never abort the run.

use tracing::{debug, warn};

use crate::error::{LabError, LabResult};
use crate::model::{
    AggregateOutcome, ConsoleLinks, DeviceSummary, StepOutcome, StepResult, TestCaseResult,
    TestCaseVerdict, TestMatrix, format_minutes_seconds,
};
use crate::service::TestLabService;

/// Counts for one step's test cases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepTally {
    /// Cases that ran (passed or not). Skipped cases are excluded.
    pub total: usize,
    pub passed: usize,
    pub skipped: usize,
}

impl StepTally {
    pub fn from_cases(cases: &[TestCaseResult]) -> Self {
        cases.iter().fold(Self::default(), |mut tally, case| {
            match case.verdict() {
                TestCaseVerdict::Passed => {
                    tally.total += 1;
                    tally.passed += 1;
                }
                TestCaseVerdict::NotPassed => tally.total += 1,
                TestCaseVerdict::Skipped => tally.skipped += 1,
            }
            tally
        })
    }

    /// Integer success percentage, or `None` when nothing ran.
    pub fn success_percent(&self) -> Option<usize> {
        (self.total > 0).then(|| self.passed * 100 / self.total)
    }
}

/// Which run-level counter a step outcome feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutcomeBucket {
    Pass,
    Failure,
    Inconclusive,
}

fn bucket(outcome: &StepOutcome) -> OutcomeBucket {
    match outcome {
        StepOutcome::Success | StepOutcome::Skipped | StepOutcome::Flaky => OutcomeBucket::Pass,
        StepOutcome::Failure => OutcomeBucket::Failure,
        StepOutcome::Inconclusive | StepOutcome::Unrecognized(_) => OutcomeBucket::Inconclusive,
    }
}

/// Walks a finished matrix and folds its results.
pub struct ResultAggregator<'a, S> {
    service: &'a S,
    project: &'a str,
    links: &'a ConsoleLinks,
}

impl<'a, S: TestLabService> ResultAggregator<'a, S> {
    pub fn new(service: &'a S, project: &'a str, links: &'a ConsoleLinks) -> Self {
        Self {
            service,
            project,
            links,
        }
    }

    /// Fetches steps and test cases for `matrix` and folds them.
    ///
    /// Steps and their test cases are fetched sequentially, in listing order.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::Protocol`] if the matrix has no result location,
    /// and propagates any service error.
    pub async fn aggregate(&self, matrix: &TestMatrix) -> LabResult<AggregateOutcome> {
        let location = matrix.result_location.as_ref().ok_or_else(|| {
            LabError::protocol(format!(
                "matrix {} finished without history/execution ids",
                matrix.id
            ))
        })?;

        let steps = self.service.list_steps(self.project, location).await?;
        debug!("Matrix {} recorded {} steps", matrix.id, steps.len());

        let mut results = Vec::with_capacity(steps.len());
        for step in steps {
            let cases = self
                .service
                .list_test_cases(self.project, location, &step.step_id)
                .await?;
            results.push((step, cases));
        }

        fold(matrix, &results, self.links)
    }
}

/// Folds a finished matrix and its fetched steps into an outcome.
///
/// Pure: folding the same inputs twice yields the same outcome.
pub fn fold(
    matrix: &TestMatrix,
    steps: &[(StepResult, Vec<TestCaseResult>)],
    links: &ConsoleLinks,
) -> LabResult<AggregateOutcome> {
    let location = matrix.result_location.as_ref().ok_or_else(|| {
        LabError::protocol(format!(
            "matrix {} finished without history/execution ids",
            matrix.id
        ))
    })?;

    let mut failed_executions = 0;
    for execution in &matrix.executions {
        if !execution.is_finished() {
            warn!(
                "Test execution {} ended in state {}: {}",
                execution.id,
                execution.state,
                execution.progress_messages.join("; ")
            );
            failed_executions += 1;
        }
    }
    let executions_completed = failed_executions == 0;

    let mut failed_steps = 0;
    let mut inconclusive_steps = 0;
    let mut devices = Vec::with_capacity(steps.len());

    for (step, cases) in steps {
        match bucket(&step.outcome) {
            OutcomeBucket::Pass => {}
            OutcomeBucket::Failure => failed_steps += 1,
            OutcomeBucket::Inconclusive => inconclusive_steps += 1,
        }

        let tally = StepTally::from_cases(cases);
        devices.push(DeviceSummary {
            label: step.device_label(),
            step_id: step.step_id.clone(),
            outcome: step.outcome.clone(),
            total_tests: tally.total,
            passed_tests: tally.passed,
            success_percent: tally.success_percent(),
            process_duration: step.process_duration,
            run_duration: step.run_duration,
            test_cases: cases.clone(),
            console_url: links.step_url(location, &step.step_id),
            summary: render_summary(step, &tally, cases),
        });
    }

    Ok(AggregateOutcome {
        success: executions_completed && failed_steps == 0 && inconclusive_steps == 0,
        executions_completed,
        failed_executions,
        failed_steps,
        inconclusive_steps,
        devices,
        console_url: links.matrix_url(location),
        started_at: matrix.timestamp,
    })
}

/// Placeholder shown instead of a percentage when a step ran no test cases.
pub const NO_TEST_CASES: &str = "No test cases were reported";

fn render_summary(step: &StepResult, tally: &StepTally, cases: &[TestCaseResult]) -> String {
    let mut lines = Vec::new();

    lines.push(match tally.success_percent() {
        Some(percent) => {
            let icon = match percent {
                100 => "✅",
                0 => "❌",
                _ => "⚠️",
            };
            format!(
                "{icon} {}/{} test cases passed, {percent}% success",
                tally.passed, tally.total
            )
        }
        None => format!("⚠️ {NO_TEST_CASES}"),
    });

    lines.push(format!("Outcome: {}", step.outcome.as_str()));
    if tally.skipped > 0 {
        lines.push(format!("Skipped: {}", tally.skipped));
    }
    if let Some(duration) = step.process_duration {
        lines.push(format!(
            "Test process duration: {}",
            format_minutes_seconds(duration)
        ));
    }
    if let Some(duration) = step.run_duration {
        lines.push(format!("Run duration: {}", format_minutes_seconds(duration)));
    }

    if !cases.is_empty() {
        lines.push("Test cases:".to_string());
        for case in cases {
            let line = match (case.verdict(), case.status.as_deref()) {
                (TestCaseVerdict::Passed, _) => format!("  ✅ {}", case.name),
                (TestCaseVerdict::Skipped, _) => format!("  ⏭️ {} (skipped)", case.name),
                (TestCaseVerdict::NotPassed, status) => {
                    format!("  ❌ {} ({})", case.name, status.unwrap_or("failed"))
                }
            };
            lines.push(line);
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::scripted::{
        ScriptedService, finished, matrix, passed, step, traceable, with_status,
    };

    fn links() -> ConsoleLinks {
        ConsoleLinks::new("https://console.firebase.google.com", "proj")
    }

    fn two_device_results() -> Vec<(StepResult, Vec<TestCaseResult>)> {
        vec![
            (
                step("s-a", "deviceA", "success"),
                (1..=5).map(|i| passed(&format!("testA{i}"))).collect(),
            ),
            (step("s-b", "deviceB", "failure"), {
                let mut cases: Vec<_> = (1..=4).map(|i| passed(&format!("testB{i}"))).collect();
                cases.push(with_status("testB5", "failed"));
                cases
            }),
        ]
    }

    #[test]
    fn test_tally_counts() {
        let cases = vec![
            passed("a"),
            with_status("b", "failed"),
            with_status("c", "skipped"),
            with_status("d", "error"),
        ];
        let tally = StepTally::from_cases(&cases);
        assert_eq!(tally.total, 3);
        assert_eq!(tally.passed, 1);
        assert_eq!(tally.skipped, 1);
        assert_eq!(tally.success_percent(), Some(33));
    }

    #[test]
    fn test_percentage_uses_integer_division() {
        let mut cases: Vec<_> = (0..7).map(|i| passed(&format!("p{i}"))).collect();
        cases.extend((0..3).map(|i| with_status(&format!("f{i}"), "failed")));
        let tally = StepTally::from_cases(&cases);
        assert_eq!(tally.success_percent(), Some(70));

        let results = vec![(step("s", "dev", "failure"), cases)];
        let outcome = fold(&finished(&[("e", "FINISHED")]), &results, &links()).unwrap();
        assert!(outcome.devices[0].summary.contains("70% success"));
    }

    #[test]
    fn test_zero_test_cases_renders_placeholder() {
        let results = vec![(step("s", "dev", "success"), Vec::new())];
        let outcome = fold(&finished(&[("e", "FINISHED")]), &results, &links()).unwrap();

        let device = &outcome.devices[0];
        assert_eq!(device.total_tests, 0);
        assert_eq!(device.success_percent, None);
        assert!(device.summary.contains(NO_TEST_CASES));
        assert!(!device.summary.contains('%'));
        assert!(outcome.success);
    }

    #[test]
    fn test_only_skipped_cases_has_no_percentage() {
        let results = vec![(
            step("s", "dev", "skipped"),
            vec![with_status("a", "skipped")],
        )];
        let outcome = fold(&finished(&[("e", "FINISHED")]), &results, &links()).unwrap();
        assert_eq!(outcome.devices[0].success_percent, None);
        assert!(outcome.success);
    }

    #[test]
    fn test_two_devices_one_failing() {
        let matrix = finished(&[("e-a", "FINISHED"), ("e-b", "FINISHED")]);
        let outcome = fold(&matrix, &two_device_results(), &links()).unwrap();

        assert!(!outcome.success);
        assert!(outcome.executions_completed);
        assert_eq!(outcome.failures(), 1);
        assert_eq!(outcome.inconclusive_steps, 0);

        let a = &outcome.devices[0];
        assert_eq!(a.label, "deviceA 15.7");
        assert!(a.summary.starts_with("✅"));
        assert!(a.summary.contains("100% success"));

        let b = &outcome.devices[1];
        assert_eq!(b.label, "deviceB 15.7");
        assert!(b.summary.starts_with("⚠️"));
        assert!(b.summary.contains("80% success"));
        assert!(b.summary.contains("❌ testB5 (failed)"));
        assert_eq!(
            b.console_url,
            "https://console.firebase.google.com/project/proj/testlab/histories/bh.1/matrices/5555/executions/s-b"
        );
    }

    #[test]
    fn test_fold_is_idempotent() {
        let matrix = finished(&[("e-a", "FINISHED"), ("e-b", "FINISHED")]);
        let results = two_device_results();
        let first = fold(&matrix, &results, &links()).unwrap();
        let second = fold(&matrix, &results, &links()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unfinished_execution_fails_but_continues() {
        let matrix = finished(&[("e-a", "ERROR"), ("e-b", "FINISHED")]);
        let results = vec![
            (step("s-a", "deviceA", "success"), vec![passed("t")]),
            (step("s-b", "deviceB", "success"), vec![passed("t")]),
        ];
        let outcome = fold(&matrix, &results, &links()).unwrap();

        assert!(!outcome.executions_completed);
        assert_eq!(outcome.failed_executions, 1);
        assert_eq!(outcome.devices.len(), 2);
        assert!(!outcome.success);
    }

    #[test]
    fn test_inconclusive_and_unknown_outcomes_fail_verdict() {
        let matrix = finished(&[("e", "FINISHED")]);
        for outcome_str in ["inconclusive", "unset"] {
            let results = vec![(step("s", "dev", outcome_str), vec![passed("t")])];
            let outcome = fold(&matrix, &results, &links()).unwrap();
            assert_eq!(outcome.inconclusive_steps, 1);
            assert_eq!(outcome.failures(), 0);
            assert!(!outcome.success);
        }
    }

    #[test]
    fn test_flaky_and_skipped_steps_pass() {
        let matrix = finished(&[("e", "FINISHED")]);
        let results = vec![
            (step("s1", "dev1", "flaky"), vec![passed("t")]),
            (step("s2", "dev2", "skipped"), Vec::new()),
        ];
        let outcome = fold(&matrix, &results, &links()).unwrap();
        assert!(outcome.success);
    }

    #[test]
    fn test_fold_requires_location() {
        let err = fold(&matrix("FINISHED"), &[], &links()).unwrap_err();
        assert!(matches!(err, LabError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_aggregate_fetches_each_step() {
        let service = ScriptedService::new()
            .with_step(step("s-a", "deviceA", "success"), vec![passed("a")])
            .with_step(step("s-b", "deviceB", "success"), vec![passed("b")]);
        let links = links();
        let aggregator = ResultAggregator::new(&service, "proj", &links);

        let matrix = TestMatrix {
            timestamp: Some(chrono::Utc::now()),
            ..traceable("FINISHED")
        };
        let outcome = aggregator.aggregate(&matrix).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.devices.len(), 2);
        assert_eq!(outcome.started_at, matrix.timestamp);
        assert_eq!(ScriptedService::count(&service.step_calls), 1);
        assert_eq!(ScriptedService::count(&service.test_case_calls), 2);
    }
}
