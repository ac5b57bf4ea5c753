//! JUnit XML report generation.
//!
//! Writes the aggregate outcome as JUnit XML so CI systems can show per-case
//! results. Each device becomes one `<testsuite>`:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites name="devicelab" tests="3" failures="1" skipped="0" time="130.000">
//!   <testsuite name="iphone13pro 15.7" tests="3" failures="1" skipped="0" time="130.000">
//!     <properties>
//!       <property name="outcome" value="failure"/>
//!       <property name="console" value="https://console.firebase.google.com/..."/>
//!     </properties>
//!     <testcase classname="LoginTests" name="testLogin"/>
//!     <testcase classname="LoginTests" name="testLogout">
//!       <failure message="failed" type="failed"/>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! Test Lab does not report per-case timing here, so only suites carry a
//! `time` attribute (the step's run duration).

use std::path::PathBuf;

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};

use super::Reporter;
use crate::error::LabError;
use crate::model::{
    AggregateOutcome, DeviceSummary, JobRequest, TestCaseResult, TestCaseVerdict, TestMatrix,
};

/// Reporter that writes a JUnit XML file when the run completes.
///
/// Parent directories are created automatically. Detached and failed runs
/// write nothing.
pub struct JUnitReporter {
    output_path: PathBuf,
    report_name: String,
}

impl JUnitReporter {
    /// Creates a new JUnit reporter that writes to the given path.
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            report_name: "devicelab".to_string(),
        }
    }

    /// Sets the `name` attribute of `<testsuites>`. Defaults to `"devicelab"`.
    pub fn with_report_name(mut self, name: impl Into<String>) -> Self {
        self.report_name = name.into();
        self
    }

    fn generate_xml(&self, outcome: &AggregateOutcome) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let tests: usize = outcome.devices.iter().map(|d| d.test_cases.len()).sum();
        let failures: usize = outcome.devices.iter().map(count_failures).sum();
        let skipped: usize = outcome.devices.iter().map(count_skipped).sum();
        let time: f64 = outcome
            .devices
            .iter()
            .filter_map(|d| d.run_duration)
            .map(|d| d.as_secs_f64())
            .sum();

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("name", self.report_name.as_str()));
        testsuites.push_attribute(("tests", tests.to_string().as_str()));
        testsuites.push_attribute(("failures", failures.to_string().as_str()));
        testsuites.push_attribute(("skipped", skipped.to_string().as_str()));
        testsuites.push_attribute(("time", format!("{:.3}", time).as_str()));
        writer.write_event(Event::Start(testsuites))?;

        for device in &outcome.devices {
            write_testsuite(&mut writer, device)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        let xml = String::from_utf8(writer.into_inner())?;
        Ok(xml)
    }
}

fn count_failures(device: &DeviceSummary) -> usize {
    device
        .test_cases
        .iter()
        .filter(|c| c.verdict() == TestCaseVerdict::NotPassed)
        .count()
}

fn count_skipped(device: &DeviceSummary) -> usize {
    device
        .test_cases
        .iter()
        .filter(|c| c.verdict() == TestCaseVerdict::Skipped)
        .count()
}

fn write_testsuite<W: std::io::Write>(
    writer: &mut Writer<W>,
    device: &DeviceSummary,
) -> anyhow::Result<()> {
    let time = device
        .run_duration
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();

    let mut testsuite = BytesStart::new("testsuite");
    testsuite.push_attribute(("name", sanitize_xml(&device.label).as_str()));
    testsuite.push_attribute(("tests", device.test_cases.len().to_string().as_str()));
    testsuite.push_attribute(("failures", count_failures(device).to_string().as_str()));
    testsuite.push_attribute(("skipped", count_skipped(device).to_string().as_str()));
    testsuite.push_attribute(("time", format!("{:.3}", time).as_str()));
    writer.write_event(Event::Start(testsuite))?;

    writer.write_event(Event::Start(BytesStart::new("properties")))?;
    for (name, value) in [
        ("outcome", device.outcome.as_str()),
        ("console", device.console_url.as_str()),
    ] {
        let mut property = BytesStart::new("property");
        property.push_attribute(("name", name));
        property.push_attribute(("value", sanitize_xml(value).as_str()));
        writer.write_event(Event::Empty(property))?;
    }
    writer.write_event(Event::End(BytesEnd::new("properties")))?;

    for case in &device.test_cases {
        write_testcase(writer, &device.label, case)?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    Ok(())
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    device_label: &str,
    case: &TestCaseResult,
) -> anyhow::Result<()> {
    let (classname, name) = split_case_name(&case.name, device_label);

    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", sanitize_xml(classname).as_str()));
    testcase.push_attribute(("name", sanitize_xml(name).as_str()));

    match case.verdict() {
        TestCaseVerdict::Passed => {
            writer.write_event(Event::Empty(testcase))?;
        }
        TestCaseVerdict::NotPassed => {
            writer.write_event(Event::Start(testcase))?;

            let status = sanitize_xml(case.status.as_deref().unwrap_or("failed"));
            let mut failure = BytesStart::new("failure");
            failure.push_attribute(("message", status.as_str()));
            failure.push_attribute(("type", status.as_str()));
            writer.write_event(Event::Empty(failure))?;

            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
        TestCaseVerdict::Skipped => {
            writer.write_event(Event::Start(testcase))?;
            writer.write_event(Event::Empty(BytesStart::new("skipped")))?;
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
    }

    Ok(())
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_job_submitted(&self, _matrix_id: &str, _request: &JobRequest) {}
    async fn on_matrix_update(&self, _matrix: &TestMatrix) {}
    async fn on_results_link(&self, _url: &str) {}
    async fn on_detached(&self, _matrix_id: &str, _url: &str) {}

    async fn on_run_complete(&self, outcome: &AggregateOutcome) {
        match self.generate_xml(outcome) {
            Ok(xml) => {
                if let Some(parent) = self.output_path.parent()
                    && !parent.as_os_str().is_empty()
                    && !parent.exists()
                    && let Err(e) = std::fs::create_dir_all(parent)
                {
                    tracing::error!("Failed to create output directory: {}", e);
                    return;
                }

                if let Err(e) = std::fs::write(&self.output_path, xml) {
                    tracing::error!("Failed to write JUnit XML: {}", e);
                } else {
                    tracing::info!("JUnit XML written to: {}", self.output_path.display());
                }
            }
            Err(e) => {
                tracing::error!("Failed to generate JUnit XML: {}", e);
            }
        }
    }

    async fn on_run_failed(&self, _error: &LabError) {}
}

/// Splits `Class.method` into its parts. Names without a class fall back to
/// the device label as the classname.
fn split_case_name<'a>(name: &'a str, device_label: &'a str) -> (&'a str, &'a str) {
    match name.rsplit_once('.') {
        Some((class, method)) if !class.is_empty() && !method.is_empty() => (class, method),
        _ => (device_label, name),
    }
}

/// Drops characters that are not allowed in XML 1.0. Escaping is left to the
/// writer.
fn sanitize_xml(s: &str) -> String {
    s.chars()
        .filter(|c| {
            matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..='\u{10FFFF}')
        })
        .collect()
}
