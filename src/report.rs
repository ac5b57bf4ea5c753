//! Run reporting.
//!
//! A [`Reporter`] receives events as a run moves through its lifecycle:
//!
//! ```text
//!  submit ──► on_job_submitted
//!    │
//!  poll ────► on_matrix_update (every snapshot)
//!    │        on_results_link  (once, when the ids appear)
//!    │
//!    ├─ async ──► on_detached
//!    ├─ error ──► on_run_failed
//!    └─ FINISHED ► on_run_complete
//! ```
//!
//! Reporters only observe. They cannot influence the verdict.

pub mod junit;

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::LabError;
use crate::model::{AggregateOutcome, JobRequest, MatrixPhase, TestMatrix};

pub use junit::JUnitReporter;

/// Receives events during a run.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once the service acknowledged the submitted job.
    async fn on_job_submitted(&self, matrix_id: &str, request: &JobRequest);

    /// Called with every polled matrix snapshot.
    async fn on_matrix_update(&self, matrix: &TestMatrix);

    /// Called once, the first time the console link can be built.
    async fn on_results_link(&self, url: &str);

    /// Called when an async run stops waiting for the matrix.
    async fn on_detached(&self, matrix_id: &str, url: &str);

    /// Called with the final verdict of a completed run.
    async fn on_run_complete(&self, outcome: &AggregateOutcome);

    /// Called when the run aborts with a fatal error.
    async fn on_run_failed(&self, error: &LabError);
}

/// A reporter that does nothing (for testing or when output is not needed).
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_job_submitted(&self, _matrix_id: &str, _request: &JobRequest) {}
    async fn on_matrix_update(&self, _matrix: &TestMatrix) {}
    async fn on_results_link(&self, _url: &str) {}
    async fn on_detached(&self, _matrix_id: &str, _url: &str) {}
    async fn on_run_complete(&self, _outcome: &AggregateOutcome) {}
    async fn on_run_failed(&self, _error: &LabError) {}
}

/// A reporter that combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    /// Add a reporter to the multi-reporter.
    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_job_submitted(&self, matrix_id: &str, request: &JobRequest) {
        for reporter in &self.reporters {
            reporter.on_job_submitted(matrix_id, request).await;
        }
    }

    async fn on_matrix_update(&self, matrix: &TestMatrix) {
        for reporter in &self.reporters {
            reporter.on_matrix_update(matrix).await;
        }
    }

    async fn on_results_link(&self, url: &str) {
        for reporter in &self.reporters {
            reporter.on_results_link(url).await;
        }
    }

    async fn on_detached(&self, matrix_id: &str, url: &str) {
        for reporter in &self.reporters {
            reporter.on_detached(matrix_id, url).await;
        }
    }

    async fn on_run_complete(&self, outcome: &AggregateOutcome) {
        for reporter in &self.reporters {
            reporter.on_run_complete(outcome).await;
        }
    }

    async fn on_run_failed(&self, error: &LabError) {
        for reporter in &self.reporters {
            reporter.on_run_failed(error).await;
        }
    }
}

/// Console reporter that shows a spinner while the matrix is in flight.
pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn println(&self, line: String) {
        match self.progress.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(pb) => pb.println(line),
                None => println!("{line}"),
            },
            Err(_) => println!("{line}"),
        }
    }

    fn finish_spinner(&self) {
        if let Ok(mut guard) = self.progress.lock()
            && let Some(pb) = guard.take()
        {
            pb.finish_and_clear();
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_job_submitted(&self, matrix_id: &str, request: &JobRequest) {
        println!(
            "Submitted {} test matrix {} on {} device(s)",
            request.platform(),
            console::style(matrix_id).bold(),
            request.devices.len()
        );
        if self.verbose {
            for device in &request.devices {
                println!(
                    "  {} {} ({}, {})",
                    device.model, device.version, device.locale, device.orientation
                );
            }
        }

        let pb = indicatif::ProgressBar::new_spinner();
        if let Ok(style) =
            indicatif::ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed}] {msg}")
        {
            pb.set_style(style);
        }
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message("Waiting for the test matrix");

        if let Ok(mut guard) = self.progress.lock() {
            *guard = Some(pb);
        }
    }

    async fn on_matrix_update(&self, matrix: &TestMatrix) {
        if let Ok(guard) = self.progress.lock()
            && let Some(pb) = guard.as_ref()
        {
            pb.set_message(format!("Test matrix status: {}", matrix.state));
        }

        if self.verbose && matrix.state.phase() == MatrixPhase::InFlight {
            for execution in &matrix.executions {
                if let Some(last) = execution.progress_messages.last() {
                    self.println(format!(
                        "  {} {}",
                        console::style(&execution.id).dim(),
                        last
                    ));
                }
            }
        }
    }

    async fn on_results_link(&self, url: &str) {
        self.println(format!(
            "Test results will be available at {}",
            console::style(url).cyan()
        ));
    }

    async fn on_detached(&self, matrix_id: &str, url: &str) {
        self.finish_spinner();
        println!();
        println!(
            "{}",
            console::style(format!(
                "Async mode: not waiting for test matrix {matrix_id}"
            ))
            .yellow()
            .bold()
        );
        println!("Follow progress at {url}");
    }

    async fn on_run_complete(&self, outcome: &AggregateOutcome) {
        self.finish_spinner();

        println!();
        println!("Device Results:");
        for device in &outcome.devices {
            println!();
            println!("{}", console::style(&device.label).bold());
            for line in device.summary.lines() {
                println!("  {line}");
            }
            if self.verbose {
                println!("  {}", console::style(&device.console_url).dim());
            }
        }

        println!();
        if outcome.failed_executions > 0 {
            println!(
                "  Unfinished executions: {}",
                console::style(outcome.failed_executions).red().bold()
            );
        }
        println!(
            "  Failed steps:          {}",
            console::style(outcome.failed_steps).red()
        );
        println!(
            "  Inconclusive steps:    {}",
            console::style(outcome.inconclusive_steps).yellow()
        );
        println!("  Results: {}", outcome.console_url);

        println!();
        if outcome.success {
            println!("{}", console::style("All device tests passed!").green().bold());
        } else {
            println!("{}", console::style("Some device tests failed.").red().bold());
        }
    }

    async fn on_run_failed(&self, error: &LabError) {
        self.finish_spinner();
        eprintln!("{} {}", console::style("Error:").red().bold(), error);
    }
}
