//! Run lifecycle: stage, submit, poll, aggregate, download.
//!
//! # Architecture
//!
//! ```text
//!   JobPlan
//!      │ resolve bucket (config or service default)
//!      │ stage local artifacts ──────────────► BlobStore.upload
//!      ▼
//!   JobRequest ──► JobSubmissionBuilder ──► TestLabService.submit_matrix
//!                                                   │
//!                                               matrix id
//!                                                   ▼
//!                                             StatusPoller ◄──► TestLabService.get_matrix
//!                                                   │
//!                          ┌────────────────────────┴────────────┐
//!                          ▼                                     ▼
//!                      Detached                           Finished(matrix)
//!                   (async mode)                                 │
//!                                                      ResultAggregator ◄──► list_steps /
//!                                                                │           list_test_cases
//!                                                                ▼
//!                                                       AggregateOutcome ──► Reporter
//!                                                                │
//!                                                                ▼
//!                                                      ArtifactDownloader (side effect)
//! ```
//!
//! Control is a single sequence: nothing runs concurrently, and every remote
//! call is awaited before the next one starts.
//!
//! # Key Components
//!
//! - [`Orchestrator`]: entry point tying the pieces together
//! - [`StatusPoller`]: the matrix state machine
//! - [`ResultAggregator`]: folds steps and test cases into the verdict
//! - [`RunOutcome`]: what a run produced

pub mod aggregate;
pub mod poller;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, GS_SCHEME, JobPlan};
use crate::error::{LabError, LabResult};
use crate::model::{AggregateOutcome, ArtifactSet, ConsoleLinks, JobRequest};
use crate::report::Reporter;
use crate::service::TestLabService;
use crate::storage::{ArtifactDownloader, BlobStore};
use crate::submission::JobSubmissionBuilder;

pub use aggregate::ResultAggregator;
pub use poller::{PollOutcome, StatusPoller};

/// What a run produced.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every execution finished and every step passed, or the run detached |
/// | 1 | Some execution, step or test case did not pass |
///
/// Fatal errors never produce a `RunOutcome`; the CLI maps them to `2`.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(AggregateOutcome),
    /// Async mode stopped waiting once the matrix became traceable.
    Detached {
        matrix_id: String,
        console_url: String,
    },
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        match self {
            RunOutcome::Completed(outcome) => outcome.success,
            RunOutcome::Detached { .. } => true,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed(outcome) => outcome.exit_code(),
            RunOutcome::Detached { .. } => 0,
        }
    }
}

/// Run parameters that are not part of the job itself.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub console_host: String,
    pub poll_interval: Duration,
    pub max_wait: Option<Duration>,
    pub client_name: String,
    /// `None` disables the post-run download.
    pub download: Option<DownloadSettings>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadSettings {
    pub files: Vec<String>,
    pub output_dir: PathBuf,
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            console_host: config.lab.console_host.clone(),
            poll_interval: Duration::from_secs(config.lab.poll_interval_secs),
            max_wait: config.lab.max_wait_secs.map(Duration::from_secs),
            client_name: config.lab.client_name.clone(),
            download: config.download.enabled.then(|| DownloadSettings {
                files: config.download.files.clone(),
                output_dir: config.download.output_dir.clone(),
            }),
        }
    }
}

/// Coordinates a single run against the remote service.
///
/// # Type Parameters
///
/// - `S`: The remote service client
/// - `B`: The blob store used for artifacts and results
/// - `R`: The reporter type
pub struct Orchestrator<S, B, R> {
    plan: JobPlan,
    settings: RunSettings,
    service: S,
    store: B,
    reporter: R,
    cancel: CancellationToken,
}

impl<S, B, R> Orchestrator<S, B, R>
where
    S: TestLabService,
    B: BlobStore,
    R: Reporter,
{
    /// Creates a new orchestrator with the given components.
    ///
    /// # Arguments
    ///
    /// * `plan` - Validated job from [`config::validate`](crate::config::validate)
    /// * `settings` - Polling, linking and download parameters
    /// * `service` - Client for the remote test service
    /// * `store` - Blob store for uploads and downloads
    /// * `reporter` - Reporter for outputting progress and results
    pub fn new(plan: JobPlan, settings: RunSettings, service: S, store: B, reporter: R) -> Self {
        Self {
            plan,
            settings,
            service,
            store,
            reporter,
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `cancel` to stop polling early.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs the job to completion (or detachment).
    ///
    /// Test-level failures are part of the returned outcome. Errors are
    /// reported to the reporter before being returned.
    ///
    /// # Errors
    ///
    /// Any [`LabError`]: every error aborts the run and no partial outcome
    /// is produced.
    pub async fn run(&self) -> LabResult<RunOutcome> {
        match self.execute().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.reporter.on_run_failed(&e).await;
                Err(e)
            }
        }
    }

    async fn execute(&self) -> LabResult<RunOutcome> {
        let project = self.plan.project.as_str();
        let links = ConsoleLinks::new(&self.settings.console_host, project);

        let bucket = match &self.plan.bucket {
            Some(bucket) => bucket.clone(),
            None => {
                let bucket = self.service.default_bucket(project).await?;
                info!("Using default result bucket {}", bucket);
                bucket
            }
        };

        let folder = work_folder(&self.plan.results_prefix, Utc::now(), Uuid::new_v4());
        let result_storage = format!("{GS_SCHEME}{bucket}/{folder}/");

        let request = JobRequest {
            artifacts: self.stage_artifacts(&result_storage).await?,
            devices: self.plan.devices.clone(),
            timeout: self.plan.timeout,
            flags: self.plan.flags,
            result_storage,
        };

        let payload = JobSubmissionBuilder::new(&self.settings.client_name).build(&request);
        debug!("Submitting test matrix through {}", self.service.name());
        let ack = self.service.submit_matrix(project, &payload).await?;
        let matrix_id = ack
            .matrix_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| LabError::protocol("submit response did not include a testMatrixId"))?;

        info!(
            "Submitted {} test matrix {} ({} devices, results in {})",
            request.platform(),
            matrix_id,
            request.devices.len(),
            request.result_storage
        );
        self.reporter.on_job_submitted(&matrix_id, &request).await;

        let poller = StatusPoller::new(&self.service, project, &links, self.settings.poll_interval)
            .with_async_mode(request.flags.async_mode)
            .with_cancellation(self.cancel.clone())
            .with_max_wait(self.settings.max_wait);

        let matrix = match poller.poll(&matrix_id, &self.reporter).await? {
            PollOutcome::Detached { console_url, .. } => {
                info!("Async mode: not waiting for test matrix {}", matrix_id);
                self.reporter.on_detached(&matrix_id, &console_url).await;
                return Ok(RunOutcome::Detached {
                    matrix_id,
                    console_url,
                });
            }
            PollOutcome::Finished(matrix) => matrix,
        };

        info!("Test matrix {} finished", matrix_id);
        if matrix.result_location.is_none() {
            return Err(LabError::protocol(format!(
                "test matrix {matrix_id} finished without history and execution ids"
            )));
        }
        let storage = matrix.result_storage.clone().ok_or_else(|| {
            LabError::protocol(format!(
                "test matrix {matrix_id} finished without a result storage location"
            ))
        })?;

        let outcome = ResultAggregator::new(&self.service, project, &links)
            .aggregate(&matrix)
            .await?;
        info!(
            "Verdict: {} ({} failed executions, {} failed steps, {} inconclusive steps)",
            if outcome.success { "passed" } else { "failed" },
            outcome.failed_executions,
            outcome.failed_steps,
            outcome.inconclusive_steps
        );
        self.reporter.on_run_complete(&outcome).await;

        if let Some(download) = &self.settings.download {
            let downloader =
                ArtifactDownloader::new(&self.store, download.files.clone(), &download.output_dir);
            match downloader.download(&storage).await {
                Ok(_) => info!("Results downloaded to {}", downloader.output_dir().display()),
                Err(e) => warn!("Failed to download results: {}", e),
            }
        }

        Ok(RunOutcome::Completed(outcome))
    }

    /// Uploads local artifacts into `destination` and returns the set with
    /// every reference pointing at the blob store.
    async fn stage_artifacts(&self, destination: &str) -> LabResult<ArtifactSet> {
        Ok(match &self.plan.artifacts {
            ArtifactSet::Ios {
                test_bundle,
                xcode_version,
            } => ArtifactSet::Ios {
                test_bundle: self.stage(test_bundle, destination).await?,
                xcode_version: xcode_version.clone(),
            },
            ArtifactSet::Android {
                app_apk,
                test_apk,
                test_targets,
            } => ArtifactSet::Android {
                app_apk: self.stage(app_apk, destination).await?,
                test_apk: self.stage(test_apk, destination).await?,
                test_targets: test_targets.clone(),
            },
        })
    }

    async fn stage(&self, reference: &str, destination: &str) -> LabResult<String> {
        if reference.starts_with(GS_SCHEME) {
            return Ok(reference.to_string());
        }

        let local = Path::new(reference);
        let name = local
            .file_name()
            .ok_or_else(|| LabError::config(format!("artifact path has no file name: {reference}")))?;
        let target = format!("{destination}{}", name.to_string_lossy());

        info!("Uploading {} to {}", local.display(), target);
        self.store.upload(local, &target).await
    }
}

/// Unique per-run folder name: `{prefix}{UTC timestamp}_{8 hex chars}`.
pub fn work_folder(prefix: &str, now: DateTime<Utc>, id: Uuid) -> String {
    let suffix: String = id.simple().to_string().chars().take(8).collect();
    format!("{prefix}{}_{suffix}", now.format("%Y-%m-%d_%H-%M-%S"))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::model::{DeviceDescriptor, JobFlags, MatrixAck, MatrixState};
    use crate::report::NullReporter;
    use crate::service::scripted::{
        ScriptedService, finished, matrix, passed, step, traceable, with_status,
    };

    #[derive(Default)]
    struct RecordingStore {
        uploads: Mutex<Vec<(PathBuf, String)>>,
        downloads: Mutex<Vec<String>>,
        fail_downloads: bool,
    }

    #[async_trait]
    impl BlobStore for RecordingStore {
        async fn upload(&self, local: &Path, destination: &str) -> LabResult<String> {
            self.uploads
                .lock()
                .unwrap()
                .push((local.to_path_buf(), destination.to_string()));
            Ok(destination.to_string())
        }

        async fn download_tree(&self, source: &str, _dest_dir: &Path) -> LabResult<()> {
            if self.fail_downloads {
                return Err(LabError::Storage("bucket unavailable".to_string()));
            }
            self.downloads.lock().unwrap().push(source.to_string());
            Ok(())
        }

        async fn list_folders(&self, _source: &str) -> LabResult<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn plan(artifacts: ArtifactSet) -> JobPlan {
        JobPlan {
            project: "proj".to_string(),
            artifacts,
            devices: vec![DeviceDescriptor {
                model: "iphone13pro".to_string(),
                version: "15.7".to_string(),
                locale: "en_US".to_string(),
                orientation: "portrait".to_string(),
            }],
            timeout: Duration::from_secs(900),
            flags: JobFlags::default(),
            bucket: None,
            results_prefix: "devicelab-".to_string(),
        }
    }

    fn remote_ios() -> ArtifactSet {
        ArtifactSet::Ios {
            test_bundle: "gs://artifacts/tests.zip".to_string(),
            xcode_version: None,
        }
    }

    fn settings() -> RunSettings {
        RunSettings {
            console_host: "https://console.firebase.google.com".to_string(),
            poll_interval: Duration::ZERO,
            max_wait: None,
            client_name: "devicelab".to_string(),
            download: None,
        }
    }

    fn happy_service() -> ScriptedService {
        ScriptedService::new()
            .with_matrices(vec![
                matrix("VALIDATING"),
                traceable("RUNNING"),
                finished(&[("e-1", "FINISHED")]),
            ])
            .with_step(
                step("s-1", "iphone13pro", "success"),
                vec![passed("testLogin"), passed("testLogout")],
            )
    }

    #[test]
    fn test_work_folder_format() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let id = Uuid::parse_str("1234abcd-0000-4000-8000-000000000000").unwrap();
        assert_eq!(
            work_folder("devicelab-", now, id),
            "devicelab-2024-03-09_14-05-07_1234abcd"
        );
    }

    #[tokio::test]
    async fn test_happy_path() {
        let orchestrator = Orchestrator::new(
            plan(remote_ios()),
            settings(),
            happy_service(),
            RecordingStore::default(),
            NullReporter,
        );

        let outcome = orchestrator.run().await.unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.exit_code(), 0);

        let RunOutcome::Completed(aggregate) = outcome else {
            panic!("expected a completed run");
        };
        assert_eq!(aggregate.devices.len(), 1);
        assert_eq!(aggregate.devices[0].passed_tests, 2);

        let service = &orchestrator.service;
        assert_eq!(ScriptedService::count(&service.bucket_calls), 1);
        assert_eq!(ScriptedService::count(&service.matrix_calls), 3);

        let submitted = service.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        let storage = &submitted[0].result_storage.google_cloud_storage.gcs_path;
        assert!(storage.starts_with("gs://test-lab-default-bucket/devicelab-"));
        assert!(storage.ends_with('/'));
        assert!(orchestrator.store.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_configured_bucket_skips_default_lookup() {
        let mut job = plan(remote_ios());
        job.bucket = Some("my-bucket".to_string());
        let orchestrator = Orchestrator::new(
            job,
            settings(),
            happy_service(),
            RecordingStore::default(),
            NullReporter,
        );

        orchestrator.run().await.unwrap();
        assert_eq!(ScriptedService::count(&orchestrator.service.bucket_calls), 0);
        let submitted = orchestrator.service.submitted.lock().unwrap();
        assert!(
            submitted[0]
                .result_storage
                .google_cloud_storage
                .gcs_path
                .starts_with("gs://my-bucket/devicelab-")
        );
    }

    #[tokio::test]
    async fn test_local_artifacts_are_uploaded() {
        let orchestrator = Orchestrator::new(
            plan(ArtifactSet::Android {
                app_apk: "/builds/app-debug.apk".to_string(),
                test_apk: "gs://artifacts/app-test.apk".to_string(),
                test_targets: Vec::new(),
            }),
            settings(),
            happy_service(),
            RecordingStore::default(),
            NullReporter,
        );

        orchestrator.run().await.unwrap();

        let uploads = orchestrator.store.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, PathBuf::from("/builds/app-debug.apk"));
        assert!(uploads[0].1.starts_with("gs://test-lab-default-bucket/devicelab-"));
        assert!(uploads[0].1.ends_with("/app-debug.apk"));

        let submitted = orchestrator.service.submitted.lock().unwrap();
        let android = submitted[0]
            .test_specification
            .android_instrumentation_test
            .as_ref()
            .unwrap();
        assert_eq!(android.app_apk.gcs_path, uploads[0].1);
        assert_eq!(android.test_apk.gcs_path, "gs://artifacts/app-test.apk");
    }

    #[tokio::test]
    async fn test_missing_matrix_id_aborts_without_polling() {
        let service = happy_service().with_ack(MatrixAck {
            matrix_id: None,
            state: Some(MatrixState::Validating),
        });
        let orchestrator = Orchestrator::new(
            plan(remote_ios()),
            settings(),
            service,
            RecordingStore::default(),
            NullReporter,
        );

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, LabError::Protocol(_)));
        assert_eq!(ScriptedService::count(&orchestrator.service.matrix_calls), 0);
    }

    #[tokio::test]
    async fn test_finished_without_location_is_protocol_error() {
        let service = ScriptedService::new().with_matrices(vec![matrix("FINISHED")]);
        let orchestrator = Orchestrator::new(
            plan(remote_ios()),
            settings(),
            service,
            RecordingStore::default(),
            NullReporter,
        );

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, LabError::Protocol(_)));
        assert_eq!(ScriptedService::count(&orchestrator.service.step_calls), 0);
    }

    #[tokio::test]
    async fn test_finished_without_storage_is_protocol_error() {
        let mut done = traceable("FINISHED");
        done.result_storage = None;
        let service = ScriptedService::new().with_matrices(vec![done]);
        let orchestrator = Orchestrator::new(
            plan(remote_ios()),
            settings(),
            service,
            RecordingStore::default(),
            NullReporter,
        );

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, LabError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_async_run_detaches() {
        let mut job = plan(remote_ios());
        job.flags.async_mode = true;
        let orchestrator = Orchestrator::new(
            job,
            settings(),
            happy_service(),
            RecordingStore::default(),
            NullReporter,
        );

        let outcome = orchestrator.run().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Detached { .. }));
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(ScriptedService::count(&orchestrator.service.step_calls), 0);
    }

    #[tokio::test]
    async fn test_failing_tests_still_download() {
        let service = ScriptedService::new()
            .with_matrices(vec![finished(&[("e-1", "FINISHED")])])
            .with_step(
                step("s-1", "iphone13pro", "failure"),
                vec![passed("a"), with_status("b", "failed")],
            );
        let mut run_settings = settings();
        run_settings.download = Some(DownloadSettings {
            files: Vec::new(),
            output_dir: PathBuf::from("out"),
        });
        let orchestrator = Orchestrator::new(
            plan(remote_ios()),
            run_settings,
            service,
            RecordingStore::default(),
            NullReporter,
        );

        let outcome = orchestrator.run().await.unwrap();
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(
            *orchestrator.store.downloads.lock().unwrap(),
            vec!["gs://bucket/run/".to_string()]
        );
    }

    #[tokio::test]
    async fn test_download_failure_keeps_verdict() {
        let mut run_settings = settings();
        run_settings.download = Some(DownloadSettings {
            files: Vec::new(),
            output_dir: PathBuf::from("out"),
        });
        let store = RecordingStore {
            fail_downloads: true,
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(
            plan(remote_ios()),
            run_settings,
            happy_service(),
            store,
            NullReporter,
        );

        let outcome = orchestrator.run().await.unwrap();
        assert!(outcome.success());
    }
}
