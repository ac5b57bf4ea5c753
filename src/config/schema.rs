//! Configuration schema definitions for devicelab.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. The app under test is selected with a tagged
//! enum keyed by `platform`.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── LabConfig          - Project, API endpoints, polling and HTTP timeouts
//! ├── AuthConfig         - Where the access token comes from
//! ├── AppConfig          - Tagged enum selecting the platform
//! │   ├── Ios            - XCTest bundle
//! │   └── Android        - App + instrumentation APKs
//! ├── JobConfig          - Timeout, flags and the device matrix
//! ├── StorageConfig      - Result bucket and gsutil command
//! ├── DownloadConfig     - Which result files to fetch afterwards
//! └── ReportConfig       - JUnit output settings
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure for devicelab.
///
/// # Example
///
/// ```
/// use devicelab::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [lab]
///     project = "my-project"
///
///     [app]
///     platform = "ios"
///     test_bundle = "gs://my-bucket/tests.zip"
///
///     [[job.devices]]
///     model = "iphone13pro"
///     version = "15.7"
/// "#).unwrap();
/// assert_eq!(config.job.timeout_secs, 900);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub lab: LabConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    pub app: AppConfig,

    pub job: JobConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub download: DownloadConfig,

    #[serde(default)]
    pub report: ReportConfig,
}

/// Remote service settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `console_host` | `https://console.firebase.google.com` |
/// | `testing_api` | `https://testing.googleapis.com/v1` |
/// | `tool_results_api` | `https://www.googleapis.com/toolresults/v1beta3` |
/// | `poll_interval_secs` | 15 |
/// | `request_timeout_secs` | 15 |
/// | `connect_timeout_secs` | 5 |
/// | `max_wait_secs` | None (poll until the matrix settles) |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LabConfig {
    /// Google Cloud project that owns the test matrix.
    pub project: String,

    #[serde(default = "default_console_host")]
    pub console_host: String,

    #[serde(default = "default_testing_api")]
    pub testing_api: String,

    #[serde(default = "default_tool_results_api")]
    pub tool_results_api: String,

    /// Pause between two status fetches. Constant, not a backoff.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Upper bound on the total time spent polling.
    pub max_wait_secs: Option<u64>,

    /// Tag sent as `clientInfo.name` with each matrix.
    #[serde(default = "default_client_name")]
    pub client_name: String,
}

fn default_console_host() -> String {
    "https://console.firebase.google.com".to_string()
}

fn default_testing_api() -> String {
    "https://testing.googleapis.com/v1".to_string()
}

fn default_tool_results_api() -> String {
    "https://www.googleapis.com/toolresults/v1beta3".to_string()
}

fn default_poll_interval() -> u64 {
    15
}

fn default_request_timeout() -> u64 {
    15
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_client_name() -> String {
    crate::submission::DEFAULT_CLIENT_NAME.to_string()
}

/// Access token source.
///
/// The token is read from `token_env`, or from the stdout of
/// `token_command` when one is set (e.g. `gcloud auth print-access-token`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default = "default_token_env")]
    pub token_env: String,

    pub token_command: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
            token_command: None,
        }
    }
}

fn default_token_env() -> String {
    "DEVICELAB_ACCESS_TOKEN".to_string()
}

/// App under test.
///
/// Artifact references are either local paths (uploaded before submission)
/// or `gs://` references used as-is.
///
/// ```toml
/// [app]
/// platform = "android"
/// app_apk = "app/build/outputs/apk/debug/app-debug.apk"
/// test_apk = "app/build/outputs/apk/androidTest/debug/app-debug-androidTest.apk"
/// test_targets = ["class com.example.LoginTest"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "platform", rename_all = "lowercase")]
pub enum AppConfig {
    Ios(IosAppConfig),
    Android(AndroidAppConfig),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IosAppConfig {
    /// Zip containing the `.xctestrun` file and the built products.
    pub test_bundle: String,

    pub xcode_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AndroidAppConfig {
    pub app_apk: String,

    pub test_apk: String,

    #[serde(default)]
    pub test_targets: Vec<String>,
}

/// Job settings and device matrix.
///
/// ```toml
/// [job]
/// timeout_secs = 600
/// retry_on_failure = true
/// async = false
///
/// [[job.devices]]
/// model = "iphone13pro"
/// version = "15.7"
/// orientation = "landscape"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobConfig {
    /// Per-execution timeout enforced by the service.
    ///
    /// Default: 900 (15 minutes)
    #[serde(default = "default_test_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub disable_video: bool,

    #[serde(default)]
    pub disable_metrics: bool,

    /// Ask the service for one extra attempt on failing executions.
    #[serde(default)]
    pub retry_on_failure: bool,

    /// Return once the matrix is traceable instead of waiting for results.
    #[serde(default, rename = "async")]
    pub async_mode: bool,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

fn default_test_timeout() -> u64 {
    900
}

/// A device entry as written in the config file.
///
/// `model` and `version` are required; validation rejects entries without
/// them.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub model: Option<String>,
    pub version: Option<String>,
    pub locale: Option<String>,
    pub orientation: Option<String>,
}

/// Result storage settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Bucket for uploads and results, as `name` or `gs://name`.
    ///
    /// When unset, the project's default Test Lab bucket is used.
    pub bucket: Option<String>,

    /// Prefix of the per-run folder created inside the bucket.
    #[serde(default = "default_results_prefix")]
    pub results_prefix: String,

    /// Command used to talk to Cloud Storage.
    #[serde(default = "default_gsutil")]
    pub gsutil: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            results_prefix: default_results_prefix(),
            gsutil: default_gsutil(),
        }
    }
}

fn default_results_prefix() -> String {
    "devicelab-".to_string()
}

fn default_gsutil() -> String {
    "gsutil".to_string()
}

/// Result download settings.
///
/// With an empty `files` list the whole result folder is copied; otherwise
/// only the listed files are fetched from every device folder.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownloadConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub files: Vec<String>,

    #[serde(default = "default_download_dir")]
    pub output_dir: PathBuf,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            files: Vec::new(),
            output_dir: default_download_dir(),
        }
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("test-results/firebase")
}

/// Configuration for test result reporting.
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `"test-results"` |
/// | `junit` | `false` |
/// | `junit_file` | `"junit.xml"` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    #[serde(default)]
    pub junit: bool,

    #[serde(default = "default_junit_file")]
    pub junit_file: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            junit: false,
            junit_file: default_junit_file(),
        }
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}
