//! Configuration loading, schema definitions and validation.
//!
//! Loading only checks that the file is well-formed TOML matching the schema.
//! [`validate`] then turns a [`Config`] into a [`JobPlan`], rejecting every
//! configuration error before anything is uploaded or submitted.

pub mod schema;

pub use schema::*;

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;

use crate::error::{LabError, LabResult};
use crate::model::{
    ArtifactSet, DEFAULT_LOCALE, DEFAULT_ORIENTATION, DeviceDescriptor, JobFlags, Platform,
};

/// URL scheme of Cloud Storage references.
pub const GS_SCHEME: &str = "gs://";

/// Shortest pause between two status fetches a config file may ask for.
pub const MIN_POLL_INTERVAL_SECS: u64 = 15;

static BUCKET_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9._-]{1,220}[a-z0-9]$").expect("valid regex"));

/// Loads devicelab configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid TOML, or does
/// not match the schema.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads devicelab configuration from a TOML string.
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// A validated job, before artifacts are staged.
///
/// Artifact references in [`JobPlan::artifacts`] are either `gs://`
/// references or local paths that exist (with `~` expanded).
#[derive(Debug, Clone, PartialEq)]
pub struct JobPlan {
    pub project: String,
    pub artifacts: ArtifactSet,
    pub devices: Vec<DeviceDescriptor>,
    pub timeout: Duration,
    pub flags: JobFlags,
    /// Bare bucket name, without scheme.
    pub bucket: Option<String>,
    pub results_prefix: String,
}

impl JobPlan {
    pub fn platform(&self) -> Platform {
        self.artifacts.platform()
    }
}

/// Validates `config` and builds the [`JobPlan`] for it.
///
/// # Errors
///
/// Returns [`LabError::Config`] if:
/// - the project id is empty
/// - the device list is empty, or a device lacks a model or version
/// - `timeout_secs` is zero
/// - `poll_interval_secs` is below [`MIN_POLL_INTERVAL_SECS`]
/// - an HTTP timeout is zero
/// - the bucket or an artifact reference uses a scheme other than `gs://`
/// - the bucket name is malformed
/// - a local artifact does not exist
pub fn validate(config: &Config) -> LabResult<JobPlan> {
    if config.lab.project.trim().is_empty() {
        return Err(LabError::config("lab.project must not be empty"));
    }

    if config.job.timeout_secs == 0 {
        return Err(LabError::config("job.timeout_secs must be positive"));
    }

    if config.lab.poll_interval_secs < MIN_POLL_INTERVAL_SECS {
        return Err(LabError::config(format!(
            "lab.poll_interval_secs must be at least {MIN_POLL_INTERVAL_SECS}, got {}",
            config.lab.poll_interval_secs
        )));
    }

    if config.lab.request_timeout_secs == 0 || config.lab.connect_timeout_secs == 0 {
        return Err(LabError::config(
            "lab.request_timeout_secs and lab.connect_timeout_secs must be positive",
        ));
    }

    if config.job.devices.is_empty() {
        return Err(LabError::config("job.devices must list at least one device"));
    }

    let devices = config
        .job
        .devices
        .iter()
        .enumerate()
        .map(|(idx, device)| resolve_device(idx, device))
        .collect::<LabResult<Vec<_>>>()?;

    let artifacts = match &config.app {
        AppConfig::Ios(ios) => ArtifactSet::Ios {
            test_bundle: artifact_reference("app.test_bundle", &ios.test_bundle)?,
            xcode_version: ios.xcode_version.clone(),
        },
        AppConfig::Android(android) => ArtifactSet::Android {
            app_apk: artifact_reference("app.app_apk", &android.app_apk)?,
            test_apk: artifact_reference("app.test_apk", &android.test_apk)?,
            test_targets: android.test_targets.clone(),
        },
    };

    let bucket = config
        .storage
        .bucket
        .as_deref()
        .map(normalize_bucket)
        .transpose()?;

    Ok(JobPlan {
        project: config.lab.project.trim().to_string(),
        artifacts,
        devices,
        timeout: Duration::from_secs(config.job.timeout_secs),
        flags: JobFlags {
            disable_video: config.job.disable_video,
            disable_metrics: config.job.disable_metrics,
            retry_on_failure: config.job.retry_on_failure,
            async_mode: config.job.async_mode,
        },
        bucket,
        results_prefix: config.storage.results_prefix.clone(),
    })
}

/// Fills in defaults and checks required device fields.
pub fn resolve_device(idx: usize, device: &DeviceConfig) -> LabResult<DeviceDescriptor> {
    let required = |value: &Option<String>, field: &str| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| LabError::config(format!("job.devices[{idx}] is missing '{field}'")))
    };

    let optional = |value: &Option<String>, default: &str| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(default)
            .to_string()
    };

    Ok(DeviceDescriptor {
        model: required(&device.model, "model")?,
        version: required(&device.version, "version")?,
        locale: optional(&device.locale, DEFAULT_LOCALE),
        orientation: optional(&device.orientation, DEFAULT_ORIENTATION),
    })
}

/// Accepts `name` or `gs://name[/]` and returns the bare bucket name.
pub fn normalize_bucket(raw: &str) -> LabResult<String> {
    let raw = raw.trim();
    let name = match raw.strip_prefix(GS_SCHEME) {
        Some(rest) => rest.trim_end_matches('/'),
        None if raw.contains("://") => {
            return Err(LabError::config(format!(
                "storage.bucket '{raw}' must be a bucket name or start with {GS_SCHEME}"
            )));
        }
        None => raw,
    };

    if !BUCKET_NAME.is_match(name) {
        return Err(LabError::config(format!(
            "storage.bucket '{raw}' is not a valid bucket name"
        )));
    }

    Ok(name.to_string())
}

/// Validates an artifact reference: a `gs://` reference or an existing local file.
fn artifact_reference(field: &str, raw: &str) -> LabResult<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(LabError::config(format!("{field} must not be empty")));
    }

    if raw.starts_with(GS_SCHEME) {
        if raw.len() == GS_SCHEME.len() {
            return Err(LabError::config(format!("{field} '{raw}' has no bucket")));
        }
        return Ok(raw.to_string());
    }

    if raw.contains("://") {
        return Err(LabError::config(format!(
            "{field} '{raw}' must be a local path or start with {GS_SCHEME}"
        )));
    }

    let expanded = shellexpand::tilde(raw).into_owned();
    if !Path::new(&expanded).is_file() {
        return Err(LabError::config(format!(
            "{field} '{expanded}' does not exist"
        )));
    }

    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const IOS_CONFIG: &str = r#"
        [lab]
        project = "my-project"

        [app]
        platform = "ios"
        test_bundle = "gs://my-bucket/tests.zip"
        xcode_version = "15.2"

        [job]
        timeout_secs = 600
        retry_on_failure = true

        [[job.devices]]
        model = "iphone13pro"
        version = "15.7"

        [[job.devices]]
        model = "iphone8"
        version = "14.0"
        locale = "fr_FR"
        orientation = "landscape"

        [storage]
        bucket = "gs://my-bucket/"
    "#;

    #[test]
    fn test_load_config_defaults() {
        let config = load_config_str(IOS_CONFIG).unwrap();
        assert_eq!(config.lab.poll_interval_secs, 15);
        assert_eq!(config.lab.request_timeout_secs, 15);
        assert_eq!(config.lab.connect_timeout_secs, 5);
        assert_eq!(config.lab.max_wait_secs, None);
        assert_eq!(config.auth.token_env, "DEVICELAB_ACCESS_TOKEN");
        assert_eq!(config.storage.gsutil, "gsutil");
        assert!(!config.download.enabled);
        assert!(!config.report.junit);
    }

    #[test]
    fn test_validate_fills_device_defaults() {
        let config = load_config_str(IOS_CONFIG).unwrap();
        let plan = validate(&config).unwrap();

        assert_eq!(plan.platform(), Platform::Ios);
        assert_eq!(plan.devices.len(), 2);
        assert_eq!(plan.devices[0].locale, "en_US");
        assert_eq!(plan.devices[0].orientation, "portrait");
        assert_eq!(plan.devices[1].locale, "fr_FR");
        assert_eq!(plan.devices[1].orientation, "landscape");
        assert_eq!(plan.bucket.as_deref(), Some("my-bucket"));
        assert_eq!(plan.timeout, Duration::from_secs(600));
        assert!(plan.flags.retry_on_failure);
        assert!(!plan.flags.async_mode);
    }

    #[test]
    fn test_validate_rejects_device_without_model() {
        let mut config = load_config_str(IOS_CONFIG).unwrap();
        config.job.devices[1].model = None;
        let err = validate(&config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains("job.devices[1]"));
        assert!(err.to_string().contains("model"));
    }

    #[test]
    fn test_validate_rejects_blank_version() {
        let mut config = load_config_str(IOS_CONFIG).unwrap();
        config.job.devices[0].version = Some("  ".to_string());
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_validate_rejects_empty_device_list() {
        let mut config = load_config_str(IOS_CONFIG).unwrap();
        config.job.devices.clear();
        assert_eq!(validate(&config).unwrap_err().kind(), ErrorKind::Config);
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = load_config_str(IOS_CONFIG).unwrap();
        config.job.timeout_secs = 0;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("timeout_secs"));
    }

    #[test]
    fn test_validate_rejects_zero_poll_interval() {
        let mut config = load_config_str(IOS_CONFIG).unwrap();
        config.lab.poll_interval_secs = 0;
        let err = validate(&config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains("poll_interval_secs"));

        config.lab.poll_interval_secs = 14;
        assert_eq!(validate(&config).unwrap_err().kind(), ErrorKind::Config);

        config.lab.poll_interval_secs = 15;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_http_timeouts() {
        let mut config = load_config_str(IOS_CONFIG).unwrap();
        config.lab.request_timeout_secs = 0;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("request_timeout_secs"));

        let mut config = load_config_str(IOS_CONFIG).unwrap();
        config.lab.connect_timeout_secs = 0;
        assert_eq!(validate(&config).unwrap_err().kind(), ErrorKind::Config);
    }

    #[test]
    fn test_validate_rejects_foreign_storage_scheme() {
        let mut config = load_config_str(IOS_CONFIG).unwrap();
        config.storage.bucket = Some("s3://my-bucket".to_string());
        assert_eq!(validate(&config).unwrap_err().kind(), ErrorKind::Config);

        let mut config = load_config_str(IOS_CONFIG).unwrap();
        config.app = AppConfig::Ios(IosAppConfig {
            test_bundle: "https://example.com/tests.zip".to_string(),
            xcode_version: None,
        });
        assert_eq!(validate(&config).unwrap_err().kind(), ErrorKind::Config);
    }

    #[test]
    fn test_validate_rejects_missing_local_artifact() {
        let mut config = load_config_str(IOS_CONFIG).unwrap();
        config.app = AppConfig::Ios(IosAppConfig {
            test_bundle: "/definitely/not/here/tests.zip".to_string(),
            xcode_version: None,
        });
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_validate_accepts_existing_local_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("tests.zip");
        std::fs::write(&bundle, b"zip").unwrap();

        let mut config = load_config_str(IOS_CONFIG).unwrap();
        config.app = AppConfig::Ios(IosAppConfig {
            test_bundle: bundle.to_string_lossy().to_string(),
            xcode_version: None,
        });
        let plan = validate(&config).unwrap();
        match plan.artifacts {
            ArtifactSet::Ios { test_bundle, .. } => {
                assert_eq!(test_bundle, bundle.to_string_lossy())
            }
            other => panic!("unexpected artifacts: {:?}", other),
        }
    }

    #[test]
    fn test_normalize_bucket() {
        assert_eq!(normalize_bucket("my-bucket").unwrap(), "my-bucket");
        assert_eq!(normalize_bucket("gs://my-bucket/").unwrap(), "my-bucket");
        assert!(normalize_bucket("gs://").is_err());
        assert!(normalize_bucket("My_Bucket!").is_err());
        assert!(normalize_bucket("gs://bucket/with/path").is_err());
    }

    #[test]
    fn test_android_config_parses() {
        let config = load_config_str(
            r#"
            [lab]
            project = "p"

            [app]
            platform = "android"
            app_apk = "gs://b/app.apk"
            test_apk = "gs://b/test.apk"
            test_targets = ["package com.example"]

            [job]
            async = true

            [[job.devices]]
            model = "Pixel2"
            version = "28"
            "#,
        )
        .unwrap();
        let plan = validate(&config).unwrap();
        assert_eq!(plan.platform(), Platform::Android);
        assert!(plan.flags.async_mode);
        assert_eq!(plan.bucket, None);
    }
}
