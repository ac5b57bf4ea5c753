//! Translation of a [`JobRequest`] into the Testing API submit payload.
//!
//! The builder is pure: no network, no validation. It expects a request that
//! already went through [`crate::config::validate`] (non-empty device list,
//! defaulted locale/orientation, positive timeout).
//!
//! The payload has one of two shapes depending on the platform:
//!
//! ```text
//! iOS                                   Android
//! testSpecification                     testSpecification
//!   iosXcTest { testsZip, xcodeVersion }  androidInstrumentationTest { appApk, testApk,
//!                                           orchestratorOption, testTargets }
//!                                         testSetup { environmentVariables }
//! environmentMatrix.iosDeviceList       environmentMatrix.androidDeviceList
//! ```

use serde::Serialize;

use crate::model::{ArtifactSet, DeviceDescriptor, JobRequest};

/// Client tag sent with every matrix unless overridden.
pub const DEFAULT_CLIENT_NAME: &str = "devicelab";

/// Orchestrator mode used for every Android instrumentation run.
const ANDROID_ORCHESTRATOR: &str = "USE_ORCHESTRATOR";

/// Environment variable injected into Android runs so each test starts clean.
const CLEAR_PACKAGE_DATA: (&str, &str) = ("clearPackageData", "true");

/// Body of `POST projects/{project}/testMatrices`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestMatrixPayload {
    pub test_specification: TestSpecification,
    pub environment_matrix: EnvironmentMatrix,
    pub result_storage: ResultStorage,
    pub flaky_test_attempts: u32,
    pub client_info: ClientInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSpecification {
    /// Protobuf duration, e.g. `"900s"`.
    pub test_timeout: String,
    pub disable_video_recording: bool,
    pub disable_performance_metrics: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ios_xc_test: Option<IosXcTest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub android_instrumentation_test: Option<AndroidInstrumentationTest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_setup: Option<TestSetup>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReference {
    pub gcs_path: String,
}

impl FileReference {
    fn new(gcs_path: &str) -> Self {
        Self {
            gcs_path: gcs_path.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IosXcTest {
    pub tests_zip: FileReference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xcode_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AndroidInstrumentationTest {
    pub app_apk: FileReference,
    pub test_apk: FileReference,
    pub orchestrator_option: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub test_targets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSetup {
    pub environment_variables: Vec<EnvironmentVariable>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentVariable {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentMatrix {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ios_device_list: Option<IosDeviceList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub android_device_list: Option<AndroidDeviceList>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IosDeviceList {
    pub ios_devices: Vec<IosDevice>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IosDevice {
    pub ios_model_id: String,
    pub ios_version_id: String,
    pub locale: String,
    pub orientation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AndroidDeviceList {
    pub android_devices: Vec<AndroidDevice>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AndroidDevice {
    pub android_model_id: String,
    pub android_version_id: String,
    pub locale: String,
    pub orientation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultStorage {
    pub google_cloud_storage: FileReference,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientInfo {
    pub name: String,
}

/// Builds submit payloads from job requests.
#[derive(Debug, Clone)]
pub struct JobSubmissionBuilder {
    client_name: String,
}

impl Default for JobSubmissionBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT_NAME)
    }
}

impl JobSubmissionBuilder {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
        }
    }

    /// Builds the payload for `request`.
    pub fn build(&self, request: &JobRequest) -> TestMatrixPayload {
        let mut spec = TestSpecification {
            test_timeout: format!("{}s", request.timeout.as_secs()),
            disable_video_recording: request.flags.disable_video,
            disable_performance_metrics: request.flags.disable_metrics,
            ios_xc_test: None,
            android_instrumentation_test: None,
            test_setup: None,
        };

        let environment_matrix = match &request.artifacts {
            ArtifactSet::Ios {
                test_bundle,
                xcode_version,
            } => {
                spec.ios_xc_test = Some(IosXcTest {
                    tests_zip: FileReference::new(test_bundle),
                    xcode_version: xcode_version.clone(),
                });
                EnvironmentMatrix {
                    ios_device_list: Some(IosDeviceList {
                        ios_devices: request.devices.iter().map(ios_device).collect(),
                    }),
                    android_device_list: None,
                }
            }
            ArtifactSet::Android {
                app_apk,
                test_apk,
                test_targets,
            } => {
                spec.android_instrumentation_test = Some(AndroidInstrumentationTest {
                    app_apk: FileReference::new(app_apk),
                    test_apk: FileReference::new(test_apk),
                    orchestrator_option: ANDROID_ORCHESTRATOR.to_string(),
                    test_targets: test_targets.clone(),
                });
                spec.test_setup = Some(TestSetup {
                    environment_variables: vec![EnvironmentVariable {
                        key: CLEAR_PACKAGE_DATA.0.to_string(),
                        value: CLEAR_PACKAGE_DATA.1.to_string(),
                    }],
                });
                EnvironmentMatrix {
                    ios_device_list: None,
                    android_device_list: Some(AndroidDeviceList {
                        android_devices: request.devices.iter().map(android_device).collect(),
                    }),
                }
            }
        };

        TestMatrixPayload {
            test_specification: spec,
            environment_matrix,
            result_storage: ResultStorage {
                google_cloud_storage: FileReference::new(&request.result_storage),
            },
            flaky_test_attempts: u32::from(request.flags.retry_on_failure),
            client_info: ClientInfo {
                name: self.client_name.clone(),
            },
        }
    }
}

fn ios_device(device: &DeviceDescriptor) -> IosDevice {
    IosDevice {
        ios_model_id: device.model.clone(),
        ios_version_id: device.version.clone(),
        locale: device.locale.clone(),
        orientation: device.orientation.clone(),
    }
}

fn android_device(device: &DeviceDescriptor) -> AndroidDevice {
    AndroidDevice {
        android_model_id: device.model.clone(),
        android_version_id: device.version.clone(),
        locale: device.locale.clone(),
        orientation: device.orientation.clone(),
    }
}
