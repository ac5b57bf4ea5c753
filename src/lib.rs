//! devicelab: run mobile test matrices on Firebase Test Lab from CI.
//!
//! A run submits a test matrix (an iOS XCTest bundle or an Android
//! instrumentation pair across a list of devices), polls the matrix until it
//! settles, and folds the per-device steps and test cases into one pass/fail
//! verdict plus a readable summary per device.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Submission**: Build the wire payload for a job ([`submission`])
//! - **Service**: Talk to the Testing and Tool Results APIs ([`service`])
//! - **Orchestrator**: Poll the matrix and aggregate its results ([`orchestrator`])
//! - **Storage**: Upload artifacts and download results ([`storage`])
//! - **Report**: Console and JUnit XML output ([`report`])
//!
//! # Example
//!
//! ```no_run
//! use devicelab::config::{load_config, validate};
//! use devicelab::orchestrator::{Orchestrator, RunSettings};
//! use devicelab::report::ConsoleReporter;
//! use devicelab::service::HttpTestLabClient;
//! use devicelab::storage::GsutilStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("devicelab.toml"))?;
//!     let plan = validate(&config)?;
//!
//!     let orchestrator = Orchestrator::new(
//!         plan,
//!         RunSettings::from_config(&config),
//!         HttpTestLabClient::from_config(&config.lab, &config.auth)?,
//!         GsutilStore::new(&config.storage.gsutil),
//!         ConsoleReporter::new(false),
//!     );
//!
//!     let outcome = orchestrator.run().await?;
//!     std::process::exit(outcome.exit_code());
//! }
//! ```

pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod report;
pub mod service;
pub mod storage;
pub mod submission;

// Re-export commonly used types
pub use config::{Config, JobPlan, load_config};
pub use error::{LabError, LabResult};
pub use model::{AggregateOutcome, DeviceSummary, JobRequest, MatrixState, TestMatrix};
pub use orchestrator::{Orchestrator, RunOutcome};
pub use report::Reporter;
pub use service::TestLabService;
pub use storage::BlobStore;
