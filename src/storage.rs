//! Blob store used for artifacts and results.
//!
//! [`BlobStore`] has three operations: upload a local file, download a tree
//! (or a single object), and list the folders directly under a prefix.
//! [`GsutilStore`] implements them by shelling out to `gsutil`, so whatever
//! credentials `gsutil` is configured with are the ones used.

pub mod download;

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{LabError, LabResult};

pub use download::ArtifactDownloader;

/// Generic blob store client.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Uploads `local` to `destination` and returns the destination reference.
    async fn upload(&self, local: &Path, destination: &str) -> LabResult<String>;

    /// Copies everything under `source` (or the single object it names) into
    /// `dest_dir`.
    async fn download_tree(&self, source: &str, dest_dir: &Path) -> LabResult<()>;

    /// Lists folder names directly under `source`, without the prefix or
    /// trailing slash.
    async fn list_folders(&self, source: &str) -> LabResult<Vec<String>>;
}

/// [`BlobStore`] backed by the `gsutil` command.
pub struct GsutilStore {
    /// Base command, e.g. `gsutil` or `python3 /opt/gsutil/gsutil`.
    command: String,
    timeout: Duration,
}

impl GsutilStore {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: Duration::from_secs(3600),
        }
    }

    fn command_parts(&self) -> LabResult<Vec<String>> {
        let parts = shell_words::split(&self.command)
            .map_err(|e| LabError::config(format!("invalid gsutil command: {e}")))?;
        if parts.is_empty() {
            return Err(LabError::config("storage.gsutil must not be empty"));
        }
        Ok(parts)
    }

    async fn run(&self, args: Vec<String>) -> LabResult<String> {
        let mut parts = self.command_parts()?;
        parts.extend(args);

        debug!("Running storage command: {:?}", parts);

        let mut cmd = tokio::process::Command::new(&parts[0]);
        cmd.args(&parts[1..]);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| LabError::Storage(format!("{} timed out", parts.join(" "))))?
            .map_err(|e| LabError::Storage(format!("failed to run {}: {}", parts[0], e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LabError::Storage(format!(
                "{} exited with {}: {}",
                parts.join(" "),
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl BlobStore for GsutilStore {
    async fn upload(&self, local: &Path, destination: &str) -> LabResult<String> {
        self.run(upload_args(local, destination)).await?;
        Ok(destination.to_string())
    }

    async fn download_tree(&self, source: &str, dest_dir: &Path) -> LabResult<()> {
        tokio::fs::create_dir_all(dest_dir).await?;
        self.run(download_args(source, dest_dir)).await?;
        Ok(())
    }

    async fn list_folders(&self, source: &str) -> LabResult<Vec<String>> {
        let stdout = self.run(list_args(source)).await?;
        Ok(parse_folder_listing(source, &stdout))
    }
}

fn upload_args(local: &Path, destination: &str) -> Vec<String> {
    vec![
        "cp".to_string(),
        local.to_string_lossy().into_owned(),
        destination.to_string(),
    ]
}

fn download_args(source: &str, dest_dir: &Path) -> Vec<String> {
    vec![
        "-m".to_string(),
        "cp".to_string(),
        "-r".to_string(),
        source.to_string(),
        dest_dir.to_string_lossy().into_owned(),
    ]
}

fn list_args(source: &str) -> Vec<String> {
    vec!["ls".to_string(), with_trailing_slash(source)]
}

/// Extracts the folder names from `gsutil ls` output.
///
/// Objects (lines without a trailing slash) are ignored.
fn parse_folder_listing(source: &str, stdout: &str) -> Vec<String> {
    let prefix = with_trailing_slash(source);
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.ends_with('/'))
        .filter_map(|line| line.strip_prefix(prefix.as_str()))
        .map(|name| name.trim_end_matches('/').to_string())
        .filter(|name| !name.is_empty() && !name.contains('/'))
        .collect()
}

pub(crate) fn with_trailing_slash(reference: &str) -> String {
    if reference.ends_with('/') {
        reference.to_string()
    } else {
        format!("{reference}/")
    }
}
