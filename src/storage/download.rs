//! Downloads result files after a run.
//!
//! With no file list the whole result tree is copied. With a file list, each
//! device folder under the result storage is listed and the requested files
//! are fetched into a folder of the same name.

use std::path::{Path, PathBuf};

use tracing::info;

use super::{BlobStore, with_trailing_slash};
use crate::error::LabResult;

/// Fetches result artifacts from the blob store.
pub struct ArtifactDownloader<'a, B> {
    store: &'a B,
    files: Vec<String>,
    output_dir: PathBuf,
}

impl<'a, B: BlobStore> ArtifactDownloader<'a, B> {
    /// # Arguments
    ///
    /// * `files` - Paths relative to each device folder. Empty downloads everything.
    /// * `output_dir` - Local directory receiving the files
    pub fn new(store: &'a B, files: Vec<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            files,
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Downloads from `result_storage` (a `gs://` folder reference).
    ///
    /// Returns the number of copy operations performed.
    pub async fn download(&self, result_storage: &str) -> LabResult<usize> {
        let source = with_trailing_slash(result_storage);

        if self.files.is_empty() {
            info!(
                "Downloading all results from {} to {}",
                source,
                self.output_dir.display()
            );
            self.store.download_tree(&source, &self.output_dir).await?;
            return Ok(1);
        }

        let folders = self.store.list_folders(&source).await?;
        info!(
            "Downloading {} file(s) from {} device folder(s) to {}",
            self.files.len(),
            folders.len(),
            self.output_dir.display()
        );

        let mut copies = 0;
        for folder in &folders {
            let dest = self.output_dir.join(folder);
            for file in &self.files {
                let object = format!("{source}{folder}/{}", file.trim_start_matches('/'));
                self.store.download_tree(&object, &dest).await?;
                copies += 1;
            }
        }
        Ok(copies)
    }
}
