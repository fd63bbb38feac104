// Object store backed by the `obsutil` command-line client.
//
// Every operation is a single `<tool> cp <src> <dst>` where bucket keys are
// written as `obs://<bucket>/<key>`. Uploads and downloads are staged in
// scratch files under the service work dir.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::{ObjectStore, StorageError};
use crate::executor::{CommandExecutor, CommandResult, ProcessCommandExecutor};

const NOT_FOUND_MARKERS: &[&str] = &["NoSuchKey", "404", "not exist"];

#[derive(Debug, Clone)]
pub struct ObsutilStore<E = ProcessCommandExecutor> {
    tool: PathBuf,
    bucket: String,
    scratch_dir: PathBuf,
    executor: Arc<E>,
}

impl ObsutilStore<ProcessCommandExecutor> {
    pub fn new(tool: impl Into<PathBuf>, bucket: &str, scratch_dir: impl Into<PathBuf>) -> Self {
        Self::with_executor(tool, bucket, scratch_dir, ProcessCommandExecutor)
    }
}

impl<E: CommandExecutor + 'static> ObsutilStore<E> {
    pub fn with_executor(
        tool: impl Into<PathBuf>,
        bucket: &str,
        scratch_dir: impl Into<PathBuf>,
        executor: E,
    ) -> Self {
        Self {
            tool: tool.into(),
            bucket: bucket.trim_matches('/').to_string(),
            scratch_dir: scratch_dir.into(),
            executor: Arc::new(executor),
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("obs://{}/{}", self.bucket, key.trim_start_matches('/'))
    }

    async fn cp(&self, key: &str, src: String, dst: String) -> Result<(), StorageError> {
        let executor = Arc::clone(&self.executor);
        let program = self.tool.to_string_lossy().into_owned();
        let cwd = self.scratch_dir.clone();
        debug!(%src, %dst, "storage copy");

        let result: CommandResult = tokio::task::spawn_blocking(move || {
            executor.execute(&program, &["cp".to_string(), src, dst], &cwd)
        })
        .await
        .map_err(|error| StorageError::Tool {
            key: key.to_string(),
            message: format!("storage task aborted: {error}"),
        })??;

        if result.success {
            return Ok(());
        }
        let output = if result.stderr.trim().is_empty() { &result.stdout } else { &result.stderr };
        Err(StorageError::Tool { key: key.to_string(), message: output.trim().to_string() })
    }
}

fn stage_upload(dir: &Path, content: &[u8]) -> Result<tempfile::NamedTempFile, std::io::Error> {
    let mut file = tempfile::Builder::new().prefix("upload").tempfile_in(dir)?;
    file.write_all(content)?;
    file.flush()?;
    Ok(file)
}

impl<E: CommandExecutor + 'static> ObjectStore for ObsutilStore<E> {
    async fn save_object(&self, key: &str, content: &[u8]) -> Result<(), StorageError> {
        let scratch_dir = self.scratch_dir.clone();
        let content = content.to_vec();
        let staged = tokio::task::spawn_blocking(move || stage_upload(&scratch_dir, &content))
            .await
            .map_err(|error| StorageError::Tool {
                key: key.to_string(),
                message: format!("upload staging aborted: {error}"),
            })??;
        let src = staged.path().to_string_lossy().into_owned();
        self.cp(key, src, self.object_url(key)).await
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let dir = tempfile::Builder::new().prefix("download").tempdir_in(&self.scratch_dir)?;
        let target = dir.path().join("object");

        match self.cp(key, self.object_url(key), target.to_string_lossy().into_owned()).await {
            Err(StorageError::Tool { message, .. })
                if NOT_FOUND_MARKERS.iter().any(|marker| message.contains(marker)) =>
            {
                Err(StorageError::NotFound { key: key.to_string() })
            }
            Err(error) => Err(error),
            Ok(()) => Ok(tokio::fs::read(&target).await?),
        }
    }

    async fn copy_object(&self, dst: &str, src: &str) -> Result<(), StorageError> {
        self.cp(dst, self.object_url(src), self.object_url(dst)).await
    }
}
