//! Callbacks around [`crate::ProcessHandle::stop`].

use std::{
    io,
    path::{Path, PathBuf},
};

/// Caller code run during the stop sequence.
///
/// Both methods get the data directory and whether the supervisor allocated it (an
/// allocated directory is removed right after `before_cleanup` returns). A hook that
/// fails logs and returns; it never aborts the stop.
#[async_trait::async_trait]
pub trait StopHook: Send + Sync {
    /// Before the stop command is sent. The server may still be writing.
    async fn before_stop(&self, _data_dir: &Path, _allocated: bool) {}

    /// After the process has exited and its readers are joined, before the directory goes.
    async fn before_cleanup(&self, _data_dir: &Path, _allocated: bool) {}
}

/// Copies the database files into `destination` before the directory is removed.
///
/// Runs once the server is down, so the copy sees quiesced files.
#[derive(Debug, Clone)]
pub struct CopyDbFiles {
    destination: PathBuf,
}

impl CopyDbFiles {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }
}

#[async_trait::async_trait]
impl StopHook for CopyDbFiles {
    async fn before_cleanup(&self, data_dir: &Path, _allocated: bool) {
        match copy_tree(data_dir, &self.destination).await {
            Ok(files) => tracing::info!(
                from = %data_dir.display(),
                to = %self.destination.display(),
                files,
                "copied database files"
            ),
            Err(e) => tracing::warn!(
                from = %data_dir.display(),
                to = %self.destination.display(),
                error = %e,
                "could not copy database files"
            ),
        }
    }
}

/// Recursively copies the contents of `from` into `to`, creating `to` as needed.
/// Returns the number of files copied. Symlinks are skipped.
pub async fn copy_tree(from: &Path, to: &Path) -> io::Result<u64> {
    let mut copied = 0;
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];

    while let Some((src, dst)) = pending.pop() {
        tokio::fs::create_dir_all(&dst).await?;
        let mut entries = tokio::fs::read_dir(&src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let kind = entry.file_type().await?;
            let target = dst.join(entry.file_name());
            if kind.is_dir() {
                pending.push((entry.path(), target));
            } else if kind.is_file() {
                tokio::fs::copy(entry.path(), &target).await?;
                copied += 1;
            }
        }
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copy_tree_keeps_nested_layout() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("collection-0.wt"), b"data").unwrap();
        std::fs::create_dir(src.path().join("journal")).unwrap();
        std::fs::write(src.path().join("journal").join("WiredTigerLog.1"), b"log").unwrap();

        let dst = tempfile::tempdir().unwrap();
        let snapshot = dst.path().join("snapshot");
        assert_eq!(copy_tree(src.path(), &snapshot).await.unwrap(), 2);

        assert_eq!(std::fs::read(snapshot.join("collection-0.wt")).unwrap(), b"data");
        assert_eq!(
            std::fs::read(snapshot.join("journal").join("WiredTigerLog.1")).unwrap(),
            b"log"
        );
    }

    #[tokio::test]
    async fn copy_failure_does_not_panic() {
        let dst = tempfile::tempdir().unwrap();
        let hook = CopyDbFiles::new(dst.path().join("out"));
        hook.before_cleanup(&dst.path().join("missing"), true).await;
        assert!(copy_tree(&dst.path().join("missing"), &dst.path().join("x")).await.is_err());
    }
}
