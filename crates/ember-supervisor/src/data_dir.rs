use std::path::{Path, PathBuf};

use crate::error::ConfigError;

const TEMP_PREFIX: &str = "ember-db-";

/// Database directory for one launch attempt.
///
/// Directories allocated here are owned by the launch and removed on stop;
/// caller-supplied ones are never touched.
#[derive(Debug, Clone)]
pub struct DataDir {
    path: PathBuf,
    allocated: bool,
}

impl DataDir {
    /// Uses `supplied` as is, or creates a fresh directory under `temp_root`
    /// (the system temp dir when unset).
    pub fn resolve(supplied: Option<&Path>, temp_root: Option<&Path>) -> Result<Self, ConfigError> {
        match (supplied, temp_root) {
            (Some(path), _) => Ok(Self {
                path: path.to_path_buf(),
                allocated: false,
            }),
            (None, Some(root)) => Self::allocate_in(root),
            (None, None) => Self::allocate_in(&std::env::temp_dir()),
        }
    }

    pub fn allocate_in(parent: &Path) -> Result<Self, ConfigError> {
        let path = parent.join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&path).map_err(|e| ConfigError::DataDir {
            path: path.clone(),
            source: e,
        })?;
        Ok(Self {
            path,
            allocated: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    /// Removes the directory tree if it was allocated by [`DataDir::resolve`].
    /// Returns whether anything was removed.
    pub async fn remove(&self) -> std::io::Result<bool> {
        if !self.allocated {
            return Ok(false);
        }
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}
