use std::path::PathBuf;

use ember_process::{Platform, Version};

use crate::error::ArtifactError;

/// Resolves the server executable for a version and platform.
#[async_trait::async_trait]
pub trait ArtifactProvider: Send + Sync {
    async fn resolve_executable(
        &self,
        version: &Version,
        platform: &Platform,
    ) -> Result<PathBuf, ArtifactError>;
}

/// A `mongod` binary already on local disk.
#[derive(Debug, Clone)]
pub struct LocalExecutable(pub PathBuf);

#[async_trait::async_trait]
impl ArtifactProvider for LocalExecutable {
    async fn resolve_executable(
        &self,
        _version: &Version,
        _platform: &Platform,
    ) -> Result<PathBuf, ArtifactError> {
        let meta = match tokio::fs::metadata(&self.0).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArtifactError::NotFound(self.0.clone()));
            }
            Err(e) => return Err(ArtifactError::Other(format!("{}: {e}", self.0.display()))),
        };
        if !meta.is_file() {
            return Err(ArtifactError::NotExecutable(self.0.clone()));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if meta.permissions().mode() & 0o111 == 0 {
                return Err(ArtifactError::NotExecutable(self.0.clone()));
            }
        }

        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use ember_process::{Arch, Os};

    use super::*;

    const PLATFORM: Platform = Platform::new(Os::Linux, Arch::X86_64);

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let exe = LocalExecutable(dir.path().join("mongod"));
        let err = exe
            .resolve_executable(&Version::new(4, 4, 0), &PLATFORM)
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::NotFound(_)));
    }

    #[tokio::test]
    async fn directory_is_not_executable() {
        let dir = tempfile::tempdir().unwrap();
        let exe = LocalExecutable(dir.path().to_path_buf());
        let err = exe
            .resolve_executable(&Version::new(4, 4, 0), &PLATFORM)
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::NotExecutable(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn executable_bit_is_required() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mongod");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let exe = LocalExecutable(path.clone());
        assert!(exe.resolve_executable(&Version::new(4, 4, 0), &PLATFORM).await.is_err());

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(
            exe.resolve_executable(&Version::new(4, 4, 0), &PLATFORM).await.unwrap(),
            path
        );
    }
}
