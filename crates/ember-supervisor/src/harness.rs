//! A disposable server for integration tests, started with one call.

use std::sync::Arc;

use ember_process::Version;

use crate::{
    artifact::ArtifactProvider,
    config::{CmdOptions, LaunchConfig, LaunchConfigBuilder},
    error::LaunchError,
    handle::ProcessHandle,
    shutdown::StopReport,
    supervisor::Supervisor,
};

/// Release used when a test does not ask for one.
pub const PRODUCTION_VERSION: Version = Version::new(7, 0, 0);

/// A running server on a free port with a throwaway data directory.
///
/// Call [`TestMongod::shutdown`] when done; dropping it kills the server without cleanup.
#[derive(Debug)]
pub struct TestMongod {
    handle: ProcessHandle,
}

impl TestMongod {
    /// Starts [`PRODUCTION_VERSION`] with the default supervisor.
    pub async fn start(artifacts: Arc<dyn ArtifactProvider>) -> Result<Self, LaunchError> {
        Self::start_with(&Supervisor::new(artifacts), PRODUCTION_VERSION).await
    }

    pub async fn start_with(supervisor: &Supervisor, version: Version) -> Result<Self, LaunchError> {
        let config = Self::config(version).build()?;
        let handle = supervisor.launch(Arc::new(config)).await?;
        Ok(Self { handle })
    }

    /// Config used by the harness: free port, and the legacy file-preallocation flags
    /// switched off for releases that no longer accept them.
    pub fn config(version: Version) -> LaunchConfigBuilder {
        let mut options = CmdOptions::default();
        if version.is_newer_or_equal(4, 2, 0) {
            options.use_no_prealloc = false;
            options.use_small_files = false;
        }
        LaunchConfig::builder(version).port(0).cmd_options(options)
    }

    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    /// `mongodb://host:port` for the running server.
    pub fn connection_string(&self) -> String {
        let config = self.handle.config();
        let host = config.host();
        if host.contains(':') && !host.starts_with('[') {
            format!("mongodb://[{host}]:{}", config.port())
        } else {
            format!("mongodb://{host}:{}", config.port())
        }
    }

    /// A database name no other test uses.
    pub fn new_database_name(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub async fn shutdown(self) -> StopReport {
        self.handle.stop().await
    }
}
