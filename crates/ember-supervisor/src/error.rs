use std::{io, path::PathBuf, time::Duration};

use ember_process::{Platform, Version};

use crate::shutdown::StopReport;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not create data directory {}", .path.display())]
    DataDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("port already in use: {0}")]
    PortInUse(u16),
    #[error("bind port {port}")]
    Port {
        port: u16,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("executable not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("not an executable file: {}", .0.display())]
    NotExecutable(PathBuf),
    #[error("{0}")]
    Other(String),
}

/// Failures surfaced synchronously by [`crate::Supervisor::launch`].
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("resolve launch configuration")]
    Config(#[from] ConfigError),
    #[error("resolve server executable for {version} on {platform:?}")]
    Artifact {
        version: Version,
        platform: Platform,
        #[source]
        source: ArtifactError,
    },
    #[error("spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("process did not signal readiness within {}ms", .timeout.as_millis())]
    StartupTimeout {
        timeout: Duration,
        teardown: StopReport,
    },
    #[error("process exited before signalling readiness (exit code {exit_code:?})")]
    ExitedBeforeReady {
        exit_code: Option<i32>,
        teardown: StopReport,
    },
}

impl LaunchError {
    /// Teardown report for failures that happened after the process was spawned.
    pub fn teardown(&self) -> Option<&StopReport> {
        match self {
            LaunchError::StartupTimeout { teardown, .. }
            | LaunchError::ExitedBeforeReady { teardown, .. } => Some(teardown),
            _ => None,
        }
    }
}

/// Failure modes of the administrative stop command.
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    /// The server closed the connection without replying. Expected on a successful shutdown.
    #[error("connection reset by peer")]
    PeerReset,
    #[error("connect to {addr}")]
    Connect {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("shutdown command timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("shutdown command i/o")]
    Io(#[from] io::Error),
}

impl ShutdownError {
    pub fn is_peer_reset(&self) -> bool {
        matches!(self, ShutdownError::PeerReset)
    }
}
