use std::{
    fmt,
    net::SocketAddr,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use ember_process::{LaunchId, LaunchState, LaunchStatus};

use crate::{
    command_line::ArgumentVector,
    config::LaunchConfig,
    data_dir::DataDir,
    exit::{ExitInfo, ExitWatcher},
    fanout::OutputReader,
    observer::Observer,
    shutdown::{self, StopReport},
    transport::{ShutdownTransport, WireProtocol},
};

/// A supervised `mongod` process.
///
/// Call [`ProcessHandle::stop`] to shut it down. Dropping a handle that was never stopped
/// kills the process but leaves its data directory behind.
pub struct ProcessHandle {
    id: LaunchId,
    config: Arc<LaunchConfig>,
    args: ArgumentVector,
    pid: Option<u32>,
    data_dir: DataDir,
    wire: WireProtocol,
    transport: Arc<dyn ShutdownTransport>,
    stdout: OutputReader,
    stderr: Option<OutputReader>,
    exit: ExitWatcher,
    state: Mutex<LaunchState>,
    stopped: tokio::sync::Mutex<Option<StopReport>>,
}

pub(crate) struct HandleParts {
    pub(crate) id: LaunchId,
    pub(crate) config: Arc<LaunchConfig>,
    pub(crate) args: ArgumentVector,
    pub(crate) pid: Option<u32>,
    pub(crate) data_dir: DataDir,
    pub(crate) wire: WireProtocol,
    pub(crate) transport: Arc<dyn ShutdownTransport>,
    pub(crate) stdout: OutputReader,
    pub(crate) stderr: Option<OutputReader>,
    pub(crate) exit: ExitWatcher,
}

impl ProcessHandle {
    pub(crate) fn new(parts: HandleParts) -> Self {
        Self {
            id: parts.id,
            config: parts.config,
            args: parts.args,
            pid: parts.pid,
            data_dir: parts.data_dir,
            wire: parts.wire,
            transport: parts.transport,
            stdout: parts.stdout,
            stderr: parts.stderr,
            exit: parts.exit,
            state: Mutex::new(LaunchState::StreamsAttached),
            stopped: tokio::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &LaunchId {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Address clients should connect to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.config.host(), self.config.port())
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.data_dir
    }

    pub fn data_path(&self) -> &Path {
        self.data_dir.path()
    }

    pub fn args(&self) -> &ArgumentVector {
        &self.args
    }

    pub fn config(&self) -> &Arc<LaunchConfig> {
        &self.config
    }

    pub fn shutdown_address(&self) -> SocketAddr {
        self.config.shutdown_address()
    }

    pub fn state(&self) -> LaunchState {
        let state = *self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state == LaunchState::Running && !self.is_running() {
            LaunchState::Stopped
        } else {
            state
        }
    }

    pub(crate) fn set_state(&self, state: LaunchState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn status(&self) -> LaunchStatus {
        LaunchStatus {
            id: self.id.clone(),
            state: self.state(),
            version: self.config.version(),
            pid: self.pid,
            host: self.config.host().to_string(),
            port: self.config.port(),
            data_dir: self.data_dir.path().to_path_buf(),
            args: self.args.as_slice().to_vec(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.exit.is_running()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.exit_info()
    }

    /// Waits up to `timeout` for the process to exit on its own.
    pub async fn wait_for_exit(&self, timeout: Duration) -> Option<ExitInfo> {
        self.exit.wait(timeout).await
    }

    pub fn register_stdout_observer(&self, observer: Arc<dyn Observer>) {
        self.stdout.register(observer);
    }

    /// With merged streams the observer is attached to the combined output.
    pub fn register_stderr_observer(&self, observer: Arc<dyn Observer>) {
        match &self.stderr {
            Some(reader) => reader.register(observer),
            None => self.stdout.register(observer),
        }
    }

    /// Shuts the process down and releases its resources.
    ///
    /// Only the first call runs the sequence; concurrent callers wait for it and every later
    /// call gets a copy of its report with `performed` unset.
    pub async fn stop(&self) -> StopReport {
        let mut stopped = self.stopped.lock().await;
        if let Some(first) = stopped.as_ref() {
            return first.repeat();
        }

        self.set_state(LaunchState::Stopping);
        let report = shutdown::run(self, self.transport.as_ref()).await;
        self.set_state(LaunchState::Stopped);
        *stopped = Some(report.clone());
        report
    }

    pub(crate) fn wire(&self) -> WireProtocol {
        self.wire
    }

    pub(crate) fn exit_watcher(&self) -> &ExitWatcher {
        &self.exit
    }

    pub(crate) fn stdout_reader(&self) -> &OutputReader {
        &self.stdout
    }

    pub(crate) fn stderr_reader(&self) -> Option<&OutputReader> {
        self.stderr.as_ref()
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("address", &self.address())
            .field("data_dir", &self.data_dir.path())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.stopped.get_mut().is_none() && self.exit.is_running() {
            tracing::warn!(
                pid = self.pid,
                data_dir = %self.data_dir.path().display(),
                "process handle dropped without stop; killing mongod"
            );
            self.exit.kill();
        }
    }
}
