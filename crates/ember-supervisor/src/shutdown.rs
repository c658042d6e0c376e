use crate::{handle::ProcessHandle, transport::ShutdownTransport};

/// What became of the administrative stop command.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum ShutdownCommandOutcome {
    /// The process was already gone.
    NotSent,
    Acknowledged,
    /// The server hung up without replying; the normal case.
    PeerReset,
    Failed(String),
}

/// Record of one pass through the stop sequence.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StopReport {
    /// False for every call after the first.
    pub performed: bool,
    pub shutdown_command: ShutdownCommandOutcome,
    pub exited_naturally: bool,
    pub forced_kill: bool,
    pub readers_joined: bool,
    pub data_dir_removed: bool,
}

impl StopReport {
    pub(crate) fn repeat(&self) -> Self {
        Self {
            performed: false,
            ..self.clone()
        }
    }
}

/// Stop command, bounded wait, forced kill, reader join, directory removal.
///
/// Every tier is bounded by the configured shutdown timeout and failures are logged,
/// never raised. Stop hooks run before the command and again before the removal.
pub(crate) async fn run(handle: &ProcessHandle, transport: &dyn ShutdownTransport) -> StopReport {
    let timeout = handle.config().shutdown_timeout();
    let pid = handle.pid();
    let data_dir = handle.data_dir();
    let hooks = handle.config().stop_hooks();

    for hook in hooks {
        hook.before_stop(data_dir.path(), data_dir.is_allocated()).await;
    }

    let shutdown_command = if handle.is_running() {
        let addr = handle.config().shutdown_address();
        tracing::info!(pid, %addr, "sending shutdown command");
        match tokio::time::timeout(timeout, transport.send_shutdown(addr, handle.wire())).await {
            Ok(Ok(())) => ShutdownCommandOutcome::Acknowledged,
            Ok(Err(e)) if e.is_peer_reset() => {
                tracing::debug!(pid, "server closed the connection on shutdown");
                ShutdownCommandOutcome::PeerReset
            }
            Ok(Err(e)) => {
                tracing::warn!(pid, error = %e, "shutdown command failed");
                ShutdownCommandOutcome::Failed(e.to_string())
            }
            Err(_) => {
                tracing::warn!(pid, "shutdown command timed out after {}ms", timeout.as_millis());
                ShutdownCommandOutcome::Failed(format!(
                    "timed out after {}ms",
                    timeout.as_millis()
                ))
            }
        }
    } else {
        ShutdownCommandOutcome::NotSent
    };

    let exited_naturally = handle.exit_watcher().wait(timeout).await.is_some();
    let mut forced_kill = false;
    if !exited_naturally {
        tracing::warn!(pid, "mongod still running after {}ms; killing", timeout.as_millis());
        forced_kill = true;
        handle.exit_watcher().kill();
        if handle.exit_watcher().wait(timeout).await.is_none() {
            tracing::error!(pid, "mongod survived forced kill");
        }
    }

    let mut readers_joined = handle.stdout_reader().join(timeout).await;
    if let Some(reader) = handle.stderr_reader() {
        readers_joined &= reader.join(timeout).await;
    }

    for hook in hooks {
        hook.before_cleanup(data_dir.path(), data_dir.is_allocated()).await;
    }

    let data_dir_removed = match data_dir.remove().await {
        Ok(removed) => removed,
        Err(e) => {
            tracing::warn!(
                path = %data_dir.path().display(),
                error = %e,
                "could not remove data directory"
            );
            false
        }
    };

    tracing::info!(pid, forced_kill, data_dir_removed, "mongod stopped");

    StopReport {
        performed: true,
        shutdown_command,
        exited_naturally,
        forced_kill,
        readers_joined,
        data_dir_removed,
    }
}
